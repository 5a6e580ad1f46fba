//! Shared fixtures for the integration tests

#![allow(dead_code)]

use objlink::{
    Envelope, FrameReader, FrameWriter, LinkConfig, LinkEngine, LinkError, LinkServer,
    ServerConfig, WrapperFactory,
};
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const SECRET: &str = "test-secret";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// A link server running in a background task, stoppable for reconnect
/// scenarios.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<LinkServer>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Trigger graceful shutdown and wait for every session to close.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// Start a server on an ephemeral port with the standard test types.
pub async fn start_test_server() -> TestServer {
    start_test_server_at("127.0.0.1:0".parse().unwrap()).await
}

/// Start a server bound to a specific address (reconnect tests re-bind the
/// port a previous instance used, so binding is retried while the old
/// listener finishes dying).
pub async fn start_test_server_at(addr: SocketAddr) -> TestServer {
    for _ in 0..50 {
        let server = Arc::new(LinkServer::new(
            ServerConfig::new(SECRET).listen_on(vec![addr]),
        ));
        register_test_types(server.factory());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move {
            let _ = running
                .run_until(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        if let Some(addr) = wait_for_bind(&server, &task).await {
            return TestServer {
                addr,
                server,
                shutdown: Some(shutdown_tx),
                task,
            };
        }

        task.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server did not bind {}", addr);
}

async fn wait_for_bind(server: &Arc<LinkServer>, task: &JoinHandle<()>) -> Option<SocketAddr> {
    for _ in 0..200 {
        if let Some(addr) = server.local_addrs().first().copied() {
            return Some(addr);
        }
        if task.is_finished() {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// Register the object types the tests exercise.
pub fn register_test_types(factory: &Arc<WrapperFactory>) {
    factory.register("RelayInterface", |ctx| {
        let state = Arc::new(Mutex::new("Open".to_owned()));
        let read_state = Arc::clone(&state);
        let toggle_state = Arc::clone(&state);
        let events = ctx.events.clone();

        Ok(ctx
            .builder()
            .read("State", move || Ok(json!(*read_state.lock())))
            .read_write("Label", || Ok(json!("spare")), |_| Ok(()))
            .method("Toggle", move |_args| {
                let state = Arc::clone(&toggle_state);
                let events = events.clone();
                async move {
                    let next = {
                        let mut s = state.lock();
                        *s = if *s == "Open" {
                            "Closed".to_owned()
                        } else {
                            "Open".to_owned()
                        };
                        s.clone()
                    };
                    events.update("State", json!(next));
                    Ok(json!(next))
                }
            })
            .build())
    });

    factory.register("EchoDevice", |ctx| {
        Ok(ctx
            .builder()
            .method("Echo", |args| async move {
                Ok(args.into_iter().next().unwrap_or(serde_json::Value::Null))
            })
            .method("Fail", |_args| async {
                Err(LinkError::MalformedFrame("deliberate failure".into()))
            })
            .build())
    });

    factory.register("SlowDevice", |ctx| {
        Ok(ctx
            .builder()
            .method("Stall", |_args| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            })
            .build())
    });

    factory.register("FlakyDevice", |_ctx| {
        Err(LinkError::MalformedFrame("hardware absent".into()))
    });
}

/// Connect an engine with test-friendly intervals and wait for the link.
pub async fn connect_client(addr: SocketAddr) -> LinkEngine {
    let engine = LinkEngine::connect(
        LinkConfig::new(addr, SECRET)
            .reconnect_interval(Duration::from_millis(100))
            .keepalive_interval(Duration::from_secs(1))
            .query_timeout(Duration::from_secs(2)),
    );
    timeout(Duration::from_secs(5), engine.wait_connected())
        .await
        .expect("client did not connect within 5s");
    engine
}

/// Hand-driven protocol session for tests that need wire-level control.
pub struct RawSession {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl RawSession {
    /// Connect without authenticating.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
        }
    }

    /// Connect and send the shared secret.
    pub async fn connect_authenticated(addr: SocketAddr) -> Self {
        let mut session = Self::connect(addr).await;
        session.send(SECRET).await;
        session
    }

    pub async fn send(&mut self, frame: &str) {
        self.writer.write_frame(frame).await.expect("write failed");
    }

    pub async fn recv(&mut self) -> String {
        timeout(Duration::from_secs(5), self.reader.next_frame())
            .await
            .expect("no frame within 5s")
            .expect("read failed")
    }

    pub async fn recv_envelope(&mut self) -> Envelope {
        let frame = self.recv().await;
        Envelope::parse(&frame).expect("unparseable envelope")
    }

    /// Expect silence on this session for the given window.
    pub async fn expect_nothing(&mut self, window: Duration) {
        if let Ok(frame) = timeout(window, self.reader.next_frame()).await {
            panic!("expected no frame, got {:?}", frame);
        }
    }

    /// Expect the peer to close the connection within the given window.
    pub async fn expect_closed(&mut self, window: Duration) {
        match timeout(window, self.reader.next_frame()).await {
            Ok(Err(_)) => {}
            Ok(Ok(frame)) => panic!("expected close, got frame {:?}", frame),
            Err(_) => panic!("connection not closed within {:?}", window),
        }
    }
}
