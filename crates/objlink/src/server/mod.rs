//! Server link listener
//!
//! Listens on a fixed port per logical network interface (several
//! independent listeners may serve the same object set), accepts multiple
//! concurrent client sockets up to a configured maximum, authenticates
//! each against the shared secret, and fans frames in and out of the
//! shared dispatcher.
//!
//! # Scalability
//!
//! - Each connection runs in its own Tokio task
//! - A semaphore shared across listeners limits concurrent clients
//! - Registries are shared via `Arc`; locks are structure-scoped
//! - Dispatch workers are spawned per frame, so a slow handler never
//!   stalls frame parsing

mod dispatch;
mod nodes;
mod session;

pub use nodes::NodeTable;
pub use session::{Session, SessionMap};

use crate::envelope::ALIAS_SEPARATOR;
use crate::error::{LinkError, Result};
use crate::framing::{FrameReader, FrameWriter};
use crate::version;
use crate::wrapper::{UpdateSink, WrapperFactory};
use dispatch::{run_creation_worker, CreateJob, Dispatcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Well-known default listening port.
pub const DEFAULT_PORT: u16 = 42700;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// One listener is bound per address (one per logical interface).
    pub listen: Vec<SocketAddr>,
    /// Shared static token expected as the first frame of every connection.
    pub secret: String,
    /// Maximum concurrent client sockets across all listeners.
    pub max_clients: usize,
    /// Minimum compatible client protocol version, if enforced.
    pub min_version: Option<String>,
    /// Bound on queued, not-yet-constructed creation requests.
    pub creation_queue_depth: usize,
}

impl ServerConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            listen: vec![SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))],
            secret: secret.into(),
            max_clients: 64,
            min_version: None,
            creation_queue_depth: 32,
        }
    }

    /// Replace the listener set.
    pub fn listen_on(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.listen = addrs;
        self
    }

    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn min_version(mut self, version: impl Into<String>) -> Self {
        self.min_version = Some(version.into());
        self
    }
}

/// Server statistics
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub auth_failures: AtomicU64,
    pub frames_received: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub nodes_created: AtomicU64,
    pub updates_fanned_out: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            updates_fanned_out: self.updates_fanned_out.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of server statistics
#[derive(Debug, Clone)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub auth_failures: u64,
    pub frames_received: u64,
    pub dispatch_failures: u64,
    pub nodes_created: u64,
    pub updates_fanned_out: u64,
}

/// The server end of the object link.
///
/// Owns the node registry, the wrapper factory, the session table and the
/// creation queue; `start`/`run`/`run_until` bind the configured listeners
/// around them. Registries have explicit lifecycle: constructed here, no
/// process-wide statics.
pub struct LinkServer {
    config: ServerConfig,
    nodes: Arc<NodeTable>,
    factory: Arc<WrapperFactory>,
    sessions: Arc<SessionMap>,
    stats: Arc<ServerStats>,
    dispatcher: Arc<Dispatcher>,
    creation_rx: Mutex<Option<mpsc::Receiver<CreateJob>>>,
    limiter: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
}

impl LinkServer {
    pub fn new(config: ServerConfig) -> Self {
        let nodes = Arc::new(NodeTable::new());
        let sessions = Arc::new(SessionMap::new());
        let stats = Arc::new(ServerStats::default());
        let (creation_tx, creation_rx) = mpsc::channel(config.creation_queue_depth.max(1));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&nodes),
            Arc::clone(&sessions),
            creation_tx,
            Arc::clone(&stats),
        ));
        let limiter = Arc::new(Semaphore::new(config.max_clients));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            nodes,
            factory: Arc::new(WrapperFactory::new()),
            sessions,
            stats,
            dispatcher,
            creation_rx: Mutex::new(Some(creation_rx)),
            limiter,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            local_addrs: Mutex::new(Vec::new()),
        }
    }

    /// The wrapper-constructor registry.
    pub fn factory(&self) -> &Arc<WrapperFactory> {
        &self.factory
    }

    /// The node registry.
    pub fn nodes(&self) -> &Arc<NodeTable> {
        &self.nodes
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Addresses actually bound (useful when a configured port is 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    /// Event sink for pushing updates on an alias from outside a wrapper
    /// constructor (e.g. a hardware poller owned by the embedding program).
    pub fn update_sink(&self, alias: &str) -> UpdateSink {
        dispatch::update_sink(alias, &self.sessions, &self.stats)
    }

    /// Bind every configured listener and spawn the accept loops and the
    /// creation worker. Returns the bound addresses.
    ///
    /// Failure to bind is fatal: nothing is spawned and the error is
    /// returned.
    pub async fn start(&self) -> Result<Vec<SocketAddr>> {
        let mut listeners = Vec::with_capacity(self.config.listen.len());
        for addr in &self.config.listen {
            let listener = TcpListener::bind(addr).await?;
            let local = listener.local_addr()?;
            info!(
                %local,
                max_clients = self.config.max_clients,
                "link server listening"
            );
            listeners.push(listener);
        }

        let addrs: Vec<SocketAddr> = listeners
            .iter()
            .map(|l| l.local_addr())
            .collect::<std::io::Result<_>>()?;
        *self.local_addrs.lock() = addrs.clone();

        let mut tasks = self.tasks.lock();

        if let Some(jobs) = self.creation_rx.lock().take() {
            tasks.push(tokio::spawn(run_creation_worker(
                jobs,
                Arc::clone(&self.nodes),
                Arc::clone(&self.sessions),
                Arc::clone(&self.factory),
                Arc::clone(&self.stats),
            )));
        }

        for listener in listeners {
            tasks.push(tokio::spawn(accept_loop(
                listener,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.sessions),
                Arc::clone(&self.stats),
                Arc::clone(&self.limiter),
                self.config.clone(),
                self.shutdown.subscribe(),
            )));
        }

        Ok(addrs)
    }

    /// Run until the shutdown future resolves, then stop accepting, close
    /// every session and wait for connection tasks to drain.
    pub async fn run_until<F: std::future::Future<Output = ()>>(&self, shutdown: F) -> Result<()> {
        self.start().await?;
        shutdown.await;

        info!("link server shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // Every connection task holds a permit; reacquiring them all means
        // the sessions have drained.
        let _ = self
            .limiter
            .acquire_many(self.config.max_clients as u32)
            .await;
        info!("all sessions closed");
        Ok(())
    }

    /// Run forever (until the process is torn down).
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionMap>,
    stats: Arc<ServerStats>,
    limiter: Arc<Semaphore>,
    config: ServerConfig,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let permit = match Arc::clone(&limiter).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(%peer, "client limit reached, rejecting connection");
                drop(stream);
                continue;
            }
        };

        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        debug!(%peer, "accepted connection");

        let dispatcher = Arc::clone(&dispatcher);
        let sessions = Arc::clone(&sessions);
        let stats = Arc::clone(&stats);
        let config = config.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            // Permit is held until this task completes.
            let _permit = permit;

            let result =
                handle_connection(stream, peer, dispatcher, &sessions, &stats, &config, shutdown)
                    .await;

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);

            match result {
                Ok(()) | Err(LinkError::ConnectionClosed) => {
                    debug!(%peer, "connection closed");
                }
                Err(e) => {
                    warn!(%peer, error = %e, "connection error");
                }
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    sessions: &Arc<SessionMap>,
    stats: &Arc<ServerStats>,
    config: &ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let session = sessions.insert(peer, outbound);

    let writer = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        while let Some(frame) = outbound_rx.recv().await {
            if writer.write_frame(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut reader = FrameReader::new(read_half);
    let result = loop {
        let frame = tokio::select! {
            frame = reader.next_frame() => frame,
            _ = shutdown.changed() => break Ok(()),
        };

        match frame {
            Ok(frame) => {
                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                let outcome = if session.is_authenticated() {
                    dispatcher.handle_frame(&session, frame)
                } else {
                    authenticate(&session, &frame, config, stats)
                };
                if let Err(e) = outcome {
                    break Err(e);
                }
            }
            Err(e) => break Err(e),
        }
    };

    sessions.remove(session.id());
    drop(session);
    // Dispatch workers may still hold the session briefly; don't wait for
    // them to release the outbound queue.
    writer.abort();
    result
}

/// Check the first frames of a session against the shared secret.
///
/// An empty frame is tolerated as keepalive padding. The token may carry
/// an appended protocol version (`secret~~version`) checked against the
/// configured minimum; when a minimum is set, a missing version counts as
/// too old.
fn authenticate(
    session: &Arc<Session>,
    frame: &str,
    config: &ServerConfig,
    stats: &Arc<ServerStats>,
) -> Result<()> {
    if frame.is_empty() {
        return Ok(());
    }

    let (token, offered) = match frame.split_once(ALIAS_SEPARATOR) {
        Some((token, version)) => (token, Some(version)),
        None => (frame, None),
    };

    if config.secret.is_empty() || token != config.secret {
        stats.auth_failures.fetch_add(1, Ordering::Relaxed);
        warn!(peer = %session.peer(), "authentication rejected");
        return Err(LinkError::AuthRejected);
    }

    if let Some(required) = &config.min_version {
        let offered = offered.unwrap_or("0");
        if !version::at_least(offered, required) {
            stats.auth_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer = %session.peer(),
                offered,
                required,
                "client protocol version too old"
            );
            return Err(LinkError::VersionTooOld {
                required: required.clone(),
                offered: offered.to_owned(),
            });
        }
    }

    session.set_authenticated();
    info!(peer = %session.peer(), "session authenticated");
    Ok(())
}
