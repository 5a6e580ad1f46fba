//! Client link engine
//!
//! Owns one TCP connection to one remote endpoint: a supervisor task
//! retries the connection and authenticates, a receive loop feeds the
//! frame codec and dispatches each decoded envelope on a short-lived
//! worker, and a liveness timer sends the keepalive literal while
//! connected. After every (re)connect the engine re-runs the Init
//! handshake for all registered proxies, so the server is guaranteed live
//! registrations at the cost of duplicate Inits (tolerated by the
//! protocol's idempotence).
//!
//! Frames for different aliases are dispatched on independent workers;
//! callers must not assume strict cross-alias ordering of side effects.

use crate::envelope::{validate_alias, Envelope, Payload, ALIAS_SEPARATOR, PING_FRAME, PONG_FRAME};
use crate::error::{LinkError, Result};
use crate::framing::{FrameReader, FrameWriter};
use crate::proxy::{NodeProxy, ProxyRegistry};
use crate::ticket::TicketTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Client link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Remote endpoint.
    pub addr: SocketAddr,
    /// Shared static token sent as the first frame.
    pub secret: String,
    /// Protocol version appended to the auth frame, checked by servers
    /// that enforce a minimum.
    pub protocol_version: Option<String>,
    /// Delay between reconnect attempts while disconnected.
    pub reconnect_interval: Duration,
    /// Keepalive ping period while connected.
    pub keepalive_interval: Duration,
    /// Bound on how long a query or init waits for its reply.
    pub query_timeout: Duration,
}

impl LinkConfig {
    pub fn new(addr: SocketAddr, secret: impl Into<String>) -> Self {
        Self {
            addr,
            secret: secret.into(),
            protocol_version: None,
            reconnect_interval: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(10),
            query_timeout: Duration::from_secs(10),
        }
    }

    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }
}

struct EngineInner {
    config: LinkConfig,
    nodes: ProxyRegistry,
    tickets: Arc<TicketTable>,
    writer: Mutex<Option<FrameWriter<OwnedWriteHalf>>>,
    connected: watch::Sender<bool>,
    init_gate: Mutex<()>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

/// The client end of the object link. Cheap to clone; all clones share the
/// same connection, registry and ticket table.
#[derive(Clone)]
pub struct LinkEngine {
    inner: Arc<EngineInner>,
}

impl LinkEngine {
    /// Build an engine without touching the network.
    pub fn new(config: LinkConfig) -> Self {
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                config,
                nodes: ProxyRegistry::default(),
                tickets: TicketTable::new(),
                writer: Mutex::new(None),
                connected,
                init_gate: Mutex::new(()),
                shutdown,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Build an engine and start its supervisor.
    pub fn connect(config: LinkConfig) -> Self {
        let engine = Self::new(config);
        engine.start();
        engine
    }

    /// Spawn the supervisor task (connect, authenticate, re-init proxies,
    /// run the receive loop, reconnect on failure). Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move { engine.supervise().await });
    }

    /// Stop the supervisor and drop the connection.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Observe link up/down transitions.
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Wait until the link is up (authenticated, proxies re-initialized).
    pub async fn wait_connected(&self) {
        let mut watch = self.inner.connected.subscribe();
        while !*watch.borrow_and_update() {
            if watch.changed().await.is_err() {
                return;
            }
        }
    }

    /// Create the local stand-in for one remote object.
    ///
    /// Registers the alias for the life of the process and, if the link is
    /// up, runs the Init handshake immediately; otherwise the handshake is
    /// deferred to the next (re)connect. Creating the same alias and type
    /// twice returns a proxy onto the same node.
    pub async fn create_node(
        &self,
        alias: &str,
        declared_type: &str,
        args: Vec<Value>,
    ) -> Result<NodeProxy> {
        validate_alias(alias)?;
        let node = self.inner.nodes.insert(alias, declared_type, args)?;
        if self.is_connected() {
            self.init_handshake(&node.alias, &node.declared_type, node.init_args.clone())
                .await?;
        }
        Ok(NodeProxy::new(self.clone(), node))
    }

    /// Fire-and-forget invocation or property assignment. Never waits.
    pub async fn command(&self, alias: &str, property: &str, args: Vec<Value>) -> Result<()> {
        let payload = Payload::Command {
            property: property.to_owned(),
            args,
        };
        self.send_frame(Envelope::new(alias, payload).to_frame())
            .await
    }

    /// Blocking query: returns only after the reply bearing this call's
    /// ticket arrives, carrying the value or the remote error.
    pub async fn query(&self, alias: &str, property: &str, args: Vec<Value>) -> Result<Value> {
        let (ticket, gate) = self.inner.tickets.allocate();
        let payload = Payload::Query {
            query_id: ticket.id(),
            property: property.to_owned(),
            args,
        };
        self.send_frame(Envelope::new(alias, payload).to_frame())
            .await?;

        // The ticket guard releases the table slot on every exit path.
        match timeout(self.inner.config.query_timeout, gate).await {
            Err(_) => Err(LinkError::QueryTimeout {
                alias: alias.to_owned(),
                property: property.to_owned(),
            }),
            Ok(Err(_)) => Err(LinkError::ConnectionClosed),
            Ok(Ok(Payload::QueryResult { value, .. })) => Ok(value),
            Ok(Ok(Payload::Error {
                property,
                message,
                qualifier,
                ..
            })) => Err(remote_error(property, message, qualifier)),
            Ok(Ok(other)) => Err(LinkError::MalformedFrame(format!(
                "unexpected query reply: {:?}",
                other
            ))),
        }
    }

    /// Blocking Init handshake. Init acks carry no ticket id, so the
    /// well-known init slot is shared across all proxies and held one at a
    /// time behind the gate.
    async fn init_handshake(
        &self,
        alias: &str,
        declared_type: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        let _gate = self.inner.init_gate.lock().await;
        let slot = self.inner.tickets.arm_init();
        let payload = Payload::Init {
            declared_type: declared_type.to_owned(),
            args,
        };
        self.send_frame(Envelope::new(alias, payload).to_frame())
            .await?;

        let outcome = match timeout(self.inner.config.query_timeout, slot).await {
            Err(_) => Err(LinkError::QueryTimeout {
                alias: alias.to_owned(),
                property: "init".to_owned(),
            }),
            Ok(Err(_)) => Err(LinkError::ConnectionClosed),
            Ok(Ok(Payload::InitAck { .. })) => Ok(()),
            Ok(Ok(Payload::Error {
                property,
                message,
                qualifier,
                ..
            })) => Err(remote_error(property, message, qualifier)),
            Ok(Ok(other)) => Err(LinkError::MalformedFrame(format!(
                "unexpected init reply: {:?}",
                other
            ))),
        };
        if outcome.is_err() {
            self.inner.tickets.clear_init();
        }
        outcome
    }

    async fn send_frame(&self, frame: String) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(w) => match w.write_frame(&frame).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // Leave teardown to the supervisor; just stop writing.
                    *writer = None;
                    Err(e)
                }
            },
            None => Err(LinkError::NotConnected),
        }
    }

    async fn supervise(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            match TcpStream::connect(self.inner.config.addr).await {
                Ok(stream) => {
                    info!(addr = %self.inner.config.addr, "link connected");
                    match self.run_session(stream, &mut shutdown).await {
                        Ok(()) => {}
                        Err(LinkError::ConnectionClosed) => {
                            debug!("link closed by peer");
                        }
                        Err(e) => warn!(error = %e, "link session ended"),
                    }
                    self.on_disconnect().await;
                }
                Err(e) => {
                    debug!(addr = %self.inner.config.addr, error = %e, "connect failed");
                }
            }

            if *shutdown.borrow_and_update() {
                break;
            }
            let sleep = tokio::time::sleep(self.inner.config.reconnect_interval);
            tokio::select! {
                _ = sleep => {}
                _ = shutdown.changed() => {}
            }
        }
        self.on_disconnect().await;
    }

    async fn run_session(
        &self,
        stream: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        *self.inner.writer.lock().await = Some(FrameWriter::new(write_half));

        // The receive loop must already be draining frames while the auth
        // and re-init handshakes below wait for their acks.
        let engine = self.clone();
        let mut receive = tokio::spawn(async move { engine.receive_loop(read_half).await });

        let result = async {
            self.send_frame(self.auth_frame()).await?;

            let mut inited = std::collections::HashSet::new();
            for node in self.inner.nodes.snapshot() {
                if let Err(e) = self
                    .init_handshake(&node.alias, &node.declared_type, node.init_args.clone())
                    .await
                {
                    warn!(alias = %node.alias, error = %e, "re-init failed");
                }
                inited.insert(node.alias.clone());
            }
            let _ = self.inner.connected.send(true);

            // Proxies registered while the sweep above was running saw the
            // link as down and deferred their handshake; catch them now.
            // Anything newer than this snapshot self-initializes, and a
            // duplicate init is acked trivially either way.
            for node in self.inner.nodes.snapshot() {
                if !inited.contains(&node.alias) {
                    if let Err(e) = self
                        .init_handshake(&node.alias, &node.declared_type, node.init_args.clone())
                        .await
                    {
                        warn!(alias = %node.alias, error = %e, "late init failed");
                    }
                }
            }

            let start = tokio::time::Instant::now() + self.inner.config.keepalive_interval;
            let mut keepalive =
                tokio::time::interval_at(start, self.inner.config.keepalive_interval);

            loop {
                tokio::select! {
                    ended = &mut receive => {
                        return ended.unwrap_or(Err(LinkError::ConnectionClosed));
                    }
                    _ = keepalive.tick() => {
                        self.send_frame(PING_FRAME.to_owned()).await?;
                    }
                    _ = shutdown.changed() => {
                        return Ok(());
                    }
                }
            }
        }
        .await;

        receive.abort();
        result
    }

    async fn receive_loop(&self, read_half: OwnedReadHalf) -> Result<()> {
        let mut reader = FrameReader::new(read_half);
        loop {
            let frame = reader.next_frame().await?;
            if frame.is_empty() {
                continue;
            }
            if frame == PONG_FRAME || frame == PING_FRAME {
                trace!("keepalive {}", frame);
                continue;
            }
            // A malformed frame is a transport error: tear the session
            // down rather than attributing the bytes to any node.
            let envelope = Envelope::parse(&frame)?;
            self.route(envelope);
        }
    }

    /// Route one decoded envelope. Ticket resolution happens inline (it
    /// only unblocks a waiter); node event handling runs on its own worker
    /// so a slow handler cannot stall the receive loop or other nodes.
    fn route(&self, envelope: Envelope) {
        let Envelope { alias, payload } = envelope;

        // Ticket-bearing replies release their gate exactly once; a second
        // frame for an already-resolved ticket is ignored here.
        let ticket = match &payload {
            Payload::QueryResult { query_id, .. } => Some(*query_id),
            Payload::Error {
                query_id: Some(id), ..
            } => Some(*id),
            _ => None,
        };
        if let Some(id) = ticket {
            if !self.inner.tickets.resolve(id, payload) {
                debug!(alias, query_id = id, "reply for unknown or resolved ticket");
            }
            return;
        }

        let init_reply = matches!(&payload, Payload::InitAck { .. })
            || matches!(&payload, Payload::Error { property, query_id: None, .. }
                if property.as_str() == "init");
        if init_reply {
            self.inner.tickets.resolve_init(payload);
            return;
        }

        match payload {
            Payload::Update {
                property,
                value,
                qualifier,
            } => match self.inner.nodes.get(&alias) {
                Some(node) => {
                    tokio::spawn(async move {
                        node.apply_update(property, value, qualifier).await;
                    });
                }
                None => debug!(alias, "update for unknown alias"),
            },
            Payload::Error {
                property, message, ..
            } => match self.inner.nodes.get(&alias) {
                Some(node) => {
                    tokio::spawn(async move {
                        node.apply_error(property, message).await;
                    });
                }
                None => debug!(alias, "error for unknown alias"),
            },
            Payload::Init { .. } | Payload::Command { .. } | Payload::Query { .. } => {
                warn!(alias, "unexpected server-bound payload, ignoring");
            }
            Payload::InitAck { .. } | Payload::QueryResult { .. } => {}
        }
    }

    fn auth_frame(&self) -> String {
        match &self.inner.config.protocol_version {
            Some(version) => format!(
                "{}{}{}",
                self.inner.config.secret, ALIAS_SEPARATOR, version
            ),
            None => self.inner.config.secret.clone(),
        }
    }

    async fn on_disconnect(&self) {
        *self.inner.writer.lock().await = None;
        let _ = self.inner.connected.send(false);
        // Fail every blocked caller fast instead of letting the bounded
        // wait expire; resend is the caller's decision.
        self.inner.tickets.fail_all();
    }
}

fn remote_error(property: String, message: String, qualifier: Option<Value>) -> LinkError {
    let code = qualifier
        .as_ref()
        .and_then(|q| q.get("code"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    LinkError::Remote {
        property,
        message,
        code,
    }
}
