//! Per-connection sessions and alias fan-out
//!
//! Each accepted socket gets a `Session`: an authentication flag, an
//! outbound frame queue drained by the connection's writer task, and the
//! set of aliases observed on that connection. The shared `SessionMap`
//! spans every listener, so an Update for an alias reaches all subscribed
//! sessions regardless of which interface they arrived on.

use crate::envelope::{Envelope, Payload};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

pub struct Session {
    id: u64,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
    authenticated: AtomicBool,
    subscribed: RwLock<HashSet<String>>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    /// Record that this connection has observed traffic for an alias.
    pub fn subscribe(&self, alias: &str) {
        self.subscribed.write().insert(alias.to_owned());
    }

    pub fn is_subscribed(&self, alias: &str) -> bool {
        self.subscribed.read().contains(alias)
    }

    /// Queue a raw frame for the writer task. Errors are swallowed: a full
    /// teardown follows when the writer observes the closed socket.
    pub fn send_frame(&self, frame: String) {
        let _ = self.outbound.send(frame);
    }

    /// Queue an envelope for one alias.
    pub fn send(&self, alias: &str, payload: Payload) {
        self.send_frame(Envelope::new(alias, payload).to_frame());
    }
}

/// All live sessions across every listener.
#[derive(Default)]
pub struct SessionMap {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session around its outbound queue.
    pub fn insert(&self, peer: SocketAddr, outbound: mpsc::UnboundedSender<String>) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session {
            id,
            peer,
            outbound,
            authenticated: AtomicBool::new(false),
            subscribed: RwLock::new(HashSet::new()),
        });
        self.sessions.write().insert(id, Arc::clone(&session));
        session
    }

    /// Drop a session on disconnect.
    pub fn remove(&self, id: u64) {
        self.sessions.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Deliver one payload to every authenticated session subscribed to the
    /// alias. Returns how many sessions it was queued for.
    pub fn fan_out(&self, alias: &str, payload: Payload) -> usize {
        let frame = Envelope::new(alias, payload).to_frame();
        let sessions = self.sessions.read();
        let mut delivered = 0;
        for session in sessions.values() {
            if session.is_authenticated() && session.is_subscribed(alias) {
                session.send_frame(frame.clone());
                delivered += 1;
            }
        }
        trace!(alias, delivered, "fan-out");
        delivered
    }
}
