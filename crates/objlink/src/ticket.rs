//! Query ticket table
//!
//! Turns an asynchronous reply into a blocking call: the caller allocates a
//! ticket, sends the query frame, then waits on the ticket's gate until the
//! receive path resolves it with the matching reply. Resolution happens at
//! most once per ticket; a late or duplicate reply for an already-resolved
//! id is ignored. Ticket release is caller-owned and guaranteed on all
//! paths by a drop guard, so an abandoned call never leaks its slot.
//!
//! Init handshakes use a separate single-flight slot: init acks carry no
//! query id, so at most one init may be outstanding at a time (the link
//! engine serializes them behind a gate).

use crate::envelope::Payload;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Pending-call table keyed by monotonically increasing ticket id.
#[derive(Default)]
pub struct TicketTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Payload>>>,
    init_slot: Mutex<Option<oneshot::Sender<Payload>>>,
}

impl TicketTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            init_slot: Mutex::new(None),
        })
    }

    /// Allocate a fresh ticket and its gate.
    ///
    /// The id is unique for the life of the guard; it may be reused only
    /// after the guard is dropped (ids are monotone, so in practice never).
    pub fn allocate(&self) -> (TicketGuard<'_>, oneshot::Receiver<Payload>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (TicketGuard { id, table: self }, rx)
    }

    /// Resolve a ticket with its terminal reply.
    ///
    /// Returns false if the id is unknown or already resolved; the frame is
    /// then ignored, preserving the at-most-one-reply contract.
    pub fn resolve(&self, id: u64, payload: Payload) -> bool {
        let sender = self.pending.lock().remove(&id);
        match sender {
            // send fails only if the caller already gave up; either way the
            // slot is consumed exactly once.
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Arm the single-flight init slot, replacing any stale sender.
    pub fn arm_init(&self) -> oneshot::Receiver<Payload> {
        let (tx, rx) = oneshot::channel();
        *self.init_slot.lock() = Some(tx);
        rx
    }

    /// Resolve the pending init handshake, if one is armed.
    pub fn resolve_init(&self, payload: Payload) -> bool {
        match self.init_slot.lock().take() {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Disarm the init slot (timeout path).
    pub fn clear_init(&self) {
        self.init_slot.lock().take();
    }

    /// Fail every outstanding ticket by dropping its gate.
    ///
    /// Blocked callers observe a closed channel and surface
    /// `LinkError::ConnectionClosed`. Used when the link drops.
    pub fn fail_all(&self) {
        self.pending.lock().clear();
        self.init_slot.lock().take();
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Owns one ticket id; removes the table entry on drop.
pub struct TicketGuard<'a> {
    id: u64,
    table: &'a TicketTable,
}

impl TicketGuard<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.table.pending.lock().remove(&self.id);
    }
}
