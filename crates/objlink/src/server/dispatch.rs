//! Authenticated frame routing and the single-flight creation queue
//!
//! Known aliases dispatch into the wrapper capability table on a
//! short-lived worker task, so one slow handler cannot stall frame parsing
//! or other aliases. Unknown aliases either enqueue a creation job (Init)
//! or answer with a "missing device" error. Creation jobs drain serially
//! through one consumer task because hardware construction subscribes to
//! live events and is not safe to parallelize.

use super::session::{Session, SessionMap};
use super::nodes::NodeTable;
use super::ServerStats;
use crate::envelope::{Envelope, Payload, CODE_CREATE_FAILED, PING_FRAME, PONG_FRAME};
use crate::error::Result;
use crate::wrapper::{CreateContext, UpdateSink, Wrapper, WrapperFactory};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Queued construction request.
pub(crate) struct CreateJob {
    pub alias: String,
    pub declared_type: String,
    pub args: Vec<Value>,
    pub origin: Arc<Session>,
}

pub(crate) struct Dispatcher {
    nodes: Arc<NodeTable>,
    sessions: Arc<SessionMap>,
    creations: mpsc::Sender<CreateJob>,
    stats: Arc<ServerStats>,
}

impl Dispatcher {
    pub fn new(
        nodes: Arc<NodeTable>,
        sessions: Arc<SessionMap>,
        creations: mpsc::Sender<CreateJob>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            nodes,
            sessions,
            creations,
            stats,
        }
    }

    /// Route one authenticated frame.
    ///
    /// An unparseable frame is a transport-level error: the caller tears
    /// the connection down rather than attributing bytes to any node.
    pub fn handle_frame(&self, session: &Arc<Session>, frame: String) -> Result<()> {
        if frame.is_empty() {
            trace!(peer = %session.peer(), "ignoring empty frame");
            return Ok(());
        }
        if frame == PING_FRAME {
            session.send_frame(PONG_FRAME.to_owned());
            return Ok(());
        }

        let Envelope { alias, payload } = Envelope::parse(&frame)?;
        session.subscribe(&alias);

        if let Some(wrapper) = self.nodes.get(&alias) {
            let session = Arc::clone(session);
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                dispatch_into(&wrapper, &session, &alias, payload, &stats).await;
            });
            return Ok(());
        }

        match payload {
            Payload::Init {
                declared_type,
                args,
            } => self.enqueue_creation(session, alias, declared_type, args),
            other => {
                warn!(alias, peer = %session.peer(), "frame for unregistered alias");
                self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                session.send(
                    &alias,
                    Payload::missing_device(property_of(&other), query_id_of(&other)),
                );
            }
        }
        Ok(())
    }

    fn enqueue_creation(
        &self,
        session: &Arc<Session>,
        alias: String,
        declared_type: String,
        args: Vec<Value>,
    ) {
        let job = CreateJob {
            alias: alias.clone(),
            declared_type,
            args,
            origin: Arc::clone(session),
        };
        if self.creations.try_send(job).is_err() {
            warn!(alias, "creation queue full, rejecting init");
            self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            session.send(
                &alias,
                Payload::Error {
                    property: "init".into(),
                    message: "creation queue full".into(),
                    qualifier: Some(json!({ "code": CODE_CREATE_FAILED })),
                    query_id: None,
                },
            );
        }
    }

}

/// Reflect one payload into a registered wrapper.
async fn dispatch_into(
    wrapper: &Wrapper,
    session: &Arc<Session>,
    alias: &str,
    payload: Payload,
    stats: &Arc<ServerStats>,
) {
    match payload {
        Payload::Command { property, args } => {
            if let Err(e) = wrapper.apply_command(&property, args).await {
                // Commands never get a solicited reply; the failure is
                // pushed as an unsolicited error and logged.
                warn!(alias, property, error = %e, "command failed");
                stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                session.send(
                    alias,
                    Payload::Error {
                        property,
                        message: e.to_string(),
                        qualifier: None,
                        query_id: None,
                    },
                );
            }
        }
        Payload::Query {
            query_id,
            property,
            args,
        } => {
            let reply = match wrapper.answer_query(&property, args).await {
                Ok(value) => Payload::QueryResult { query_id, value },
                Err(e) => {
                    warn!(alias, property, error = %e, "query failed");
                    stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                    Payload::Error {
                        property,
                        message: e.to_string(),
                        qualifier: None,
                        query_id: Some(query_id),
                    }
                }
            };
            session.send(alias, reply);
        }
        Payload::Init { .. } => {
            // Alias already registered: duplicate Init acks trivially.
            debug!(alias, "duplicate init acknowledged");
            session.send(alias, Payload::InitAck { value: Value::Null });
        }
        Payload::InitAck { .. }
        | Payload::QueryResult { .. }
        | Payload::Update { .. }
        | Payload::Error { .. } => {
            warn!(alias, "unexpected client-bound payload, ignoring");
        }
    }
}

fn property_of(payload: &Payload) -> String {
    match payload {
        Payload::Command { property, .. }
        | Payload::Query { property, .. }
        | Payload::Update { property, .. }
        | Payload::Error { property, .. } => property.clone(),
        Payload::Init { .. } | Payload::InitAck { .. } | Payload::QueryResult { .. } => {
            "init".to_owned()
        }
    }
}

fn query_id_of(payload: &Payload) -> Option<u64> {
    match payload {
        Payload::Query { query_id, .. } | Payload::QueryResult { query_id, .. } => Some(*query_id),
        Payload::Error { query_id, .. } => *query_id,
        _ => None,
    }
}

/// Single consumer of the creation queue.
///
/// Exits when every dispatcher handle (and with it the queue sender) is
/// gone.
pub(crate) async fn run_creation_worker(
    mut jobs: mpsc::Receiver<CreateJob>,
    nodes: Arc<NodeTable>,
    sessions: Arc<SessionMap>,
    factory: Arc<WrapperFactory>,
    stats: Arc<ServerStats>,
) {
    while let Some(job) = jobs.recv().await {
        // Another init for the same alias may have drained first.
        if nodes.contains(&job.alias) {
            debug!(alias = %job.alias, "alias already registered, acking init");
            job.origin.send(&job.alias, Payload::InitAck { value: Value::Null });
            continue;
        }

        let result = nodes.resolve_args(job.args).and_then(|args| {
            let events = update_sink(&job.alias, &sessions, &stats);
            factory.construct(CreateContext {
                alias: job.alias.clone(),
                declared_type: job.declared_type.clone(),
                args,
                events,
            })
        });

        match result {
            Ok(wrapper) => {
                nodes.insert(Arc::new(wrapper));
                stats.nodes_created.fetch_add(1, Ordering::Relaxed);
                info!(
                    alias = %job.alias,
                    declared_type = %job.declared_type,
                    "node registered"
                );
                job.origin.send(&job.alias, Payload::InitAck { value: Value::Null });
            }
            Err(e) => {
                warn!(alias = %job.alias, error = %e, "construction failed");
                stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                job.origin.send(
                    &job.alias,
                    Payload::Error {
                        property: "init".into(),
                        message: e.to_string(),
                        qualifier: Some(json!({ "code": CODE_CREATE_FAILED })),
                        query_id: None,
                    },
                );
            }
        }
    }
}

/// Event sink for one wrapped object: fans updates out to every session
/// subscribed to the alias, across all listeners.
pub(crate) fn update_sink(
    alias: &str,
    sessions: &Arc<SessionMap>,
    stats: &Arc<ServerStats>,
) -> UpdateSink {
    let sessions = Arc::clone(sessions);
    let stats = Arc::clone(stats);
    UpdateSink::new(
        alias,
        Arc::new(move |alias, payload| {
            let delivered = sessions.fan_out(alias, payload);
            stats
                .updates_fanned_out
                .fetch_add(delivered as u64, Ordering::Relaxed);
        }),
    )
}
