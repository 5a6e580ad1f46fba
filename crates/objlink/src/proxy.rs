//! Client node proxies
//!
//! A [`NodeProxy`] is the local stand-in for one remote hardware object:
//! property reads become queries, property writes and invocations become
//! commands, and unsolicited updates land in a per-node value cache, a
//! broadcast stream, and an optional [`NodeHandler`]. Proxies register in
//! the engine's node registry at creation time and stay registered for the
//! life of the process; the registry drives re-initialization after every
//! reconnect.

use crate::client::LinkEngine;
use crate::error::{LinkError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One observed event on a proxied node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Update {
        property: String,
        value: Value,
        qualifier: Option<Value>,
    },
    Error {
        property: String,
        message: String,
    },
}

/// Callback seam for code that wants push delivery instead of polling the
/// cache or draining a broadcast receiver.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn on_update(&self, property: &str, value: &Value, qualifier: Option<&Value>);

    async fn on_error(&self, _property: &str, _message: &str) {}
}

/// Client-side registry entry for one remote object.
pub(crate) struct ClientNode {
    pub alias: String,
    pub declared_type: String,
    pub init_args: Vec<Value>,
    cache: RwLock<HashMap<String, Value>>,
    events: broadcast::Sender<NodeEvent>,
    handler: RwLock<Option<Arc<dyn NodeHandler>>>,
}

impl ClientNode {
    fn new(alias: String, declared_type: String, init_args: Vec<Value>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            alias,
            declared_type,
            init_args,
            cache: RwLock::new(HashMap::new()),
            events,
            handler: RwLock::new(None),
        }
    }

    pub async fn apply_update(&self, property: String, value: Value, qualifier: Option<Value>) {
        trace!(alias = self.alias, property, "update");
        self.cache.write().insert(property.clone(), value.clone());
        let _ = self.events.send(NodeEvent::Update {
            property: property.clone(),
            value: value.clone(),
            qualifier: qualifier.clone(),
        });
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler
                .on_update(&property, &value, qualifier.as_ref())
                .await;
        }
    }

    pub async fn apply_error(&self, property: String, message: String) {
        let _ = self.events.send(NodeEvent::Error {
            property: property.clone(),
            message: message.clone(),
        });
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_error(&property, &message).await;
        }
    }

    fn cached(&self, property: &str) -> Option<Value> {
        self.cache.read().get(property).cloned()
    }
}

/// Alias-keyed registry of every proxy created on this engine.
///
/// Entries are created when a proxy is constructed and destroyed only at
/// process teardown; there is no unregister in the base protocol.
#[derive(Default)]
pub(crate) struct ProxyRegistry {
    nodes: RwLock<HashMap<String, Arc<ClientNode>>>,
}

impl ProxyRegistry {
    pub fn insert(
        &self,
        alias: &str,
        declared_type: &str,
        init_args: Vec<Value>,
    ) -> Result<Arc<ClientNode>> {
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(alias) {
            if existing.declared_type == declared_type {
                return Ok(Arc::clone(existing));
            }
            return Err(LinkError::InvalidAlias(format!(
                "alias {} already bound to type {}",
                alias, existing.declared_type
            )));
        }
        let node = Arc::new(ClientNode::new(
            alias.to_owned(),
            declared_type.to_owned(),
            init_args,
        ));
        nodes.insert(alias.to_owned(), Arc::clone(&node));
        Ok(node)
    }

    pub fn get(&self, alias: &str) -> Option<Arc<ClientNode>> {
        self.nodes.read().get(alias).cloned()
    }

    /// Stable snapshot for the reconnect re-init sweep.
    pub fn snapshot(&self) -> Vec<Arc<ClientNode>> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }
}

/// Local stand-in with the same shape as the remote object.
#[derive(Clone)]
pub struct NodeProxy {
    engine: LinkEngine,
    node: Arc<ClientNode>,
}

impl std::fmt::Debug for NodeProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeProxy")
            .field("alias", &self.node.alias)
            .field("declared_type", &self.node.declared_type)
            .finish()
    }
}

impl NodeProxy {
    pub(crate) fn new(engine: LinkEngine, node: Arc<ClientNode>) -> Self {
        Self { engine, node }
    }

    pub fn alias(&self) -> &str {
        &self.node.alias
    }

    pub fn declared_type(&self) -> &str {
        &self.node.declared_type
    }

    /// Read a property on the remote object (blocking query).
    pub async fn get(&self, property: &str) -> Result<Value> {
        self.engine
            .query(&self.node.alias, property, Vec::new())
            .await
    }

    /// Assign a property on the remote object (fire-and-forget).
    pub async fn set(&self, property: &str, value: Value) -> Result<()> {
        self.engine
            .command(&self.node.alias, property, vec![value])
            .await
    }

    /// Invoke a method, discarding its result (fire-and-forget).
    pub async fn invoke(&self, property: &str, args: Vec<Value>) -> Result<()> {
        self.engine.command(&self.node.alias, property, args).await
    }

    /// Invoke a method and wait for its result (blocking query).
    pub async fn call(&self, property: &str, args: Vec<Value>) -> Result<Value> {
        self.engine.query(&self.node.alias, property, args).await
    }

    /// Last pushed value for a property, if any update has arrived.
    pub fn cached(&self, property: &str) -> Option<Value> {
        self.node.cached(property)
    }

    /// Subscribe to the node's update/error stream.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.node.events.subscribe()
    }

    /// Install a push handler for this node's events.
    pub fn set_handler(&self, handler: Arc<dyn NodeHandler>) {
        *self.node.handler.write() = Some(handler);
    }
}
