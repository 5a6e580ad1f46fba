//! Server-side node registry
//!
//! Keyed first by declared type then alias, plus a reverse alias-to-type
//! index for O(1) frame dispatch. Entries are never removed: an alias
//! permanently denotes one object for the process lifetime, and a repeat
//! Init for a registered alias is a no-op.

use crate::error::Result;
use crate::wrapper::{ResolvedArg, Wrapper};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct NodeTable {
    by_type: RwLock<HashMap<String, HashMap<String, Arc<Wrapper>>>>,
    alias_index: RwLock<HashMap<String, String>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a wrapper by alias.
    pub fn get(&self, alias: &str) -> Option<Arc<Wrapper>> {
        let declared_type = self.alias_index.read().get(alias)?.clone();
        self.by_type
            .read()
            .get(&declared_type)
            .and_then(|nodes| nodes.get(alias))
            .cloned()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.alias_index.read().contains_key(alias)
    }

    pub fn declared_type(&self, alias: &str) -> Option<String> {
        self.alias_index.read().get(alias).cloned()
    }

    /// Insert a freshly constructed wrapper.
    ///
    /// Returns false without touching the table if the alias is already
    /// registered (Init idempotence: first registration wins).
    pub fn insert(&self, wrapper: Arc<Wrapper>) -> bool {
        let mut index = self.alias_index.write();
        if index.contains_key(wrapper.alias()) {
            return false;
        }
        index.insert(
            wrapper.alias().to_owned(),
            wrapper.declared_type().to_owned(),
        );
        self.by_type
            .write()
            .entry(wrapper.declared_type().to_owned())
            .or_default()
            .insert(wrapper.alias().to_owned(), wrapper);
        true
    }

    /// Aliases registered under one declared type.
    pub fn aliases_of(&self, declared_type: &str) -> Vec<String> {
        self.by_type
            .read()
            .get(declared_type)
            .map(|nodes| nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.alias_index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alias_index.read().is_empty()
    }

    /// Resolve construction arguments, substituting live wrapper handles for
    /// alias references of the shape `{"node": "<alias>"}`.
    ///
    /// A reference to an unregistered alias passes through as its literal
    /// value; the constructor decides whether that is acceptable.
    pub fn resolve_args(&self, raw: Vec<Value>) -> Result<Vec<ResolvedArg>> {
        let mut resolved = Vec::with_capacity(raw.len());
        for arg in raw {
            let referenced = arg
                .as_object()
                .filter(|obj| obj.len() == 1)
                .and_then(|obj| obj.get("node"))
                .and_then(Value::as_str)
                .and_then(|alias| self.get(alias));
            resolved.push(match referenced {
                Some(wrapper) => ResolvedArg::Node(wrapper),
                None => ResolvedArg::Value(arg),
            });
        }
        Ok(resolved)
    }
}
