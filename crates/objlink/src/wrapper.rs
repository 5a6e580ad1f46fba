//! Server-side wrappers and the wrapper factory
//!
//! A wrapper owns one real hardware object and bridges it onto the link: a
//! capability table built at construction time maps property names to
//! getters, setters and invokers, and an [`UpdateSink`] re-emits the
//! object's hardware events as unsolicited `Update` frames. Dispatch is by
//! explicit table lookup, so the mechanism stays generic across an open set
//! of object types without per-type protocol code.

use crate::envelope::Payload;
use crate::error::{LinkError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by an invocable capability.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Invocable capability handler.
pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// Property read handler.
pub type GetHandler = Arc<dyn Fn() -> Result<Value> + Send + Sync>;

/// Property write handler.
pub type SetHandler = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;

/// One named capability of a wrapped object.
#[derive(Clone)]
pub enum Capability {
    /// Non-invocable attribute: queries read it, commands assign it.
    Property {
        get: GetHandler,
        set: Option<SetHandler>,
    },
    /// Invocable attribute: commands discard the result, queries return it.
    Method(MethodHandler),
}

/// Server-side stand-in that owns one real hardware object.
pub struct Wrapper {
    alias: String,
    declared_type: String,
    caps: HashMap<String, Capability>,
}

impl Wrapper {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn declared_type(&self) -> &str {
        &self.declared_type
    }

    pub fn has_capability(&self, property: &str) -> bool {
        self.caps.contains_key(property)
    }

    /// Apply a fire-and-forget command: invoke a method (discarding its
    /// result) or assign a property.
    pub async fn apply_command(&self, property: &str, args: Vec<Value>) -> Result<()> {
        match self.capability(property)? {
            Capability::Method(handler) => {
                handler(args).await?;
                Ok(())
            }
            Capability::Property { set: Some(set), .. } => {
                set(args.into_iter().next().unwrap_or(Value::Null))
            }
            Capability::Property { set: None, .. } => Err(LinkError::ReadOnly {
                alias: self.alias.clone(),
                property: property.to_owned(),
            }),
        }
    }

    /// Answer a query: invoke a method or read a property.
    pub async fn answer_query(&self, property: &str, args: Vec<Value>) -> Result<Value> {
        match self.capability(property)? {
            Capability::Method(handler) => handler(args).await,
            Capability::Property { get, .. } => get(),
        }
    }

    fn capability(&self, property: &str) -> Result<Capability> {
        self.caps
            .get(property)
            .cloned()
            .ok_or_else(|| LinkError::UnknownProperty {
                alias: self.alias.clone(),
                property: property.to_owned(),
            })
    }
}

/// Fluent capability-table construction, used inside type constructors.
pub struct WrapperBuilder {
    alias: String,
    declared_type: String,
    caps: HashMap<String, Capability>,
}

impl WrapperBuilder {
    pub fn new(alias: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            declared_type: declared_type.into(),
            caps: HashMap::new(),
        }
    }

    /// Register a read-only property.
    pub fn read<G>(mut self, property: &str, get: G) -> Self
    where
        G: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        self.caps.insert(
            property.to_owned(),
            Capability::Property {
                get: Arc::new(get),
                set: None,
            },
        );
        self
    }

    /// Register a readable and assignable property.
    pub fn read_write<G, S>(mut self, property: &str, get: G, set: S) -> Self
    where
        G: Fn() -> Result<Value> + Send + Sync + 'static,
        S: Fn(Value) -> Result<()> + Send + Sync + 'static,
    {
        self.caps.insert(
            property.to_owned(),
            Capability::Property {
                get: Arc::new(get),
                set: Some(Arc::new(set)),
            },
        );
        self
    }

    /// Register an invocable method.
    pub fn method<F, Fut>(mut self, property: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.caps.insert(
            property.to_owned(),
            Capability::Method(Arc::new(move |args| Box::pin(handler(args)))),
        );
        self
    }

    pub fn build(self) -> Wrapper {
        Wrapper {
            alias: self.alias,
            declared_type: self.declared_type,
            caps: self.caps,
        }
    }
}

/// A construction argument after alias-reference resolution.
///
/// An argument object of the exact shape `{"node": "<alias>"}` denotes a
/// reference to an already-registered wrapper and arrives as the live
/// handle; anything else passes through as plain JSON.
#[derive(Clone)]
pub enum ResolvedArg {
    Value(Value),
    Node(Arc<Wrapper>),
}

impl ResolvedArg {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ResolvedArg::Value(v) => Some(v),
            ResolvedArg::Node(_) => None,
        }
    }

    pub fn node(&self) -> Option<&Arc<Wrapper>> {
        match self {
            ResolvedArg::Node(w) => Some(w),
            ResolvedArg::Value(_) => None,
        }
    }
}

/// Emits unsolicited frames for one wrapped object to every subscribed
/// session. Cheap to clone into hardware event callbacks.
#[derive(Clone)]
pub struct UpdateSink {
    alias: Arc<str>,
    out: Arc<dyn Fn(&str, Payload) + Send + Sync>,
}

impl UpdateSink {
    pub(crate) fn new(alias: &str, out: Arc<dyn Fn(&str, Payload) + Send + Sync>) -> Self {
        Self {
            alias: Arc::from(alias),
            out,
        }
    }

    /// Push a property update.
    pub fn update(&self, property: &str, value: Value) {
        self.update_with(property, value, None);
    }

    /// Push a property update with a qualifier disambiguating multi-instance
    /// properties (e.g. which input).
    pub fn update_with(&self, property: &str, value: Value, qualifier: Option<Value>) {
        (self.out)(
            &self.alias,
            Payload::Update {
                property: property.to_owned(),
                value,
                qualifier,
            },
        );
    }

    /// Push a raw binary event value, base64-encoded to survive the text
    /// framing.
    pub fn update_raw(&self, property: &str, data: &[u8], qualifier: Option<Value>) {
        self.update_with(property, Value::from(BASE64.encode(data)), qualifier);
    }

    /// Push an unsolicited error for this object.
    pub fn error(&self, property: &str, message: &str) {
        (self.out)(
            &self.alias,
            Payload::Error {
                property: property.to_owned(),
                message: message.to_owned(),
                qualifier: None,
                query_id: None,
            },
        );
    }
}

/// Everything a type constructor needs to build one wrapper.
pub struct CreateContext {
    pub alias: String,
    pub declared_type: String,
    pub args: Vec<ResolvedArg>,
    pub events: UpdateSink,
}

impl CreateContext {
    /// Builder pre-seeded with this context's alias and declared type.
    pub fn builder(&self) -> WrapperBuilder {
        WrapperBuilder::new(&self.alias, &self.declared_type)
    }
}

/// Constructor function registered for one declared type.
pub type Constructor = Arc<dyn Fn(CreateContext) -> Result<Wrapper> + Send + Sync>;

/// Registry mapping declared-type names to constructor functions.
#[derive(Default)]
pub struct WrapperFactory {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl WrapperFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a declared type.
    pub fn register<F>(&self, declared_type: &str, constructor: F)
    where
        F: Fn(CreateContext) -> Result<Wrapper> + Send + Sync + 'static,
    {
        self.constructors
            .write()
            .insert(declared_type.to_owned(), Arc::new(constructor));
    }

    pub fn has_type(&self, declared_type: &str) -> bool {
        self.constructors.read().contains_key(declared_type)
    }

    /// Run the constructor for `ctx.declared_type` inside the construction
    /// failure boundary. Any failure surfaces as `ConstructionFailed`, the
    /// object is never registered, and the caller reports an Init-Error.
    pub fn construct(&self, ctx: CreateContext) -> Result<Wrapper> {
        let constructor = self
            .constructors
            .read()
            .get(&ctx.declared_type)
            .cloned()
            .ok_or_else(|| LinkError::UnknownType(ctx.declared_type.clone()))?;

        let alias = ctx.alias.clone();
        constructor(ctx).map_err(|e| LinkError::ConstructionFailed {
            alias,
            message: e.to_string(),
        })
    }
}
