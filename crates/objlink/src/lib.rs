//! Remote object link protocol
//!
//! Lets a program running off-device control and observe hardware-bound
//! objects that physically exist only inside a control processor's
//! runtime, by proxying every property read, property write, method call
//! and hardware event across a persistent TCP link.
//!
//! # Features
//!
//! - Delimiter-framed UTF-8 text protocol (`alias~~jsonPayload`)
//! - Init/Command/Query/Update/Error message taxonomy
//! - Per-call ticket correlation: asynchronous replies unblock ordinary
//!   blocking calls
//! - Node registries on both ends; reconnects re-register every proxy
//! - Generic wrapper factory: capability tables proxy an open set of
//!   object types without per-type protocol code
//! - Multi-listener server with per-session auth and alias fan-out
//!
//! # Example
//!
//! ## Server
//!
//! ```no_run
//! use objlink::{LinkServer, ServerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> objlink::Result<()> {
//!     let server = LinkServer::new(
//!         ServerConfig::new("hunter2").listen_on(vec!["0.0.0.0:42700".parse().unwrap()]),
//!     );
//!
//!     server.factory().register("RelayInterface", |ctx| {
//!         Ok(ctx
//!             .builder()
//!             .read("State", || Ok(json!("Open")))
//!             .method("Pulse", |_args| async { Ok(json!(null)) })
//!             .build())
//!     });
//!
//!     server.run().await
//! }
//! ```
//!
//! ## Client
//!
//! ```no_run
//! use objlink::{LinkConfig, LinkEngine};
//!
//! #[tokio::main]
//! async fn main() -> objlink::Result<()> {
//!     let engine = LinkEngine::connect(LinkConfig::new(
//!         "10.0.0.5:42700".parse().unwrap(),
//!         "hunter2",
//!     ));
//!     engine.wait_connected().await;
//!
//!     let relay = engine.create_node("Relay1", "RelayInterface", vec![]).await?;
//!     let state = relay.get("State").await?;
//!     println!("relay state: {}", state);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod proxy;
pub mod server;
pub mod ticket;
pub mod version;
pub mod wrapper;

pub use client::{LinkConfig, LinkEngine};
pub use envelope::{
    validate_alias, Envelope, Payload, ALIAS_SEPARATOR, CODE_CREATE_FAILED, CODE_MISSING_DEVICE,
    PING_FRAME, PONG_FRAME,
};
pub use error::{LinkError, Result};
pub use framing::{FrameCodec, FrameReader, FrameWriter, FRAME_DELIMITER};
pub use proxy::{NodeEvent, NodeHandler, NodeProxy};
pub use server::{
    LinkServer, NodeTable, ServerConfig, ServerStats, ServerStatsSnapshot, DEFAULT_PORT,
};
pub use ticket::{TicketGuard, TicketTable};
pub use wrapper::{
    Capability, CreateContext, ResolvedArg, UpdateSink, Wrapper, WrapperBuilder, WrapperFactory,
};
