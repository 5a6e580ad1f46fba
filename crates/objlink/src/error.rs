//! Error types for the object link protocol

use thiserror::Error;

/// Link error types
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("authentication rejected")]
    AuthRejected,

    #[error("protocol version too old: required {required}, offered {offered}")]
    VersionTooOld { required: String, offered: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("invalid alias: {0}")]
    InvalidAlias(String),

    #[error("unknown alias: {0}")]
    UnknownAlias(String),

    #[error("unknown declared type: {0}")]
    UnknownType(String),

    #[error("unknown property {property} on {alias}")]
    UnknownProperty { alias: String, property: String },

    #[error("property {property} on {alias} is read-only")]
    ReadOnly { alias: String, property: String },

    #[error("construction of {alias} failed: {message}")]
    ConstructionFailed { alias: String, message: String },

    #[error("remote error on {property}: {message}")]
    Remote {
        property: String,
        message: String,
        code: Option<String>,
    },

    #[error("query {property} on {alias} timed out")]
    QueryTimeout { alias: String, property: String },

    #[error("creation queue full")]
    CreationQueueFull,
}

impl LinkError {
    /// Error code carried in the `qualifier` of a remote error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            LinkError::Remote { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
