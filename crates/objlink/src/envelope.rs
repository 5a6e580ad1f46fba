//! Envelope and payload model for the object link wire contract
//!
//! Every authenticated frame except the keepalive literals is
//! `alias~~jsonPayload`. The payload is a JSON object discriminated on its
//! `"type"` field: the reserved tags `command`, `query`, `update`, `error`
//! and `init` select the message kind, while any other tag is a creation
//! request whose `"type"` carries the declared type of the object to build
//! (the ack comes back with `"type":"init"`).

use crate::error::{LinkError, Result};
use serde_json::{json, Map, Value};

/// Joins alias and payload inside a frame.
pub const ALIAS_SEPARATOR: &str = "~~";

/// Keepalive request literal, answered inline without alias routing.
pub const PING_FRAME: &str = "ping";

/// Keepalive answer literal.
pub const PONG_FRAME: &str = "pong";

/// Error code reported for frames addressed to an unregistered alias.
pub const CODE_MISSING_DEVICE: &str = "missing device";

/// Error code reported when wrapper construction fails.
pub const CODE_CREATE_FAILED: &str = "create failed";

const TAG_INIT: &str = "init";
const TAG_COMMAND: &str = "command";
const TAG_QUERY: &str = "query";
const TAG_UPDATE: &str = "update";
const TAG_ERROR: &str = "error";

/// One message of the link protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Creation request (client to server).
    Init {
        declared_type: String,
        args: Vec<Value>,
    },
    /// Creation acknowledgement or value dump (server to client).
    InitAck { value: Value },
    /// Fire-and-forget invocation or property assignment. Never answered.
    Command { property: String, args: Vec<Value> },
    /// Request expecting exactly one reply bearing the same query id.
    Query {
        query_id: u64,
        property: String,
        args: Vec<Value>,
    },
    /// The one reply to a `Query`.
    QueryResult { query_id: u64, value: Value },
    /// Unsolicited push, usually from a hardware event. Never answered.
    Update {
        property: String,
        value: Value,
        qualifier: Option<Value>,
    },
    /// Failure report; `query_id` is present iff answering a pending query.
    Error {
        property: String,
        message: String,
        qualifier: Option<Value>,
        query_id: Option<u64>,
    },
}

impl Payload {
    /// Shorthand for the protocol-level "missing device" error.
    pub fn missing_device(property: impl Into<String>, query_id: Option<u64>) -> Self {
        Payload::Error {
            property: property.into(),
            message: "no such device registered".to_owned(),
            qualifier: Some(json!({ "code": CODE_MISSING_DEVICE })),
            query_id,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Payload::Init {
                declared_type,
                args,
            } => json!({ "type": declared_type, "args": args }),
            Payload::InitAck { value } => json!({ "type": TAG_INIT, "value": value }),
            Payload::Command { property, args } => {
                json!({ "type": TAG_COMMAND, "property": property, "args": args })
            }
            Payload::Query {
                query_id,
                property,
                args,
            } => json!({
                "type": TAG_QUERY,
                "query id": query_id,
                "property": property,
                "args": args,
            }),
            Payload::QueryResult { query_id, value } => {
                json!({ "type": TAG_QUERY, "query id": query_id, "value": value })
            }
            Payload::Update {
                property,
                value,
                qualifier,
            } => json!({
                "type": TAG_UPDATE,
                "property": property,
                "value": value,
                "qualifier": qualifier,
            }),
            Payload::Error {
                property,
                message,
                qualifier,
                query_id,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), Value::from(TAG_ERROR));
                map.insert("property".into(), Value::from(property.clone()));
                map.insert("message".into(), Value::from(message.clone()));
                map.insert(
                    "qualifier".into(),
                    qualifier.clone().unwrap_or(Value::Null),
                );
                if let Some(id) = query_id {
                    map.insert("query id".into(), Value::from(*id));
                }
                Value::Object(map)
            }
        }
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(LinkError::MalformedFrame(format!(
                    "payload is not an object: {}",
                    other
                )))
            }
        };

        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| LinkError::MalformedFrame("payload has no type".into()))?
            .to_owned();

        match tag.as_str() {
            TAG_INIT => Ok(Payload::InitAck {
                value: obj.get("value").cloned().unwrap_or(Value::Null),
            }),
            TAG_COMMAND => Ok(Payload::Command {
                property: required_str(&obj, "property")?,
                args: arg_list(&obj),
            }),
            TAG_QUERY => {
                let query_id = obj
                    .get("query id")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| LinkError::MalformedFrame("query without query id".into()))?;
                // A request names a property; the reply carries only a value.
                if obj.contains_key("property") {
                    Ok(Payload::Query {
                        query_id,
                        property: required_str(&obj, "property")?,
                        args: arg_list(&obj),
                    })
                } else {
                    Ok(Payload::QueryResult {
                        query_id,
                        value: obj.get("value").cloned().unwrap_or(Value::Null),
                    })
                }
            }
            TAG_UPDATE => Ok(Payload::Update {
                property: required_str(&obj, "property")?,
                value: obj.get("value").cloned().unwrap_or(Value::Null),
                qualifier: non_null(obj.get("qualifier")),
            }),
            TAG_ERROR => Ok(Payload::Error {
                property: obj
                    .get("property")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                qualifier: non_null(obj.get("qualifier")),
                query_id: obj.get("query id").and_then(Value::as_u64),
            }),
            declared_type if !declared_type.is_empty() => Ok(Payload::Init {
                declared_type: declared_type.to_owned(),
                args: arg_list(&obj),
            }),
            _ => Err(LinkError::MalformedFrame("payload has empty type".into())),
        }
    }

    /// Error code carried in the qualifier, if present.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Payload::Error {
                qualifier: Some(q), ..
            } => q.get("code").and_then(Value::as_str),
            _ => None,
        }
    }
}

fn required_str(obj: &Map<String, Value>, key: &str) -> Result<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| LinkError::MalformedFrame(format!("payload missing {}", key)))
}

fn arg_list(obj: &Map<String, Value>) -> Vec<Value> {
    match obj.get("args") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single.clone()],
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.clone()),
    }
}

/// The alias+payload unit carried by one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub alias: String,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(alias: impl Into<String>, payload: Payload) -> Self {
        Self {
            alias: alias.into(),
            payload,
        }
    }

    /// Serialize to frame text (`alias~~jsonPayload`, without the delimiter).
    pub fn to_frame(&self) -> String {
        format!(
            "{}{}{}",
            self.alias,
            ALIAS_SEPARATOR,
            self.payload.to_json()
        )
    }

    /// Parse a frame produced by `to_frame`.
    pub fn parse(frame: &str) -> Result<Self> {
        let (alias, json) = frame
            .split_once(ALIAS_SEPARATOR)
            .ok_or_else(|| LinkError::MalformedFrame(format!("no alias separator: {}", frame)))?;
        validate_alias(alias)?;
        let value: Value = serde_json::from_str(json)?;
        Ok(Self {
            alias: alias.to_owned(),
            payload: Payload::from_json(value)?,
        })
    }
}

/// Check the process-unique alias rules: non-empty, no separator sequence,
/// no control characters (which would collide with the frame delimiter).
pub fn validate_alias(alias: &str) -> Result<()> {
    if alias.is_empty() {
        return Err(LinkError::InvalidAlias("empty alias".into()));
    }
    if alias.contains(ALIAS_SEPARATOR) {
        return Err(LinkError::InvalidAlias(format!(
            "alias contains separator: {}",
            alias
        )));
    }
    if alias.chars().any(char::is_control) {
        return Err(LinkError::InvalidAlias(format!(
            "alias contains control characters: {:?}",
            alias
        )));
    }
    Ok(())
}
