//! JSON-RPC 2.0 message model for the ACP wire.
//!
//! Inbound JSON documents are classified with [`Message::from_value`]:
//!
//! | Shape                                | Classified as               |
//! |--------------------------------------|-----------------------------|
//! | `id` + `method`                      | [`Message::Request`]        |
//! | `id` + `result` or `error`           | [`Message::Response`]       |
//! | `method`, no `id`                    | [`Message::Notification`]   |
//! | anything else                        | `AppError::Protocol`        |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{AppError, Result};

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC `id` as it appears on the wire.
///
/// Requests issued by this client always use numeric ids; agents may use
/// either form for their own requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// Numeric id.
    Number(u64),
    /// String id.
    String(String),
}

impl MessageId {
    /// Numeric value, if this is a numeric id.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// A single JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request expecting a response.
    Request {
        /// Correlation id.
        id: MessageId,
        /// Method name.
        method: String,
        /// Method parameters.
        params: Option<Value>,
    },
    /// Response to an earlier request.
    Response {
        /// Correlation id of the originating request.
        id: MessageId,
        /// `result` on success, `error` on failure.
        outcome: std::result::Result<Value, RpcError>,
    },
    /// One-way message; no response is expected.
    Notification {
        /// Method name.
        method: String,
        /// Method parameters.
        params: Option<Value>,
    },
}

impl Message {
    /// Build a request with a numeric correlation id.
    #[must_use]
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id: MessageId::Number(id),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Build a notification.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self::Notification {
            method: method.into(),
            params: Some(params),
        }
    }

    /// Build an error response to an agent-initiated request.
    #[must_use]
    pub fn error_response(id: MessageId, error: RpcError) -> Self {
        Self::Response {
            id,
            outcome: Err(error),
        }
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    /// Serialise to a JSON-RPC 2.0 object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                obj.insert("id".into(), json!(id));
                obj.insert("method".into(), json!(method));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                obj.insert("id".into(), json!(id));
                match outcome {
                    Ok(result) => obj.insert("result".into(), result.clone()),
                    Err(error) => obj.insert("error".into(), json!(error)),
                };
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), json!(method));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
        }
        Value::Object(obj)
    }

    /// Classify a decoded JSON document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when the document is not an object, the
    /// `id` is neither a non-negative integer nor a string, an `error` object
    /// is malformed, or the message matches none of the JSON-RPC shapes.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(AppError::Protocol("message is not a JSON object".into()));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<MessageId>(raw)
                    .map_err(|e| AppError::Protocol(format!("invalid id: {e}")))?,
            ),
        };
        let method = match obj.remove("method") {
            None => None,
            Some(Value::String(m)) => Some(m),
            Some(_) => return Err(AppError::Protocol("method must be a string".into())),
        };
        let params = obj.remove("params");

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => {
                if let Some(error) = obj.remove("error") {
                    let error: RpcError = serde_json::from_value(error)
                        .map_err(|e| AppError::Protocol(format!("invalid error object: {e}")))?;
                    Ok(Self::Response {
                        id,
                        outcome: Err(error),
                    })
                } else if let Some(result) = obj.remove("result") {
                    Ok(Self::Response {
                        id,
                        outcome: Ok(result),
                    })
                } else {
                    Err(AppError::Protocol(format!(
                        "message {id} has neither result nor error"
                    )))
                }
            }
            (None, None) => Err(AppError::Protocol(
                "message has neither id nor method".into(),
            )),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
