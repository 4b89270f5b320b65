//! JSON-RPC 2.0 envelope codec for MCP messages
//!
//! The proxy is transport-transparent: it never rewrites payloads, so every
//! decoded [`Message`] retains the complete raw JSON object it was parsed
//! from. Encoding a decoded message therefore reproduces the original JSON
//! byte-for-byte modulo whitespace, and unknown fields survive forwarding.
//!
//! Classification is purely structural, mirroring the JSON-RPC 2.0 shapes:
//!
//! - `method` present, non-null `id` present -- [`Message::Request`]
//! - `method` present, no `id`              -- [`Message::Notification`]
//! - non-null `id` with `result` or `error` -- [`Message::Response`]
//! - a JSON array of the above              -- [`Message::Batch`]
//!
//! Anything else fails with [`ProxyError::MalformedMessage`].

use std::fmt;

use serde_json::Value;

use crate::error::ProxyError;

/// A JSON-RPC request/response correlation identifier.
///
/// Per the MCP spec an `id` is either a finite integer or a string. The
/// proxy never rewrites IDs; this type exists so the bridge can match
/// responses to requests without touching the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Integer identifier.
    Number(i64),
    /// String identifier.
    String(String),
}

impl MessageId {
    /// Parse an `id` field value. Returns `None` for null, floats, and any
    /// other non-conforming JSON value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(MessageId::Number),
            Value::String(s) => Some(MessageId::String(s.clone())),
            _ => None,
        }
    }

    /// Render the identifier back into a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            MessageId::Number(n) => Value::from(*n),
            MessageId::String(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::String(s) => write!(f, "{s}"),
        }
    }
}

/// The JSON-RPC method name of the MCP `initialize` request.
pub const METHOD_INITIALIZE: &str = "initialize";

/// The JSON-RPC method name of the MCP `initialized` notification.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";

/// A classified MCP envelope.
///
/// Each variant keeps the raw JSON it was decoded from in `payload` so that
/// forwarding is lossless. The extracted `id`/`method` fields are an index
/// into the payload, not a replacement for it.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request: `method` plus a non-null `id`.
    Request {
        /// Correlation identifier, preserved end-to-end.
        id: MessageId,
        /// The method name.
        method: String,
        /// The complete raw envelope.
        payload: Value,
    },
    /// A response: non-null `id` plus `result` or `error`.
    Response {
        /// Mirrors the `id` of the corresponding request.
        id: MessageId,
        /// The complete raw envelope.
        payload: Value,
    },
    /// A notification: `method` with no `id`.
    Notification {
        /// The method name.
        method: String,
        /// The complete raw envelope.
        payload: Value,
    },
    /// An ordered batch frame (JSON array of envelopes).
    Batch(Vec<Message>),
}

impl Message {
    /// Decode a single line/frame of JSON into a classified message.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::MalformedMessage`] when the input is not valid
    /// JSON or matches none of the JSON-RPC shapes.
    pub fn decode(raw: &str) -> Result<Self, ProxyError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProxyError::MalformedMessage(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Classify an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::MalformedMessage`] when the value matches none
    /// of the JSON-RPC shapes (including an empty batch array).
    pub fn from_value(value: Value) -> Result<Self, ProxyError> {
        if let Value::Array(items) = value {
            if items.is_empty() {
                return Err(ProxyError::MalformedMessage("empty batch frame".to_string()));
            }
            let messages = items
                .into_iter()
                .map(Self::from_value)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Message::Batch(messages));
        }

        if !value.is_object() {
            return Err(ProxyError::MalformedMessage(format!(
                "expected a JSON object, got: {value}"
            )));
        }

        let id = value
            .get("id")
            .filter(|v| !v.is_null())
            .map(|v| {
                MessageId::from_value(v).ok_or_else(|| {
                    ProxyError::MalformedMessage(format!("id is neither integer nor string: {v}"))
                })
            })
            .transpose()?;
        let method = value.get("method").and_then(|m| m.as_str()).map(String::from);
        let has_result = value.get("result").is_some();
        let has_error = value.get("error").is_some();

        match (id, method) {
            (Some(id), Some(method)) => Ok(Message::Request { id, method, payload: value }),
            (None, Some(method)) => Ok(Message::Notification { method, payload: value }),
            (Some(id), None) if has_result || has_error => {
                Ok(Message::Response { id, payload: value })
            }
            _ => Err(ProxyError::MalformedMessage(format!(
                "envelope matches no JSON-RPC shape: {value}"
            ))),
        }
    }

    /// Serialize the message back to compact single-line JSON.
    ///
    /// Safe for newline framing and SSE `data:` fields: `serde_json` never
    /// emits raw newlines inside compact output.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    /// Reassemble the raw JSON value (the untouched payload; for batches,
    /// the array of member payloads).
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request { payload, .. }
            | Message::Response { payload, .. }
            | Message::Notification { payload, .. } => payload.clone(),
            Message::Batch(items) => Value::Array(items.iter().map(Message::to_value).collect()),
        }
    }

    /// The correlation identifier, when the message has one.
    pub fn id(&self) -> Option<&MessageId> {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => Some(id),
            _ => None,
        }
    }

    /// The method name, when the message has one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    /// The `params` field, when present.
    pub fn params(&self) -> Option<&Value> {
        match self {
            Message::Request { payload, .. } | Message::Notification { payload, .. } => {
                payload.get("params")
            }
            _ => None,
        }
    }

    /// `true` for an MCP `initialize` request.
    pub fn is_initialize(&self) -> bool {
        matches!(self, Message::Request { method, .. } if method == METHOD_INITIALIZE)
    }

    /// `true` for an MCP `notifications/initialized` notification.
    pub fn is_initialized_notification(&self) -> bool {
        matches!(self, Message::Notification { method, .. } if method == METHOD_INITIALIZED)
    }

    /// Build a request envelope from parts.
    pub fn request(id: MessageId, method: &str, params: Value) -> Self {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id.to_value(),
            "method": method,
            "params": params,
        });
        Message::Request { id, method: method.to_string(), payload }
    }

    /// Build a successful response envelope from parts.
    pub fn response(id: MessageId, result: Value) -> Self {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id.to_value(),
            "result": result,
        });
        Message::Response { id, payload }
    }

    /// Build a notification envelope from parts. `params` is omitted from
    /// the wire when `None`.
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        let payload = match params {
            Some(params) => serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
            None => serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
            }),
        };
        Message::Notification { method: method.to_string(), payload }
    }
}
