//! Transport error taxonomy
//!
//! Connection-level failures (DNS/TCP/TLS/timeout) are distinct from HTTP
//! status errors so the retry loop can tell "the node is unreachable" apart
//! from "the node answered and said no". Status errors for 400/404/409 get
//! their own kinds because callers routinely match on them.

use serde_json::Value;
use thiserror::Error;

/// Errors produced by the transport and its connections
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying network call could not complete (DNS, TCP, TLS, wire)
    #[error("connection error ({host}): {message}")]
    Connection { host: String, message: String },

    /// The attempt exceeded its effective timeout
    #[error("request to {host} timed out")]
    Timeout { host: String },

    /// Non-2xx response not otherwise classified
    #[error("HTTP {status}: {reason}")]
    Status {
        status: u16,
        reason: String,
        body: Option<Value>,
    },

    /// HTTP 400
    #[error("HTTP 400 (bad request): {reason}")]
    BadRequest { reason: String, body: Option<Value> },

    /// HTTP 404
    #[error("HTTP 404 (not found): {reason}")]
    NotFound { reason: String, body: Option<Value> },

    /// HTTP 409
    #[error("HTTP 409 (conflict): {reason}")]
    Conflict { reason: String, body: Option<Value> },

    /// A sniff cycle yielded zero usable hosts
    #[error("Unable to sniff hosts: {0}")]
    Sniff(String),

    /// The pool has no connections at all (configuration error, not retryable)
    #[error("no connections available in the pool")]
    NoConnections,

    /// The transport was closed
    #[error("transport is closed")]
    Closed,

    /// Request body or response body could not be encoded/decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A raw body could not be carried in a `source` query parameter,
    /// which only holds valid UTF-8
    #[error("source-mode request body must be valid UTF-8")]
    NonUtf8Body,

    /// A host descriptor could not be parsed
    #[error("invalid host {url:?}: {message}")]
    InvalidHost { url: String, message: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Build the typed error for a non-2xx response.
    ///
    /// 400/404/409 map to their specific kinds; everything else becomes the
    /// general status error. The reason is extracted from the JSON error body
    /// when present, falling back to the raw text.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let (reason, body_json) = extract_reason(&text);
        match status {
            400 => TransportError::BadRequest {
                reason,
                body: body_json,
            },
            404 => TransportError::NotFound {
                reason,
                body: body_json,
            },
            409 => TransportError::Conflict {
                reason,
                body: body_json,
            },
            _ => TransportError::Status {
                status,
                reason,
                body: body_json,
            },
        }
    }

    /// HTTP status code carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::BadRequest { .. } => Some(400),
            TransportError::NotFound { .. } => Some(404),
            TransportError::Conflict { .. } => Some(409),
            _ => None,
        }
    }

    /// True for failures where the network call itself did not complete
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. } | TransportError::Timeout { .. }
        )
    }
}

/// Pull a human-readable reason out of an error body.
///
/// Tries `error.root_cause[0].reason`, then `error.reason`, then a bare
/// string `error` field, before giving up and using the raw text.
fn extract_reason(text: &str) -> (String, Option<Value>) {
    match serde_json::from_str::<Value>(text) {
        Ok(v) => {
            let reason = reason_from_json(&v).unwrap_or_else(|| text.trim().to_string());
            (reason, Some(v))
        }
        Err(_) => (text.trim().to_string(), None),
    }
}

fn reason_from_json(v: &Value) -> Option<String> {
    let error = v.get("error")?;
    error
        .get("root_cause")
        .and_then(|rc| rc.get(0))
        .and_then(|rc0| rc0.get("reason"))
        .and_then(Value::as_str)
        .or_else(|| error.get("reason").and_then(Value::as_str))
        .or_else(|| error.as_str())
        .map(str::to_string)
}
