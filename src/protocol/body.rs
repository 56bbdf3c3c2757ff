//! Body serialization rules.
//!
//! The wire carries opaque bytes. Callers hand the client one of the
//! supported shapes; anything that cannot be represented fails with
//! `UnserializableBody` before a single byte hits disk.

use super::{ProtocolError, ProtocolResult};
use serde::Serialize;

/// A request or response body before serialization.
///
/// Bytes pass through untouched, strings become UTF-8, and structured
/// values become canonical JSON (serde_json sorts map keys), so
/// re-serializing a decoded body is stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Body {
    /// Serialize into wire bytes.
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        match self {
            Body::Empty => Ok(Vec::new()),
            Body::Bytes(bytes) => Ok(bytes.clone()),
            Body::Text(text) => Ok(text.as_bytes().to_vec()),
            Body::Json(value) => serde_json::to_vec(value)
                .map_err(|e| ProtocolError::UnserializableBody(e.to_string())),
        }
    }

    /// Build a JSON body from any `Serialize` type.
    ///
    /// Structured typed objects take their JSON representation; types
    /// serde cannot represent as JSON (non-string map keys, etc.) fail
    /// with `UnserializableBody`.
    pub fn from_serialize<T: Serialize>(value: &T) -> ProtocolResult<Body> {
        serde_json::to_value(value)
            .map(Body::Json)
            .map_err(|e| ProtocolError::UnserializableBody(e.to_string()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<&[u8]> for Body {
    fn from(bytes: &[u8]) -> Self {
        Body::Bytes(bytes.to_vec())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Body::Json(value)
    }
}
