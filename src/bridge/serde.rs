//! Binary HTTP envelopes.
//!
//! Requests and responses cross the file channel as self-describing
//! msgpack maps, so any peer implementation can produce and consume
//! them byte-for-byte. Header order and duplicates are preserved; the
//! body is opaque bytes; request `extensions` ride along as an opaque
//! bag that this implementation never interprets.

use super::BridgeError;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;

/// Wire form of an HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedHttpRequest {
    pub method: String,
    /// Full URL including query, e.g. `http://api.example.com/a?b=c`.
    pub url: String,
    /// Ordered name/value pairs; duplicates allowed.
    pub headers: Vec<(String, String)>,
    pub body: ByteBuf,
    /// Opaque bag carried for peers that populate it.
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Wire form of an HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedHttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: ByteBuf,
}

impl SerializedHttpRequest {
    /// Capture an `http` request into wire form. Extensions start
    /// empty; `http::Extensions` is typed and cannot be enumerated.
    pub fn from_http(request: &http::Request<Vec<u8>>) -> Result<Self, BridgeError> {
        Ok(Self {
            method: request.method().as_str().to_string(),
            url: request.uri().to_string(),
            headers: collect_headers(request.headers())?,
            body: ByteBuf::from(request.body().clone()),
            extensions: BTreeMap::new(),
        })
    }

    /// Rebuild an `http` request. The extensions bag is not mapped back
    /// onto `http::Extensions`; callers that need it read it off the
    /// envelope.
    pub fn into_http(self) -> Result<http::Request<Vec<u8>>, BridgeError> {
        let mut builder = http::Request::builder()
            .method(self.method.as_bytes())
            .uri(self.url.as_str());
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(self.body.into_vec())
            .map_err(|e| BridgeError::Envelope(e.to_string()))
    }

    /// Host component of the request URL, if any.
    pub fn host(&self) -> Option<String> {
        self.url
            .parse::<http::Uri>()
            .ok()
            .and_then(|uri| uri.host().map(|h| h.to_ascii_lowercase()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        rmp_serde::to_vec_named(self).map_err(|e| BridgeError::Envelope(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, BridgeError> {
        rmp_serde::from_slice(data).map_err(|e| BridgeError::Envelope(e.to_string()))
    }
}

impl SerializedHttpResponse {
    pub fn from_http(response: &http::Response<Vec<u8>>) -> Result<Self, BridgeError> {
        Ok(Self {
            status_code: response.status().as_u16(),
            reason: response.status().canonical_reason().map(String::from),
            headers: collect_headers(response.headers())?,
            body: ByteBuf::from(response.body().clone()),
        })
    }

    pub fn into_http(self) -> Result<http::Response<Vec<u8>>, BridgeError> {
        let mut builder = http::Response::builder().status(self.status_code);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(self.body.into_vec())
            .map_err(|e| BridgeError::Envelope(e.to_string()))
    }

    /// A synthetic response the bridge emits on its own behalf
    /// (403 outside the allow-list, 502/504 upstream failures).
    pub fn synthetic(status_code: u16, reason: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            reason: Some(reason.to_string()),
            headers: Vec::new(),
            body: ByteBuf::from(body.into()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        rmp_serde::to_vec_named(self).map_err(|e| BridgeError::Envelope(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, BridgeError> {
        rmp_serde::from_slice(data).map_err(|e| BridgeError::Envelope(e.to_string()))
    }
}

fn collect_headers(map: &http::HeaderMap) -> Result<Vec<(String, String)>, BridgeError> {
    map.iter()
        .map(|(name, value)| {
            let value = value
                .to_str()
                .map_err(|e| BridgeError::Envelope(format!("header {name} is not UTF-8: {e}")))?;
            Ok((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Serialize an `http` request into envelope bytes.
pub fn serialize_request(request: &http::Request<Vec<u8>>) -> Result<Vec<u8>, BridgeError> {
    SerializedHttpRequest::from_http(request)?.encode()
}

/// Deserialize envelope bytes back into an `http` request.
pub fn deserialize_request(data: &[u8]) -> Result<http::Request<Vec<u8>>, BridgeError> {
    SerializedHttpRequest::decode(data)?.into_http()
}

/// Serialize an `http` response into envelope bytes.
pub fn serialize_response(response: &http::Response<Vec<u8>>) -> Result<Vec<u8>, BridgeError> {
    SerializedHttpResponse::from_http(response)?.encode()
}

/// Deserialize envelope bytes back into an `http` response.
pub fn deserialize_response(data: &[u8]) -> Result<http::Response<Vec<u8>>, BridgeError> {
    SerializedHttpResponse::decode(data)?.into_http()
}
