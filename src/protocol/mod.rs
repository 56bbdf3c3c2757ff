//! Request and response records of the filesystem RPC protocol.
//!
//! A request is written once as `<endpoint>/<sender>/<id>.request`; the
//! matching response appears beside it as `<id>.response`. Records are
//! value types: once serialized they are never rewritten, only
//! accompanied by sibling files.

pub mod body;
pub mod codec;
pub mod expiry;

pub use body::Body;
pub use expiry::parse_expiry;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use syftbox_types::{SyftUrl, UrlError};
use thiserror::Error;
use uuid::Uuid;

/// File suffix of request records.
pub const REQUEST_SUFFIX: &str = ".request";
/// File suffix of response records.
pub const RESPONSE_SUFFIX: &str = ".response";
/// File suffix of rejection markers. A rejection marker is an empty
/// sentinel; its presence alone means "acknowledged as unhandleable".
pub const REJECTED_SUFFIX: &str = ".syftrejected.request";

/// Sender string used on responses synthesized locally (expired,
/// rejected, undecodable) rather than read from disk.
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Error type for the protocol layer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed URL: {0}")]
    MalformedUrl(#[from] UrlError),

    #[error("unserializable body: {0}")]
    UnserializableBody(String),

    #[error("invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// HTTP verbs carried by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            other => Err(ProtocolError::InvalidMethod(other.to_string())),
        }
    }
}

/// Response status codes, including the negative-space codes the fabric
/// synthesizes when no responder ever ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Status {
    /// Request observed but not yet answered.
    Pending = 102,
    /// Handler completed.
    Completed = 200,
    /// Request was readable but malformed for the handler.
    BadRequest = 400,
    /// Responder refused the request (rejection marker observed).
    Rejected = 403,
    /// No route matched the endpoint.
    NotFound = 404,
    /// Deadline passed with no response.
    Expired = 419,
    /// Handler failed.
    Error = 500,
}

impl Status {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            102 => Some(Status::Pending),
            200 => Some(Status::Completed),
            400 => Some(Status::BadRequest),
            403 => Some(Status::Rejected),
            404 => Some(Status::NotFound),
            419 => Some(Status::Expired),
            500 => Some(Status::Error),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }

    /// Everything except [`Status::Pending`] ends the request's lifecycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Pending)
    }
}

/// Ordered, case-insensitive header multimap. Duplicates are allowed and
/// preserved in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical form for fingerprinting: lowercased names, pairs sorted,
    /// one `name:value` per line.
    pub fn canonical(&self) -> String {
        let mut pairs: Vec<String> = self
            .0
            .iter()
            .map(|(n, v)| format!("{}:{}", n.to_ascii_lowercase(), v))
            .collect();
        pairs.sort();
        pairs.join("\n")
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Current UTC time truncated to the protocol's millisecond precision.
pub fn now_ms() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A request record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// Unique 128-bit identifier; v7 UUIDs sort lexicographically by
    /// creation time.
    pub id: Uuid,
    /// Sender datasite.
    pub sender: String,
    /// Target endpoint URL.
    pub url: SyftUrl,
    pub method: Method,
    pub headers: Headers,
    /// Opaque body bytes; see [`Body`] for the serialization rules.
    pub body: Vec<u8>,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl RpcRequest {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Age of the record in seconds.
    pub fn age(&self) -> f64 {
        (Utc::now() - self.created).num_milliseconds() as f64 / 1000.0
    }

    /// Directory holding this request's files:
    /// `<rpc-dir>/<endpoint>/<sender>/`.
    pub fn local_dir(&self, datasites_root: &Path) -> PathBuf {
        self.url.to_local_path(datasites_root).join(&self.sender)
    }

    pub fn request_path(&self, datasites_root: &Path) -> PathBuf {
        self.local_dir(datasites_root)
            .join(format!("{}{}", self.id, REQUEST_SUFFIX))
    }

    pub fn response_path(&self, datasites_root: &Path) -> PathBuf {
        self.local_dir(datasites_root)
            .join(format!("{}{}", self.id, RESPONSE_SUFFIX))
    }

    pub fn rejected_path(&self, datasites_root: &Path) -> PathBuf {
        self.local_dir(datasites_root)
            .join(format!("{}{}", self.id, REJECTED_SUFFIX))
    }
}

/// A response record. Shares the request's id and URL; `sender` is the
/// responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub id: Uuid,
    pub sender: String,
    pub url: SyftUrl,
    pub status: Status,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl RpcResponse {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Age of the record in seconds.
    pub fn age(&self) -> f64 {
        (Utc::now() - self.created).num_milliseconds() as f64 / 1000.0
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8.
    pub fn text(&self) -> ProtocolResult<String> {
        String::from_utf8(self.body.clone())
            .map_err(|e| ProtocolError::Decode(format!("body is not UTF-8: {e}")))
    }

    /// Body parsed as JSON into `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> ProtocolResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ProtocolError::Decode(format!("body is not valid JSON: {e}")))
    }

    /// Synthesized response for a request that never got an answer
    /// (expired deadline, rejection marker, undecodable file).
    pub fn synthesized(url: SyftUrl, id: Uuid, status: Status, body: Vec<u8>) -> Self {
        let now = now_ms();
        Self {
            id,
            sender: SYSTEM_SENDER.to_string(),
            url,
            status,
            headers: Headers::new(),
            body,
            created: now,
            expires: now,
        }
    }
}
