//! `syft://` URL parsing and construction.
//!
//! A SyftUrl names an RPC endpoint inside a datasite's app subtree:
//! `syft://<datasite>/app_data/<app>/rpc/<endpoint...>`. The endpoint may
//! span multiple path segments. Parsing and printing are byte-exact
//! inverses for well-formed input.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const SCHEME: &str = "syft://";

/// Error type for URL parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    /// URL did not match `syft://<datasite>/app_data/<app>/rpc/<endpoint>`
    #[error("malformed syft URL: {0}")]
    Malformed(String),
}

/// A parsed `syft://` URL.
///
/// Fields are parsed once; [`fmt::Display`] reconstructs the original
/// string byte-exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyftUrl {
    /// Datasite identity, `user@domain`, treated as an opaque key.
    pub datasite: String,
    /// Application name under `app_data/`.
    pub app: String,
    /// Endpoint path below `rpc/`, without leading or trailing slash.
    /// May contain embedded slashes.
    pub endpoint: String,
}

impl SyftUrl {
    pub fn new(
        datasite: impl Into<String>,
        app: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into();
        Self {
            datasite: datasite.into(),
            app: app.into(),
            endpoint: endpoint.trim_matches('/').to_string(),
        }
    }

    /// Parse a `syft://` URL string.
    pub fn parse(s: &str) -> Result<Self, UrlError> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| UrlError::Malformed(s.to_string()))?;

        // <datasite>/app_data/<app>/rpc/<endpoint...>
        let mut parts = rest.splitn(4, '/');
        let datasite = parts.next().unwrap_or("");
        let app_data = parts.next().unwrap_or("");
        let app = parts.next().unwrap_or("");
        let tail = parts.next().unwrap_or("");

        if datasite.is_empty() || app_data != "app_data" || app.is_empty() {
            return Err(UrlError::Malformed(s.to_string()));
        }

        let endpoint = tail
            .strip_prefix("rpc/")
            .filter(|e| !e.is_empty())
            .ok_or_else(|| UrlError::Malformed(s.to_string()))?;

        Ok(Self {
            datasite: datasite.to_string(),
            app: app.to_string(),
            endpoint: endpoint.to_string(),
        })
    }

    /// Local filesystem directory for this endpoint, rooted at the
    /// workspace datasites directory.
    pub fn to_local_path(&self, datasites_root: &Path) -> PathBuf {
        let mut path = datasites_root
            .join(&self.datasite)
            .join("app_data")
            .join(&self.app)
            .join("rpc");
        for segment in self.endpoint.split('/') {
            path = path.join(segment);
        }
        path
    }

    /// The URL with the endpoint replaced, keeping datasite and app.
    pub fn with_endpoint(&self, endpoint: impl Into<String>) -> Self {
        Self::new(self.datasite.clone(), self.app.clone(), endpoint)
    }
}

impl fmt::Display for SyftUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SCHEME}{}/app_data/{}/rpc/{}",
            self.datasite, self.app, self.endpoint
        )
    }
}

impl FromStr for SyftUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SyftUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SyftUrl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Cheap shape check for a datasite identity string.
///
/// Identities are opaque case-sensitive keys of the form `user@domain`;
/// this only rejects strings that cannot be one.
pub fn looks_like_datasite(s: &str) -> bool {
    match s.split_once('@') {
        Some((user, domain)) => !user.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}
