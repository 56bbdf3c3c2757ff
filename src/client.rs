//! Workspace client: local identity, directory layout, and path/URL mapping.
//!
//! The client object is the host application's handle to the synced
//! workspace. It knows the local datasite identity, where the workspace
//! lives on disk, and how to translate between filesystem paths and
//! `syft://` URLs. Everything else in the fabric takes a [`Client`]
//! rather than reading config on its own.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use syftbox_types::{looks_like_datasite, SyftUrl, UrlError};
use thiserror::Error;
use tracing::warn;

/// Error type for config loading and path mapping.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("path {path} is not inside the datasites root {root}")]
    OutsideWorkspace { path: String, root: String },

    #[error("path {0} does not map to an rpc endpoint")]
    NotAnEndpoint(String),
}

/// On-disk client configuration.
///
/// Resolved once at startup from a JSON config file. Unknown fields are
/// ignored so older configs keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local datasite identity, `user@domain`.
    pub email: String,
    /// Workspace root directory containing `datasites/`.
    pub data_dir: PathBuf,
    /// Sync server URL, unused by the fabric itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }
}

/// Local directory layout of a synced workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory containing one subtree per datasite.
    pub fn datasites(&self) -> PathBuf {
        self.root.join("datasites")
    }
}

/// Handle to the local workspace and datasite identity.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
    workspace: Workspace,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        if !looks_like_datasite(&config.email) {
            warn!("client identity {:?} does not look like user@domain", config.email);
        }
        let workspace = Workspace::new(config.data_dir.clone());
        Self { config, workspace }
    }

    /// Load the client from a JSON config file.
    pub fn load(config_path: &Path) -> Result<Self, ClientError> {
        Ok(Self::new(ClientConfig::load(config_path)?))
    }

    /// Local datasite identity.
    pub fn email(&self) -> &str {
        &self.config.email
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Root of all datasite subtrees.
    pub fn datasites(&self) -> PathBuf {
        self.workspace.datasites()
    }

    /// The local datasite's own subtree.
    pub fn my_datasite(&self) -> PathBuf {
        self.datasites().join(self.email())
    }

    /// App data directory for `app` in the given datasite's subtree.
    pub fn app_data(&self, app: &str, datasite: &str) -> PathBuf {
        self.datasites().join(datasite).join("app_data").join(app)
    }

    /// The local RPC directory for `app` under our own datasite.
    pub fn app_rpc_dir(&self, app: &str) -> PathBuf {
        self.app_data(app, self.email()).join("rpc")
    }

    /// Path of a file relative to the datasites root.
    pub fn relative_to_datasites(&self, path: &Path) -> Result<PathBuf, ClientError> {
        let datasites = self.datasites();
        if !syftbox_types::is_subpath(path, &datasites) {
            return Err(ClientError::OutsideWorkspace {
                path: path.display().to_string(),
                root: datasites.display().to_string(),
            });
        }
        path.strip_prefix(&datasites)
            .map(|p| p.to_path_buf())
            .map_err(|_| ClientError::OutsideWorkspace {
                path: path.display().to_string(),
                root: datasites.display().to_string(),
            })
    }

    /// Map an absolute path inside the workspace back to a `syft://` URL.
    ///
    /// The path must point at or below an rpc endpoint directory,
    /// `datasites/<site>/app_data/<app>/rpc/<endpoint...>`.
    pub fn to_syft_url(&self, path: &Path) -> Result<SyftUrl, ClientError> {
        let rel = self.relative_to_datasites(path)?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();

        // <site>/app_data/<app>/rpc/<endpoint...>
        if parts.len() < 5 || parts[1] != "app_data" || parts[3] != "rpc" {
            return Err(ClientError::NotAnEndpoint(path.display().to_string()));
        }

        let endpoint = parts[4..].join("/");
        SyftUrl::parse(&format!(
            "syft://{}/app_data/{}/rpc/{}",
            parts[0], parts[2], endpoint
        ))
        .map_err(|e: UrlError| ClientError::NotAnEndpoint(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_client(root: &Path) -> Client {
        Client::new(ClientConfig {
            email: "alice@example.com".to_string(),
            data_dir: root.to_path_buf(),
            server_url: None,
        })
    }

    #[test]
    fn test_config_load_ignores_unknown_fields() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"email":"alice@example.com","data_dir":"/ws","legacy_field":42}"#,
        )
        .unwrap();
        let config = ClientConfig::load(&config_path).unwrap();
        assert_eq!(config.email, "alice@example.com");
        assert_eq!(config.data_dir, PathBuf::from("/ws"));
    }

    #[test]
    fn test_layout_paths() {
        let client = test_client(Path::new("/ws"));
        assert_eq!(client.datasites(), PathBuf::from("/ws/datasites"));
        assert_eq!(
            client.app_data("ping", "bob@x.org"),
            PathBuf::from("/ws/datasites/bob@x.org/app_data/ping")
        );
        assert_eq!(
            client.app_rpc_dir("ping"),
            PathBuf::from("/ws/datasites/alice@example.com/app_data/ping/rpc")
        );
    }

    #[test]
    fn test_to_syft_url_roundtrip() {
        let client = test_client(Path::new("/ws"));
        let url = SyftUrl::parse("syft://bob@x.org/app_data/proxy/rpc/http/forward").unwrap();
        let local = url.to_local_path(&client.datasites());
        assert_eq!(client.to_syft_url(&local).unwrap(), url);
    }

    #[test]
    fn test_to_syft_url_rejects_non_endpoint() {
        let client = test_client(Path::new("/ws"));
        let err = client
            .to_syft_url(Path::new("/ws/datasites/bob@x.org/public/data.csv"))
            .unwrap_err();
        assert!(matches!(err, ClientError::NotAnEndpoint(_)));
        let err = client.to_syft_url(Path::new("/elsewhere/file")).unwrap_err();
        assert!(matches!(err, ClientError::OutsideWorkspace { .. }));
    }
}
