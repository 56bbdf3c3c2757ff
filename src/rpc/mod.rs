//! RPC client API: `send`, `broadcast`, `reply_to`, and futures.
//!
//! Requests are written into the local mirror of the target datasite's
//! rpc subtree; the sync layer carries them across. Every artifact is
//! written atomically (temp file + rename) and never rewritten.

pub mod future;
pub mod store;

pub use future::{BulkFuture, BulkOutcome, RpcFuture, DEFAULT_POLL_INTERVAL};
pub use store::{request_fingerprint, FutureRecord, FutureStore, StoreError};

use crate::client::Client;
use crate::perms::{AccessLevel, PermissionEngine};
use crate::protocol::{
    codec, now_ms, parse_expiry, Body, Headers, Method, ProtocolError, RpcRequest, RpcResponse,
    Status,
};
use chrono::Duration as ChronoDuration;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default request expiry when the caller does not pass one: three days.
pub const DEFAULT_EXPIRY: &str = "3d";

/// Error type for the RPC client layer.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("response already written: {0}")]
    AlreadyReplied(String),

    #[error("timed out after {0:?} waiting for response")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Options for [`RpcClient::send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub method: Method,
    pub headers: Headers,
    /// Compound duration string, e.g. `"30s"`, `"5m"`, `"1d2h"`.
    pub expiry: String,
    /// Reuse an identical in-flight request instead of sending again.
    pub cache: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            method: Method::Get,
            headers: Headers::new(),
            expiry: DEFAULT_EXPIRY.to_string(),
            cache: false,
        }
    }
}

/// Write a file atomically: write to a dot-prefixed temp sibling, then
/// rename into place. Readers and watchers never observe a torn file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("path has no file name"))?
        .to_string_lossy();
    let tmp = parent.join(format!(".{file_name}.tmp"));

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// The RPC client. Threadsafe; clone the `Arc`s freely.
pub struct RpcClient {
    client: Arc<Client>,
    perms: Arc<PermissionEngine>,
    store: Arc<FutureStore>,
}

impl RpcClient {
    /// Build a client with its future store at
    /// `<workspace>/.syftbox/futures.redb` and a permissions engine on
    /// the datasites root.
    pub fn new(client: Arc<Client>) -> RpcResult<Self> {
        let state_dir = client.workspace().root.join(".syftbox");
        std::fs::create_dir_all(&state_dir)?;
        let store = FutureStore::new(state_dir.join("futures.redb"))?;
        let perms = Arc::new(PermissionEngine::new(client.datasites(), true));
        Ok(Self {
            client,
            perms,
            store: Arc::new(store),
        })
    }

    /// Build a client around existing collaborators (shared engine,
    /// custom store location).
    pub fn with_parts(
        client: Arc<Client>,
        perms: Arc<PermissionEngine>,
        store: Arc<FutureStore>,
    ) -> Self {
        Self {
            client,
            perms,
            store,
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn store(&self) -> &Arc<FutureStore> {
        &self.store
    }

    /// Send a request and return a future for its response.
    pub async fn send(&self, url: &str, body: Body, options: SendOptions) -> RpcResult<RpcFuture> {
        let url = syftbox_types::SyftUrl::parse(url).map_err(ProtocolError::from)?;
        let expiry = parse_expiry(&options.expiry)?;
        let body_bytes = body.to_bytes()?;

        let fingerprint = options
            .cache
            .then(|| request_fingerprint(options.method, &url, &options.headers, &body_bytes));

        // Cache hit: bind to the existing in-flight request.
        if let Some(ref fingerprint) = fingerprint {
            if let Some(id) = self.store.cache_lookup(fingerprint).await? {
                if let Ok(record) = self.store.lookup(id).await {
                    if !record.is_expired() {
                        debug!("send cache hit for {} -> {}", url, id);
                        return Ok(RpcFuture::from_record(record));
                    }
                }
            }
        }

        let created = now_ms();
        let expires = created
            + ChronoDuration::from_std(expiry)
                .map_err(|e| ProtocolError::InvalidExpiry(e.to_string()))?;
        let request = RpcRequest {
            id: Uuid::now_v7(),
            sender: self.client.email().to_string(),
            url: url.clone(),
            method: options.method,
            headers: options.headers.clone(),
            body: body_bytes,
            created,
            expires,
        };

        let datasites = self.client.datasites();
        let encoded = codec::encode_request(&request)?;
        write_atomic(&request.request_path(&datasites), &encoded).await?;

        let future = RpcFuture {
            id: request.id,
            url,
            path: request.local_dir(&datasites),
            expires,
        };
        self.store.register(&future.to_record(created)).await?;
        if let Some(fingerprint) = fingerprint {
            self.store.cache_insert(&fingerprint, future.id).await?;
        }

        debug!("sent request {} to {}", future.id, future.url);
        Ok(future)
    }

    /// Send the same request to many targets. Individual failures are
    /// recorded per-url and do not abort the other sends.
    pub async fn broadcast(
        &self,
        urls: &[String],
        body: Body,
        options: SendOptions,
    ) -> RpcResult<BulkFuture> {
        let sends = urls
            .iter()
            .map(|url| self.send(url, body.clone(), options.clone()));
        let results = futures::future::join_all(sends).await;

        let mut bulk = BulkFuture::default();
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(future) => bulk.futures.push(future),
                Err(e) => {
                    warn!("broadcast send to {} failed: {}", url, e);
                    bulk.send_errors.push((url.clone(), e));
                }
            }
        }
        Ok(bulk)
    }

    /// Write the response to a received request, beside the request file.
    ///
    /// Fails with [`RpcError::NotAuthorized`] when the local principal
    /// lacks write permission on the response path, and with
    /// [`RpcError::AlreadyReplied`] when a response already exists —
    /// a response is emitted at most once per request per responder.
    pub async fn reply_to(
        &self,
        request: &RpcRequest,
        body: Body,
        headers: Headers,
        status: Status,
    ) -> RpcResult<RpcResponse> {
        let datasites = self.client.datasites();
        let response_path = request.response_path(&datasites);

        let rel = response_path
            .strip_prefix(&datasites)
            .map_err(|_| RpcError::NotAuthorized("response path outside workspace".to_string()))?;
        let perm = self.perms.compute(self.client.email(), rel);
        if !perm.has(AccessLevel::Write) {
            return Err(RpcError::NotAuthorized(format!(
                "{} may not write {}",
                self.client.email(),
                rel.display()
            )));
        }

        if response_path.exists() {
            return Err(RpcError::AlreadyReplied(request.id.to_string()));
        }

        let response = RpcResponse {
            id: request.id,
            sender: self.client.email().to_string(),
            url: request.url.clone(),
            status,
            headers,
            body: body.to_bytes()?,
            created: now_ms(),
            expires: request.expires,
        };
        let encoded = codec::encode_response(&response)?;
        write_atomic(&response_path, &encoded).await?;

        debug!("replied to {} with {:?}", request.id, status);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::perms::POLICY_FILENAME;
    use tempfile::TempDir;

    const ALICE: &str = "alice@example.com";
    const BOB: &str = "bob@example.com";

    fn make_client(root: &Path, email: &str) -> Arc<Client> {
        Arc::new(Client::new(ClientConfig {
            email: email.to_string(),
            data_dir: root.to_path_buf(),
            server_url: None,
        }))
    }

    fn open_rpc(root: &Path, email: &str) -> RpcClient {
        // Separate store file per caller so alice and bob don't share.
        let client = make_client(root, email);
        let state_dir = root.join(".syftbox");
        std::fs::create_dir_all(&state_dir).unwrap();
        let store = FutureStore::new(state_dir.join(format!("{email}.futures.redb"))).unwrap();
        let perms = Arc::new(PermissionEngine::new(client.datasites(), true));
        RpcClient::with_parts(client, perms, Arc::new(store))
    }

    fn allow_everything(root: &Path, datasite: &str) {
        let dir = root.join("datasites").join(datasite);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(POLICY_FILENAME),
            "rules:\n- pattern: '**'\n  access:\n    admin: ['*']\n",
        )
        .unwrap();
    }

    const PING_URL: &str = "syft://bob@example.com/app_data/ping/rpc/ping";

    #[tokio::test]
    async fn test_send_writes_request_file_and_registers() {
        let temp = TempDir::new().unwrap();
        let rpc = open_rpc(temp.path(), ALICE);

        let future = rpc
            .send(
                PING_URL,
                Body::from(r#"{"msg":"hi"}"#),
                SendOptions {
                    expiry: "30s".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(future.request_path().exists());
        let decoded = codec::decode_request(&std::fs::read(future.request_path()).unwrap()).unwrap();
        assert_eq!(decoded.sender, ALICE);
        assert_eq!(decoded.id, future.id);

        // No stray temp files.
        let entries: Vec<_> = std::fs::read_dir(&future.path)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 1);

        let record = rpc.store().lookup(future.id).await.unwrap();
        assert_eq!(record.path, future.path);
    }

    #[tokio::test]
    async fn test_send_validates_inputs() {
        let temp = TempDir::new().unwrap();
        let rpc = open_rpc(temp.path(), ALICE);

        let bad_url = rpc
            .send("http://nope", Body::Empty, SendOptions::default())
            .await;
        assert!(matches!(
            bad_url,
            Err(RpcError::Protocol(ProtocolError::MalformedUrl(_)))
        ));

        let bad_expiry = rpc
            .send(
                PING_URL,
                Body::Empty,
                SendOptions {
                    expiry: "soon".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(
            bad_expiry,
            Err(RpcError::Protocol(ProtocolError::InvalidExpiry(_)))
        ));
    }

    #[tokio::test]
    async fn test_send_cache_returns_same_future() {
        let temp = TempDir::new().unwrap();
        let rpc = open_rpc(temp.path(), ALICE);

        let options = SendOptions {
            cache: true,
            expiry: "5m".to_string(),
            ..Default::default()
        };
        let first = rpc
            .send(PING_URL, Body::from("x"), options.clone())
            .await
            .unwrap();
        let second = rpc.send(PING_URL, Body::from("x"), options).await.unwrap();
        assert_eq!(first.id, second.id);

        // A different body misses the cache.
        let third = rpc
            .send(
                PING_URL,
                Body::from("y"),
                SendOptions {
                    cache: true,
                    expiry: "5m".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_ne!(first.id, third.id);
    }

    #[tokio::test]
    async fn test_reply_to_roundtrip() {
        let temp = TempDir::new().unwrap();
        allow_everything(temp.path(), BOB);

        let alice = open_rpc(temp.path(), ALICE);
        let bob = open_rpc(temp.path(), BOB);

        let future = alice
            .send(
                PING_URL,
                Body::from(r#"{"msg":"hi"}"#),
                SendOptions {
                    expiry: "30s".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let request =
            codec::decode_request(&std::fs::read(future.request_path()).unwrap()).unwrap();
        let response = bob
            .reply_to(
                &request,
                Body::from(r#"{"reply":"hi from bob"}"#),
                Headers::new(),
                Status::Completed,
            )
            .await
            .unwrap();
        assert_eq!(response.id, request.id);
        assert_eq!(response.sender, BOB);

        let resolved = future.resolve().await.unwrap().unwrap();
        assert_eq!(resolved.status, Status::Completed);
        let parsed: serde_json::Value = resolved.json().unwrap();
        assert_eq!(parsed["reply"], "hi from bob");
    }

    #[tokio::test]
    async fn test_reply_to_requires_write_permission() {
        let temp = TempDir::new().unwrap();
        // No policy for bob's datasite and the responder is not the
        // owner: carol cannot write there.
        let alice = open_rpc(temp.path(), ALICE);
        let carol = open_rpc(temp.path(), "carol@example.com");

        let future = alice
            .send(PING_URL, Body::Empty, SendOptions::default())
            .await
            .unwrap();
        let request =
            codec::decode_request(&std::fs::read(future.request_path()).unwrap()).unwrap();

        let result = carol
            .reply_to(&request, Body::Empty, Headers::new(), Status::Completed)
            .await;
        assert!(matches!(result, Err(RpcError::NotAuthorized(_))));
    }

    #[tokio::test]
    async fn test_reply_to_owner_allowed_without_policy() {
        let temp = TempDir::new().unwrap();
        let alice = open_rpc(temp.path(), ALICE);
        let bob = open_rpc(temp.path(), BOB);

        let future = alice
            .send(PING_URL, Body::Empty, SendOptions::default())
            .await
            .unwrap();
        let request =
            codec::decode_request(&std::fs::read(future.request_path()).unwrap()).unwrap();

        // Bob owns bob@example.com's subtree; owner override grants admin.
        let result = bob
            .reply_to(&request, Body::Empty, Headers::new(), Status::Completed)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_reply_to_at_most_once() {
        let temp = TempDir::new().unwrap();
        let alice = open_rpc(temp.path(), ALICE);
        let bob = open_rpc(temp.path(), BOB);

        let future = alice
            .send(PING_URL, Body::Empty, SendOptions::default())
            .await
            .unwrap();
        let request =
            codec::decode_request(&std::fs::read(future.request_path()).unwrap()).unwrap();

        bob.reply_to(&request, Body::Empty, Headers::new(), Status::Completed)
            .await
            .unwrap();
        let second = bob
            .reply_to(&request, Body::Empty, Headers::new(), Status::Completed)
            .await;
        assert!(matches!(second, Err(RpcError::AlreadyReplied(_))));
    }

    #[tokio::test]
    async fn test_broadcast_partial_failure() {
        let temp = TempDir::new().unwrap();
        let rpc = open_rpc(temp.path(), ALICE);

        let urls = vec![
            "syft://bob@example.com/app_data/ping/rpc/ping".to_string(),
            "syft://carol@example.com/app_data/ping/rpc/ping".to_string(),
            "not a url".to_string(),
        ];
        let bulk = rpc
            .broadcast(&urls, Body::Empty, SendOptions::default())
            .await
            .unwrap();

        assert_eq!(bulk.futures.len(), 2);
        assert_eq!(bulk.send_errors.len(), 1);
        assert_eq!(bulk.send_errors[0].0, "not a url");
    }
}
