//! Bridge client half: an HTTP transport over the file channel.
//!
//! `send` takes a plain `http` request, wraps it into an envelope,
//! posts it to the target datasite's bridge endpoint via the RPC
//! client, waits on the future, and unwraps the response envelope.

use super::serde::{deserialize_response, serialize_request};
use super::server::BRIDGE_SEND_ENDPOINT;
use super::BridgeError;
use crate::protocol::{Body, Method};
use crate::rpc::{RpcClient, SendOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_EXPIRY: &str = "5m";

/// HTTP transport backed by the filesystem fabric.
pub struct FileTransport {
    rpc: Arc<RpcClient>,
    /// Datasite hosting the bridge.
    host_datasite: String,
    /// App whose rpc tree carries the envelopes.
    app_name: String,
    timeout: Duration,
    poll_interval: Duration,
    expiry: String,
}

impl FileTransport {
    pub fn new(
        rpc: Arc<RpcClient>,
        host_datasite: impl Into<String>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            rpc,
            host_datasite: host_datasite.into(),
            app_name: app_name.into(),
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            expiry: DEFAULT_EXPIRY.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The bridge endpoint URL on the host datasite.
    pub fn bridge_url(&self) -> String {
        format!(
            "syft://{}/app_data/{}/rpc/{}",
            self.host_datasite, self.app_name, BRIDGE_SEND_ENDPOINT
        )
    }

    /// Send an HTTP request through the fabric and return the HTTP
    /// response the bridge produced.
    pub async fn send(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, BridgeError> {
        let envelope = serialize_request(&request)?;

        debug!(
            "File transport sending {} {} via {}",
            request.method(),
            request.uri(),
            self.bridge_url()
        );

        let future = self
            .rpc
            .send(
                &self.bridge_url(),
                Body::Bytes(envelope),
                SendOptions {
                    method: Method::Post,
                    expiry: self.expiry.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let response = future.wait(self.timeout, self.poll_interval).await?;
        if !response.is_success() {
            return Err(BridgeError::Transport(format!(
                "bridge rpc failed with status {:?}",
                response.status
            )));
        }

        deserialize_response(&response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientConfig};
    use crate::perms::PermissionEngine;
    use crate::rpc::FutureStore;
    use tempfile::TempDir;

    fn transport(root: &std::path::Path) -> FileTransport {
        let client = Arc::new(Client::new(ClientConfig {
            email: "alice@example.com".to_string(),
            data_dir: root.to_path_buf(),
            server_url: None,
        }));
        let store = FutureStore::new(root.join("futures.redb")).unwrap();
        let perms = Arc::new(PermissionEngine::new(client.datasites(), true));
        let rpc = Arc::new(RpcClient::with_parts(client, perms, Arc::new(store)));
        FileTransport::new(rpc, "bob@example.com", "proxy")
    }

    #[test]
    fn test_bridge_url() {
        let temp = TempDir::new().unwrap();
        let transport = transport(temp.path());
        assert_eq!(
            transport.bridge_url(),
            "syft://bob@example.com/app_data/proxy/rpc/http/forward"
        );
    }

    #[tokio::test]
    async fn test_send_writes_envelope_request() {
        let temp = TempDir::new().unwrap();
        let transport = transport(temp.path()).with_timeout(Duration::from_millis(200));

        let request = http::Request::builder()
            .method("GET")
            .uri("http://api.example.com/status")
            .body(Vec::new())
            .unwrap();

        // Nobody answers, so the wait times out; the request file must
        // still land in the bridge's endpoint directory.
        let result = transport.send(request).await;
        assert!(matches!(
            result,
            Err(BridgeError::Rpc(crate::rpc::RpcError::Timeout(_)))
        ));

        let endpoint_dir = temp
            .path()
            .join("datasites/bob@example.com/app_data/proxy/rpc/http/forward/alice@example.com");
        let requests: Vec<_> = std::fs::read_dir(&endpoint_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|e| e == "request").unwrap_or(false))
            .collect();
        assert_eq!(requests.len(), 1);

        // The body must decode back into the original envelope.
        let request_record =
            crate::protocol::codec::decode_request(&std::fs::read(&requests[0]).unwrap()).unwrap();
        let decoded = crate::bridge::deserialize_request(&request_record.body).unwrap();
        assert_eq!(decoded.uri().to_string(), "http://api.example.com/status");
    }
}
