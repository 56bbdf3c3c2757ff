//! Rejection flow: a sender who could never read the reply gets a
//! rejection marker instead of a response.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use syftbox_rpc::client::{Client, ClientConfig};
use syftbox_rpc::perms::{PermissionEngine, POLICY_FILENAME};
use syftbox_rpc::protocol::{Body, Status};
use syftbox_rpc::rpc::{FutureStore, RpcClient, SendOptions};
use syftbox_rpc::server::{EventServer, EventServerConfig, HandlerResponse};
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

fn make_rpc(root: &Path, email: &str) -> RpcClient {
    let client = make_client(root, email);
    let store =
        FutureStore::new(root.join(format!("{email}.futures.redb"))).expect("open future store");
    let perms = Arc::new(PermissionEngine::new(client.datasites(), true));
    RpcClient::with_parts(client, perms, Arc::new(store))
}

#[tokio::test]
async fn test_unreadable_response_location_writes_rejection_marker() {
    let temp = TempDir::new().unwrap();

    // Long rescan interval: the exact-counter assertion below must see
    // the single watcher-driven dispatch only.
    let mut config = EventServerConfig::new("vault");
    config.poll_interval = Duration::from_secs(30);
    let mut server = EventServer::new(make_client(temp.path(), BOB), config);
    server
        .on_request("/secret", |_req| async move { HandlerResponse::ok("classified") })
        .unwrap();
    server.start().await.unwrap();

    // Replace the server's permissive default policy with one that
    // grants nothing and blocks inheritance, so alice cannot read the
    // response location.
    std::fs::write(
        server.rpc_dir().join(POLICY_FILENAME),
        "terminal: true\nrules: []\n",
    )
    .unwrap();
    // Let the watcher install before the request lands.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let alice = make_rpc(temp.path(), ALICE);
    let future = alice
        .send(
            &format!("syft://{BOB}/app_data/vault/rpc/secret"),
            Body::Empty,
            SendOptions {
                expiry: "1m".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let response = future
        .wait(Duration::from_secs(10), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Rejected);

    // The marker is an empty terminal sentinel; no response file exists.
    assert!(future.rejected_path().exists());
    assert_eq!(std::fs::read(future.rejected_path()).unwrap(), b"");
    assert!(!future.response_path().exists());
    assert_eq!(server.stats().rejected(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_default_policy_admits_any_sender() {
    let temp = TempDir::new().unwrap();

    let mut config = EventServerConfig::new("open");
    config.poll_interval = Duration::from_millis(300);
    let mut server = EventServer::new(make_client(temp.path(), BOB), config);
    server
        .on_request("/hello", |_req| async move { HandlerResponse::ok("hi") })
        .unwrap();
    server.start().await.unwrap();

    // A stranger datasite the responder never heard of.
    let mallory = make_rpc(temp.path(), "mallory@elsewhere.net");
    let future = mallory
        .send(
            &format!("syft://{BOB}/app_data/open/rpc/hello"),
            Body::Empty,
            SendOptions {
                expiry: "1m".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let response = future
        .wait(Duration::from_secs(10), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Completed);
    assert!(!future.rejected_path().exists());

    server.stop().await;
}
