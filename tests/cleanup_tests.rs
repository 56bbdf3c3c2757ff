//! Cleanup service sweeping a live rpc tree.

use std::path::Path;
use std::time::Duration;
use syftbox_rpc::cleanup::PeriodicCleanup;
use syftbox_rpc::protocol::{codec, now_ms, Headers, Method, RpcRequest};
use syftbox_types::SyftUrl;
use tempfile::TempDir;
use uuid::Uuid;

fn write_request(dir: &Path, expires_in_secs: i64) -> std::path::PathBuf {
    let created = now_ms();
    let request = RpcRequest {
        id: Uuid::now_v7(),
        sender: "alice@example.com".to_string(),
        url: SyftUrl::parse("syft://bob@example.com/app_data/ping/rpc/ping").unwrap(),
        method: Method::Get,
        headers: Headers::new(),
        body: Vec::new(),
        created,
        expires: created + chrono::Duration::seconds(expires_in_secs),
    };
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("{}.request", request.id));
    std::fs::write(&path, codec::encode_request(&request).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn test_expired_request_evicted_within_one_sweep() {
    let temp = TempDir::new().unwrap();
    let sender_dir = temp.path().join("ping/alice@example.com");

    // Expired two seconds ago; retention zero; sweep every 500ms.
    let expired = write_request(&sender_dir, -2);
    let live = write_request(&sender_dir, 60);

    let mut cleanup =
        PeriodicCleanup::new(temp.path(), Duration::from_millis(500), Duration::ZERO);
    cleanup.start();
    assert!(cleanup.is_running());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    cleanup.stop().await;

    assert!(!expired.exists());
    assert!(live.exists());
    assert_eq!(cleanup.get_stats().requests_deleted, 1);
    assert_eq!(cleanup.get_stats().errors, 0);
}

#[tokio::test]
async fn test_cleanup_runs_concurrently_with_more_arrivals() {
    let temp = TempDir::new().unwrap();
    let sender_dir = temp.path().join("ping/alice@example.com");

    let mut cleanup =
        PeriodicCleanup::new(temp.path(), Duration::from_millis(100), Duration::ZERO);
    cleanup.start();

    // Artifacts keep arriving while the sweeper runs.
    let mut expired_paths = Vec::new();
    for _ in 0..5 {
        expired_paths.push(write_request(&sender_dir, -2));
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    cleanup.stop().await;

    for path in &expired_paths {
        assert!(!path.exists());
    }
    assert_eq!(cleanup.get_stats().requests_deleted, 5);
}
