//! Background cleanup of expired rpc artifacts.
//!
//! Runs on its own timer and sweeps the rpc tree it is given: request
//! and response files whose `expires` lies further in the past than the
//! retention window are deleted, as are orphaned rejection markers.
//! Per-file errors are counted and never abort a sweep; the service is
//! idempotent and safe to run beside the event server.

use crate::protocol::{codec, REJECTED_SUFFIX, REQUEST_SUFFIX, RESPONSE_SUFFIX};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counters of the cleanup service. Cumulative across sweeps until
/// [`CleanupStats::reset`].
#[derive(Debug, Clone, Default)]
pub struct CleanupStats {
    pub requests_deleted: u64,
    pub responses_deleted: u64,
    pub errors: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl CleanupStats {
    /// Zero the counters. `last_cleanup` is left untouched.
    pub fn reset(&mut self) {
        self.requests_deleted = 0;
        self.responses_deleted = 0;
        self.errors = 0;
    }
}

impl fmt::Display for CleanupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} responses={} errors={} last_cleanup={}",
            self.requests_deleted,
            self.responses_deleted,
            self.errors,
            self.last_cleanup
                .map(|t| t.to_string())
                .unwrap_or_else(|| "never".to_string())
        )
    }
}

/// Periodic sweeper of one rpc directory.
pub struct PeriodicCleanup {
    rpc_dir: PathBuf,
    interval: Duration,
    retention: Duration,
    stats: Arc<Mutex<CleanupStats>>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl PeriodicCleanup {
    pub fn new(rpc_dir: impl Into<PathBuf>, interval: Duration, retention: Duration) -> Self {
        Self {
            rpc_dir: rpc_dir.into(),
            interval,
            retention,
            stats: Arc::new(Mutex::new(CleanupStats::default())),
            stop_tx: None,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Spawn the background timer task.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let rpc_dir = self.rpc_dir.clone();
        let interval = self.interval;
        let retention = self.retention;
        let stats = self.stats.clone();

        self.task = Some(tokio::spawn(async move {
            info!(
                "Cleanup service sweeping {} every {:?}",
                rpc_dir.display(),
                interval
            );
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!("Cleanup service stopping");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let sweep = sweep(&rpc_dir, retention);
                        merge_stats(&stats, sweep);
                    }
                }
            }
        }));
        self.stop_tx = Some(stop_tx);
    }

    /// Stop the background task.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Run one sweep immediately and return the cumulative stats.
    pub fn cleanup_now(&self) -> CleanupStats {
        let sweep = sweep(&self.rpc_dir, self.retention);
        merge_stats(&self.stats, sweep);
        self.get_stats()
    }

    pub fn get_stats(&self) -> CleanupStats {
        self.stats.lock().expect("cleanup stats lock").clone()
    }
}

fn merge_stats(stats: &Arc<Mutex<CleanupStats>>, sweep: CleanupStats) {
    let mut guard = stats.lock().expect("cleanup stats lock");
    guard.requests_deleted += sweep.requests_deleted;
    guard.responses_deleted += sweep.responses_deleted;
    guard.errors += sweep.errors;
    guard.last_cleanup = sweep.last_cleanup;
}

/// One sweep over the rpc directory. Returns the deltas of this sweep
/// alone.
fn sweep(rpc_dir: &Path, retention: Duration) -> CleanupStats {
    let mut stats = CleanupStats::default();
    let cutoff = Utc::now()
        - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());

    let mut stack = vec![rpc_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cleanup cannot read {}: {}", dir.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            // Dotfiles are in-flight atomic writes; never touch them.
            if name.starts_with('.') {
                continue;
            }

            if name.ends_with(REJECTED_SUFFIX) {
                sweep_rejection_marker(&path, &name, cutoff, &mut stats);
            } else if name.ends_with(REQUEST_SUFFIX) {
                sweep_record(&path, cutoff, RecordKind::Request, &mut stats);
            } else if name.ends_with(RESPONSE_SUFFIX) {
                sweep_record(&path, cutoff, RecordKind::Response, &mut stats);
            }
        }
    }

    stats.last_cleanup = Some(Utc::now());
    stats
}

enum RecordKind {
    Request,
    Response,
}

fn sweep_record(path: &Path, cutoff: DateTime<Utc>, kind: RecordKind, stats: &mut CleanupStats) {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            warn!("Cleanup cannot read {}: {}", path.display(), e);
            stats.errors += 1;
            return;
        }
    };

    let expires = match kind {
        RecordKind::Request => codec::decode_request(&data).map(|r| r.expires),
        RecordKind::Response => codec::decode_response(&data).map(|r| r.expires),
    };
    let expires = match expires {
        Ok(expires) => expires,
        Err(e) => {
            warn!("Cleanup cannot decode {}: {}", path.display(), e);
            stats.errors += 1;
            return;
        }
    };

    if expires >= cutoff {
        return;
    }

    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Cleanup evicted {}", path.display());
            match kind {
                RecordKind::Request => stats.requests_deleted += 1,
                RecordKind::Response => stats.responses_deleted += 1,
            }
        }
        Err(e) => {
            warn!("Cleanup cannot delete {}: {}", path.display(), e);
            stats.errors += 1;
        }
    }
}

/// A rejection marker is evicted once its request file is gone and its
/// own mtime has aged past the retention window.
fn sweep_rejection_marker(
    path: &Path,
    name: &str,
    cutoff: DateTime<Utc>,
    stats: &mut CleanupStats,
) {
    let Some(stem) = name.strip_suffix(REJECTED_SUFFIX) else {
        return;
    };
    let request_sibling = path.with_file_name(format!("{stem}{REQUEST_SUFFIX}"));
    if request_sibling.exists() {
        return;
    }

    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from);
    match modified {
        Ok(mtime) if mtime < cutoff => match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("Cleanup evicted orphan marker {}", path.display());
                stats.requests_deleted += 1;
            }
            Err(e) => {
                warn!("Cleanup cannot delete {}: {}", path.display(), e);
                stats.errors += 1;
            }
        },
        Ok(_) => {}
        Err(e) => {
            warn!("Cleanup cannot stat {}: {}", path.display(), e);
            stats.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{now_ms, Headers, Method, RpcRequest, RpcResponse, Status};
    use chrono::Duration as ChronoDuration;
    use syftbox_types::SyftUrl;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn write_request_file(dir: &Path, expires_in_secs: i64) -> PathBuf {
        let created = now_ms();
        let request = RpcRequest {
            id: Uuid::now_v7(),
            sender: "alice@example.com".to_string(),
            url: SyftUrl::parse("syft://bob@x.org/app_data/ping/rpc/ping").unwrap(),
            method: Method::Get,
            headers: Headers::new(),
            body: Vec::new(),
            created,
            expires: created + ChronoDuration::seconds(expires_in_secs),
        };
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(format!("{}.request", request.id));
        std::fs::write(&path, codec::encode_request(&request).unwrap()).unwrap();
        path
    }

    fn write_response_file(dir: &Path, expires_in_secs: i64) -> PathBuf {
        let created = now_ms();
        let response = RpcResponse {
            id: Uuid::now_v7(),
            sender: "bob@x.org".to_string(),
            url: SyftUrl::parse("syft://bob@x.org/app_data/ping/rpc/ping").unwrap(),
            status: Status::Completed,
            headers: Headers::new(),
            body: Vec::new(),
            created,
            expires: created + ChronoDuration::seconds(expires_in_secs),
        };
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(format!("{}.response", response.id));
        std::fs::write(&path, codec::encode_response(&response).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_sweep_empty_dir() {
        let temp = TempDir::new().unwrap();
        let cleanup = PeriodicCleanup::new(temp.path(), Duration::from_secs(60), Duration::ZERO);
        let stats = cleanup.cleanup_now();
        assert_eq!(stats.requests_deleted, 0);
        assert_eq!(stats.responses_deleted, 0);
        assert_eq!(stats.errors, 0);
        assert!(stats.last_cleanup.is_some());
    }

    #[test]
    fn test_sweep_deletes_expired_keeps_live() {
        let temp = TempDir::new().unwrap();
        let sender_dir = temp.path().join("ping/alice@example.com");
        let expired_req = write_request_file(&sender_dir, -2);
        let live_req = write_request_file(&sender_dir, 3600);
        let expired_resp = write_response_file(&sender_dir, -2);

        let cleanup = PeriodicCleanup::new(temp.path(), Duration::from_secs(60), Duration::ZERO);
        let stats = cleanup.cleanup_now();

        assert!(!expired_req.exists());
        assert!(live_req.exists());
        assert!(!expired_resp.exists());
        assert_eq!(stats.requests_deleted, 1);
        assert_eq!(stats.responses_deleted, 1);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_retention_keeps_recently_expired() {
        let temp = TempDir::new().unwrap();
        let sender_dir = temp.path().join("ping/alice@example.com");
        // Expired 2 seconds ago, retention one hour: stays.
        let recently_expired = write_request_file(&sender_dir, -2);

        let cleanup =
            PeriodicCleanup::new(temp.path(), Duration::from_secs(60), Duration::from_secs(3600));
        let stats = cleanup.cleanup_now();

        assert!(recently_expired.exists());
        assert_eq!(stats.requests_deleted, 0);
    }

    #[test]
    fn test_garbage_file_counts_error_and_survives() {
        let temp = TempDir::new().unwrap();
        let sender_dir = temp.path().join("ping/alice@example.com");
        std::fs::create_dir_all(&sender_dir).unwrap();
        let garbage = sender_dir.join("junk.request");
        std::fs::write(&garbage, b"not a frame").unwrap();

        let cleanup = PeriodicCleanup::new(temp.path(), Duration::from_secs(60), Duration::ZERO);
        let stats = cleanup.cleanup_now();

        assert!(garbage.exists());
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_orphan_rejection_marker_evicted() {
        let temp = TempDir::new().unwrap();
        let sender_dir = temp.path().join("ping/alice@example.com");
        std::fs::create_dir_all(&sender_dir).unwrap();
        let marker = sender_dir.join("abc.syftrejected.request");
        std::fs::write(&marker, b"").unwrap();

        let cleanup = PeriodicCleanup::new(temp.path(), Duration::from_secs(60), Duration::ZERO);
        let stats = cleanup.cleanup_now();

        assert!(!marker.exists());
        assert_eq!(stats.requests_deleted, 1);
    }

    #[test]
    fn test_marker_with_live_request_stays() {
        let temp = TempDir::new().unwrap();
        let sender_dir = temp.path().join("ping/alice@example.com");
        let request = write_request_file(&sender_dir, 3600);
        let stem = request
            .file_name()
            .unwrap()
            .to_string_lossy()
            .strip_suffix(REQUEST_SUFFIX)
            .unwrap()
            .to_string();
        let marker = sender_dir.join(format!("{stem}{REJECTED_SUFFIX}"));
        std::fs::write(&marker, b"").unwrap();

        let cleanup = PeriodicCleanup::new(temp.path(), Duration::from_secs(60), Duration::ZERO);
        cleanup.cleanup_now();
        assert!(marker.exists());
    }

    #[test]
    fn test_temp_files_never_touched() {
        let temp = TempDir::new().unwrap();
        let sender_dir = temp.path().join("ping/alice@example.com");
        std::fs::create_dir_all(&sender_dir).unwrap();
        let tmp = sender_dir.join(".abc.request.tmp");
        std::fs::write(&tmp, b"half written").unwrap();

        let cleanup = PeriodicCleanup::new(temp.path(), Duration::from_secs(60), Duration::ZERO);
        let stats = cleanup.cleanup_now();
        assert!(tmp.exists());
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp = TempDir::new().unwrap();
        let mut cleanup =
            PeriodicCleanup::new(temp.path(), Duration::from_millis(50), Duration::ZERO);
        assert!(!cleanup.is_running());
        cleanup.start();
        assert!(cleanup.is_running());
        cleanup.stop().await;
        assert!(!cleanup.is_running());
    }

    #[tokio::test]
    async fn test_periodic_sweep_deletes_within_interval() {
        let temp = TempDir::new().unwrap();
        let sender_dir = temp.path().join("ping/alice@example.com");
        let expired = write_request_file(&sender_dir, -2);

        let mut cleanup =
            PeriodicCleanup::new(temp.path(), Duration::from_millis(50), Duration::ZERO);
        cleanup.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        cleanup.stop().await;

        assert!(!expired.exists());
        assert_eq!(cleanup.get_stats().requests_deleted, 1);
    }

    #[test]
    fn test_stats_reset_and_display() {
        let mut stats = CleanupStats {
            requests_deleted: 5,
            responses_deleted: 3,
            errors: 1,
            last_cleanup: Some(Utc::now()),
        };
        let display = stats.to_string();
        assert!(display.contains("requests=5"));
        assert!(display.contains("responses=3"));
        assert!(display.contains("errors=1"));

        stats.reset();
        assert_eq!(stats.requests_deleted, 0);
        assert!(stats.last_cleanup.is_some());
    }
}
