//! Filesystem watcher feeding the dispatch queue.
//!
//! The sync layer lands finished files two ways: dropped in place
//! (create event) or written to a temp name and renamed into place
//! (rename-to event). Both must enqueue the file. A bounded intake
//! channel provides backpressure; overflow drops the event and counts
//! it, relying on the periodic rescan to pick the file up later.

use super::routes::is_request_file_name;
use super::ServerStats;
use crate::protocol::{REJECTED_SUFFIX, REQUEST_SUFFIX, RESPONSE_SUFFIX};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Enqueue a candidate request file, dropping on overflow.
pub(crate) fn enqueue(intake: &mpsc::Sender<PathBuf>, path: PathBuf, stats: &ServerStats) {
    match intake.try_send(path) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(path)) => {
            warn!("Intake queue full, dropping event for {}", path.display());
            stats.record_dropped_event();
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

fn is_candidate(path: &Path) -> bool {
    path.file_name()
        .map(|n| is_request_file_name(&n.to_string_lossy()))
        .unwrap_or(false)
}

/// Task that watches the rpc directory recursively and enqueues request
/// files as they appear.
///
/// On watcher failure the task restarts the backend once; if that also
/// fails it exits and the server continues in degraded polling-only
/// mode, served by the periodic rescan.
pub(crate) async fn rpc_watcher_task(
    rpc_dir: PathBuf,
    intake: mpsc::Sender<PathBuf>,
    mut stop: watch::Receiver<bool>,
    stats: Arc<ServerStats>,
) {
    let mut restarts = 0u32;

    'restart: loop {
        let (notify_tx, mut notify_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);

        let mut watcher = match RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.blocking_send(res);
            },
            Config::default().with_poll_interval(Duration::from_millis(200)),
        ) {
            Ok(w) => w,
            Err(e) => {
                if restarts == 0 {
                    restarts += 1;
                    warn!("Failed to create rpc watcher, retrying once: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue 'restart;
                }
                error!(
                    "Rpc watcher unavailable, continuing in polling-only mode: {}",
                    e
                );
                return;
            }
        };

        if let Err(e) = watcher.watch(&rpc_dir, RecursiveMode::Recursive) {
            if restarts == 0 {
                restarts += 1;
                warn!("Failed to watch {}, retrying once: {}", rpc_dir.display(), e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue 'restart;
            }
            error!(
                "Cannot watch {}, continuing in polling-only mode: {}",
                rpc_dir.display(),
                e
            );
            return;
        }

        info!("Watching rpc directory: {}", rpc_dir.display());

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!("Rpc watcher stopping");
                    return;
                }
                msg = notify_rx.recv() => {
                    match msg {
                        Some(Ok(event)) => {
                            handle_event(event, &intake, &stats);
                        }
                        Some(Err(e)) => {
                            warn!("Rpc watcher error: {}", e);
                        }
                        None => {
                            // Backend died underneath us.
                            if restarts == 0 {
                                restarts += 1;
                                warn!("Rpc watcher backend stopped, restarting once");
                                continue 'restart;
                            }
                            error!("Rpc watcher backend stopped again, polling-only mode");
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn handle_event(event: Event, intake: &mpsc::Sender<PathBuf>, stats: &ServerStats) {
    // The sync layer either creates a finished file in place or renames
    // a temp file into place. Both must dispatch.
    let relevant = match event.kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Name(rename_mode)) => match rename_mode {
            RenameMode::To => true,
            RenameMode::From => false,
            // Platform couldn't say; let path existence decide below.
            RenameMode::Both | RenameMode::Any | RenameMode::Other => true,
        },
        _ => false,
    };
    if !relevant {
        return;
    }

    for path in event.paths {
        if is_candidate(&path) && path.exists() {
            debug!("Watcher event for {}", path.display());
            enqueue(intake, path, stats);
        }
    }
}

/// Walk the rpc directory for request files that still lack a response
/// or rejection marker. Used for the startup scan and the periodic
/// rescan that backs the watcher up.
pub(crate) fn scan_pending(rpc_dir: &Path) -> Vec<PathBuf> {
    let mut pending = Vec::new();
    let mut stack = vec![rpc_dir.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot scan {}: {}", dir.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if !is_candidate(&path) {
                continue;
            }
            if has_terminal_sibling(&path) {
                continue;
            }
            pending.push(path);
        }
    }

    pending.sort();
    pending
}

/// True when a response or rejection marker already sits beside the
/// request file.
pub(crate) fn has_terminal_sibling(request_path: &Path) -> bool {
    let Some(stem) = request_path
        .file_name()
        .and_then(|n| n.to_string_lossy().strip_suffix(REQUEST_SUFFIX).map(String::from))
    else {
        return false;
    };
    let Some(parent) = request_path.parent() else {
        return false;
    };
    parent.join(format!("{stem}{RESPONSE_SUFFIX}")).exists()
        || parent.join(format!("{stem}{REJECTED_SUFFIX}")).exists()
}

/// Task that rescans the rpc directory on a fixed interval, both to
/// complement the watcher and to serve as the only intake source when
/// the watcher is degraded.
pub(crate) async fn rescan_task(
    rpc_dir: PathBuf,
    intake: mpsc::Sender<PathBuf>,
    mut stop: watch::Receiver<bool>,
    interval: Duration,
    stats: Arc<ServerStats>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("Rescan task stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                for path in scan_pending(&rpc_dir) {
                    enqueue(&intake, path, &stats);
                }
            }
        }
    }
}
