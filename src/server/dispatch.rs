//! Dispatch pipeline: from request file to response file.
//!
//! The duplicate-suppression check runs before anything else and is the
//! at-most-once fence: a request with a response or rejection marker
//! beside it is never dispatched again. Handlers run on a
//! semaphore-bounded worker pool so they can block without stalling the
//! watcher.

use super::routes::RouteTable;
use super::watcher::has_terminal_sibling;
use super::{HandlerResponse, ServerStats};
use crate::client::Client;
use crate::perms::{AccessLevel, PermissionEngine};
use crate::protocol::{
    codec, now_ms, Headers, RpcRequest, RpcResponse, Status, REJECTED_SUFFIX, REQUEST_SUFFIX,
    RESPONSE_SUFFIX,
};
use crate::rpc::write_atomic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Shared state of the dispatch pipeline.
pub(crate) struct Dispatcher {
    pub client: Arc<Client>,
    pub perms: Arc<PermissionEngine>,
    pub routes: Arc<RouteTable>,
    pub rpc_dir: PathBuf,
    pub stats: Arc<ServerStats>,
}

/// Consume the intake queue, running each request through the pipeline
/// on a bounded worker pool. On stop, drains the queue, waits up to
/// `grace` for in-flight handlers, then aborts the rest.
pub(crate) async fn dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    mut intake: mpsc::Receiver<PathBuf>,
    mut stop: watch::Receiver<bool>,
    workers: usize,
    grace: Duration,
) {
    let pool = Arc::new(Semaphore::new(workers.max(1)));
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        // Reap finished workers so the set doesn't accumulate results.
        while in_flight.try_join_next().is_some() {}

        tokio::select! {
            _ = stop.changed() => break,
            msg = intake.recv() => match msg {
                Some(path) => {
                    let dispatcher = dispatcher.clone();
                    let pool = pool.clone();
                    in_flight.spawn(async move {
                        // Worker slot is taken inside the task so the
                        // loop itself never blocks on a busy pool.
                        let Ok(_permit) = pool.acquire_owned().await else {
                            return;
                        };
                        process_request_file(&dispatcher, &path).await;
                    });
                }
                None => break,
            }
        }
    }

    // Drain whatever is already queued.
    while let Ok(path) = intake.try_recv() {
        let dispatcher = dispatcher.clone();
        let pool = pool.clone();
        in_flight.spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            process_request_file(&dispatcher, &path).await;
        });
    }

    // Grace period for in-flight handlers, then forcible cancellation.
    let deadline = Instant::now() + grace;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, in_flight.join_next()).await {
            Ok(Some(_)) => continue,
            Ok(None) => return,
            Err(_) => break,
        }
    }
    warn!("Shutdown grace elapsed, aborting outstanding handlers");
    in_flight.abort_all();
    while in_flight.join_next().await.is_some() {}
}

/// Run one request file through the pipeline.
pub(crate) async fn process_request_file(dispatcher: &Dispatcher, path: &Path) {
    // Duplicate suppression before anything else: this is the
    // at-most-once fence.
    if has_terminal_sibling(path) {
        debug!("Skipping {}, already answered", path.display());
        dispatcher.stats.record_duplicate();
        return;
    }

    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            dispatcher.stats.record_error();
            return;
        }
    };

    let request = match codec::decode_request(&data) {
        Ok(request) => request,
        Err(e) => {
            warn!("Undecodable request {}: {}", path.display(), e);
            dispatcher.stats.record_error();
            write_fallback_response(
                dispatcher,
                path,
                Status::Error,
                format!("error decoding request: {e}"),
            )
            .await;
            return;
        }
    };

    // An expired request gets no reply; the requester synthesizes its
    // own expired response.
    if request.is_expired() {
        debug!("Ignoring expired request {}", request.id);
        dispatcher.stats.record_expired_ignored();
        return;
    }

    let endpoint = match endpoint_of(&dispatcher.rpc_dir, path) {
        Some(endpoint) => endpoint,
        None => {
            warn!("Request file outside rpc layout: {}", path.display());
            dispatcher.stats.record_error();
            return;
        }
    };

    let response_path = sibling_with_suffix(path, RESPONSE_SUFFIX);

    let route = match dispatcher.routes.match_endpoint(&endpoint) {
        Some(route) => route,
        None => {
            debug!("No route for endpoint {:?}", endpoint);
            dispatcher.stats.record_not_found();
            write_response(
                dispatcher,
                &request,
                &response_path,
                HandlerResponse {
                    status: Status::NotFound,
                    headers: Headers::new(),
                    body: format!("no handler registered for /{endpoint}").into_bytes(),
                },
            )
            .await;
            return;
        }
    };

    // The sender must be able to read the reply it asked for; a request
    // it could never consume is refused with a rejection marker.
    let authorized = response_path
        .strip_prefix(dispatcher.client.datasites())
        .map(|rel| {
            dispatcher
                .perms
                .compute(&request.sender, rel)
                .has(AccessLevel::Read)
        })
        .unwrap_or(false);
    if !authorized {
        debug!(
            "Sender {} cannot read response location, rejecting {}",
            request.sender, request.id
        );
        dispatcher.stats.record_rejected();
        let rejected_path = sibling_with_suffix(path, REJECTED_SUFFIX);
        if !rejected_path.exists() {
            if let Err(e) = write_atomic(&rejected_path, b"").await {
                error!("Failed to write rejection marker: {}", e);
                dispatcher.stats.record_error();
            }
        }
        return;
    }

    let handler_result = (route.handler)(request.clone()).await;
    let response = match handler_result {
        Ok(response) => response,
        Err(e) => {
            warn!("Handler for /{} failed: {}", endpoint, e);
            HandlerResponse {
                status: Status::Error,
                headers: Headers::new(),
                body: e.to_string().into_bytes(),
            }
        }
    };

    write_response(dispatcher, &request, &response_path, response).await;
    dispatcher.stats.record_dispatched();
}

/// Endpoint path of a request file relative to the rpc directory:
/// `<rpc-dir>/<endpoint...>/<sender>/<id>.request`.
fn endpoint_of(rpc_dir: &Path, request_path: &Path) -> Option<String> {
    let endpoint_dir = request_path.parent()?.parent()?;
    let rel = endpoint_dir.strip_prefix(rpc_dir).ok()?;
    let endpoint = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/");
    if endpoint.is_empty() {
        None
    } else {
        Some(endpoint)
    }
}

fn sibling_with_suffix(request_path: &Path, suffix: &str) -> PathBuf {
    let name = request_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = name.strip_suffix(REQUEST_SUFFIX).unwrap_or(&name);
    request_path.with_file_name(format!("{stem}{suffix}"))
}

async fn write_response(
    dispatcher: &Dispatcher,
    request: &RpcRequest,
    response_path: &Path,
    handler_response: HandlerResponse,
) {
    // A racing dispatch may have answered while the handler ran; the
    // response file is write-once.
    if response_path.exists() {
        debug!("Response for {} already exists, dropping ours", request.id);
        dispatcher.stats.record_duplicate();
        return;
    }

    let response = RpcResponse {
        id: request.id,
        sender: dispatcher.client.email().to_string(),
        url: request.url.clone(),
        status: handler_response.status,
        headers: handler_response.headers,
        body: handler_response.body,
        created: now_ms(),
        expires: request.expires,
    };

    let encoded = match codec::encode_response(&response) {
        Ok(encoded) => encoded,
        Err(e) => {
            error!("Failed to encode response for {}: {}", request.id, e);
            dispatcher.stats.record_error();
            return;
        }
    };

    if let Err(e) = write_atomic(response_path, &encoded).await {
        error!("Failed to write response {}: {}", response_path.display(), e);
        dispatcher.stats.record_error();
    }
}

/// Best-effort error response when the request file itself could not be
/// decoded: the id comes from the filename, the URL from the file's
/// location.
async fn write_fallback_response(
    dispatcher: &Dispatcher,
    request_path: &Path,
    status: Status,
    message: String,
) {
    let Some(stem) = request_path
        .file_name()
        .and_then(|n| n.to_string_lossy().strip_suffix(REQUEST_SUFFIX).map(String::from))
    else {
        return;
    };
    let Ok(id) = Uuid::parse_str(&stem) else {
        debug!("Cannot derive id from {}, skipping error reply", request_path.display());
        return;
    };
    let Some(endpoint_dir) = request_path.parent().and_then(|p| p.parent()) else {
        return;
    };
    let Ok(url) = dispatcher.client.to_syft_url(endpoint_dir) else {
        return;
    };

    let now = now_ms();
    let response = RpcResponse {
        id,
        sender: dispatcher.client.email().to_string(),
        url,
        status,
        headers: Headers::new(),
        body: message.into_bytes(),
        created: now,
        expires: now + chrono::Duration::days(1),
    };

    let response_path = sibling_with_suffix(request_path, RESPONSE_SUFFIX);
    if response_path.exists() {
        return;
    }
    match codec::encode_response(&response) {
        Ok(encoded) => {
            if let Err(e) = write_atomic(&response_path, &encoded).await {
                error!("Failed to write error response: {}", e);
            }
        }
        Err(e) => error!("Failed to encode error response: {}", e),
    }
}
