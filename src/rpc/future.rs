//! Client-side futures over filesystem responses.
//!
//! A future remembers where its response file will appear and polls for
//! it. Terminal outcomes that never produce a response file (expiry,
//! rejection) are synthesized locally with the `SYSTEM` sender.

use super::store::FutureRecord;
use super::{RpcError, RpcResult};
use crate::protocol::{codec, RpcResponse, Status, REJECTED_SUFFIX, REQUEST_SUFFIX, RESPONSE_SUFFIX};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use syftbox_types::SyftUrl;
use tokio::time::{sleep, Instant};
use tracing::debug;
use uuid::Uuid;

/// Default time between polling attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle for the pending outcome of a `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFuture {
    /// Identifier shared by the request and its response.
    pub id: Uuid,
    /// The originating URL.
    pub url: SyftUrl,
    /// Directory holding the request/response files.
    pub path: PathBuf,
    /// Deadline after which the future is invalid.
    pub expires: DateTime<Utc>,
}

impl RpcFuture {
    pub fn from_record(record: FutureRecord) -> Self {
        Self {
            id: record.id,
            url: record.url,
            path: record.path,
            expires: record.expires,
        }
    }

    pub fn to_record(&self, created: DateTime<Utc>) -> FutureRecord {
        FutureRecord {
            id: self.id,
            url: self.url.clone(),
            path: self.path.clone(),
            created,
            expires: self.expires,
        }
    }

    pub fn request_path(&self) -> PathBuf {
        self.path.join(format!("{}{}", self.id, REQUEST_SUFFIX))
    }

    pub fn response_path(&self) -> PathBuf {
        self.path.join(format!("{}{}", self.id, RESPONSE_SUFFIX))
    }

    pub fn rejected_path(&self) -> PathBuf {
        self.path.join(format!("{}{}", self.id, REJECTED_SUFFIX))
    }

    /// Whether the responder has refused this request.
    pub fn is_rejected(&self) -> bool {
        self.rejected_path().exists()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Attempt to resolve without blocking. `None` means still pending.
    pub async fn resolve(&self) -> RpcResult<Option<RpcResponse>> {
        // Rejection marker wins over everything else.
        if self.is_rejected() {
            return Ok(Some(RpcResponse::synthesized(
                self.url.clone(),
                self.id,
                Status::Rejected,
                Vec::new(),
            )));
        }

        let response_path = self.response_path();
        if response_path.exists() {
            let data = tokio::fs::read(&response_path).await?;
            return Ok(Some(match codec::decode_response(&data) {
                Ok(mut response) => {
                    // A response that arrived past its own deadline is
                    // reported as expired.
                    if response.is_expired() {
                        response.status = Status::Expired;
                    }
                    response
                }
                Err(e) => {
                    debug!("Unreadable response file {}: {}", response_path.display(), e);
                    RpcResponse::synthesized(
                        self.url.clone(),
                        self.id,
                        Status::Error,
                        e.to_string().into_bytes(),
                    )
                }
            }));
        }

        // Request and response both gone: the responder's cleanup
        // already evicted an expired exchange.
        if !self.request_path().exists() {
            return Ok(Some(RpcResponse::synthesized(
                self.url.clone(),
                self.id,
                Status::Expired,
                Vec::new(),
            )));
        }

        if self.is_expired() {
            return Ok(Some(RpcResponse::synthesized(
                self.url.clone(),
                self.id,
                Status::Expired,
                Vec::new(),
            )));
        }

        Ok(None)
    }

    /// Poll until the response arrives or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration, poll_interval: Duration) -> RpcResult<RpcResponse> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(response) = self.resolve().await? {
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(RpcError::Timeout(timeout));
            }
            sleep(poll_interval).await;
        }
    }
}

/// Outcome of [`BulkFuture::gather_completed`].
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Responses with successful status codes.
    pub successes: Vec<RpcResponse>,
    /// Terminal responses with explicit error codes (rejected, expired,
    /// error, ...).
    pub failures: Vec<RpcResponse>,
    /// Futures still outstanding when the timeout elapsed.
    pub pending: Vec<RpcFuture>,
}

/// Aggregate over the futures of one broadcast.
#[derive(Debug, Default)]
pub struct BulkFuture {
    pub futures: Vec<RpcFuture>,
    /// Per-url send failures. These did not abort the other sends.
    pub send_errors: Vec<(String, RpcError)>,
}

impl BulkFuture {
    /// Deterministic aggregate id derived from the member ids.
    pub fn aggregate_id(&self) -> Uuid {
        let combined = self
            .futures
            .iter()
            .map(|f| f.id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let digest = Sha256::digest(combined.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes)
    }

    /// Poll all member futures until every one is terminal or `timeout`
    /// elapses. Each tick resolves the remaining futures once.
    pub async fn gather_completed(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> RpcResult<BulkOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = BulkOutcome::default();
        let mut pending: Vec<RpcFuture> = self.futures.clone();

        loop {
            let mut still_pending = Vec::new();
            for future in pending {
                match future.resolve().await? {
                    Some(response) if response.is_success() => outcome.successes.push(response),
                    Some(response) => outcome.failures.push(response),
                    None => still_pending.push(future),
                }
            }
            pending = still_pending;

            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            sleep(poll_interval).await;
        }

        outcome.pending = pending;
        Ok(outcome)
    }
}
