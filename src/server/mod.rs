//! Event-driven RPC server.
//!
//! Watches an app's rpc subtree for incoming request files, dispatches
//! them to registered handlers, and writes responses back. One watcher
//! task, a bounded intake queue, a fixed-size worker pool, a periodic
//! rescan, and a background cleanup sweep.

pub mod dispatch;
pub mod routes;
pub mod schema;
pub mod watcher;

pub use routes::RouteTable;
pub use schema::SCHEMA_FILENAME;

use crate::cleanup::PeriodicCleanup;
use crate::client::Client;
use crate::perms::{PermissionEngine, POLICY_FILENAME};
use crate::protocol::{Body, Headers, ProtocolError, RpcRequest, Status};
use dispatch::{dispatch_loop, Dispatcher};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use watcher::{enqueue, rescan_task, rpc_watcher_task, scan_pending};

/// Error type for server configuration and lifecycle.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("schema error: {0}")]
    Schema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by a handler; turned into an `Error` response whose
/// body describes the failure.
#[derive(Debug, Clone)]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(e: ProtocolError) -> Self {
        Self(e.to_string())
    }
}

/// What a handler hands back; the server wraps it into a response
/// record. Raw data converts via the `ok` constructor with status
/// `Completed`.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub status: Status,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Default for HandlerResponse {
    fn default() -> Self {
        Self {
            status: Status::Completed,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

impl HandlerResponse {
    /// A `Completed` response around raw data.
    pub fn ok(body: impl Into<Body>) -> Result<Self, HandlerError> {
        Ok(Self {
            body: body.into().to_bytes()?,
            ..Self::default()
        })
    }

    /// A `Completed` response around any `Serialize` type, as JSON.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, HandlerError> {
        let mut response = Self {
            body: Body::from_serialize(value)?.to_bytes()?,
            ..Self::default()
        };
        response.headers.append("content-type", "application/json");
        Ok(response)
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerResponse, HandlerError>> + Send>>;

/// Uniform handler type: every route maps a decoded request to a
/// response-or-error.
pub type BoxHandler = Arc<dyn Fn(RpcRequest) -> HandlerFuture + Send + Sync>;

/// Telemetry counters of one event server.
#[derive(Debug, Default)]
pub struct ServerStats {
    dispatched: AtomicU64,
    duplicates: AtomicU64,
    dropped_events: AtomicU64,
    rejected: AtomicU64,
    not_found: AtomicU64,
    expired_ignored: AtomicU64,
    errors: AtomicU64,
}

impl ServerStats {
    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_expired_ignored(&self) {
        self.expired_ignored.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
    pub fn not_found(&self) -> u64 {
        self.not_found.load(Ordering::Relaxed)
    }
    pub fn expired_ignored(&self) -> u64 {
        self.expired_ignored.load(Ordering::Relaxed)
    }
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Configuration of one event server.
#[derive(Debug, Clone)]
pub struct EventServerConfig {
    /// Determines the rpc subtree: `<datasite>/app_data/<app_name>/rpc`.
    pub app_name: String,
    /// Handler pool size.
    pub workers: usize,
    /// Bound of the intake queue; overflow drops events (the rescan
    /// picks the files up later).
    pub intake_capacity: usize,
    /// Interval of the periodic rescan that complements the watcher.
    pub poll_interval: Duration,
    /// How long `stop` waits for in-flight handlers before aborting.
    pub shutdown_grace: Duration,
    /// Interval between cleanup sweeps.
    pub cleanup_interval: Duration,
    /// How long after `expires` an artifact is retained before the
    /// cleanup sweep evicts it.
    pub cleanup_retention: Duration,
}

impl EventServerConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            workers: 4,
            intake_capacity: 256,
            poll_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(600),
            cleanup_retention: Duration::ZERO,
        }
    }
}

/// Default permissions the server publishes into its rpc tree: anyone
/// may write requests and read responses and the schema.
const DEFAULT_RPC_POLICY: &str = "\
rules:
- pattern: 'rpc.schema.json'
  access:
    read:
    - '*'
- pattern: '**/*.request'
  access:
    read:
    - '*'
    write:
    - '*'
- pattern: '**/*.response'
  access:
    read:
    - '*'
    write:
    - '*'
";

/// The event server.
pub struct EventServer {
    client: Arc<Client>,
    config: EventServerConfig,
    perms: Arc<PermissionEngine>,
    routes: RouteTable,
    stats: Arc<ServerStats>,
    running: Arc<AtomicBool>,
    stop_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    cleanup: Option<PeriodicCleanup>,
}

impl EventServer {
    pub fn new(client: Arc<Client>, config: EventServerConfig) -> Self {
        let perms = Arc::new(PermissionEngine::new(client.datasites(), true));
        Self {
            client,
            config,
            perms,
            routes: RouteTable::new(),
            stats: Arc::new(ServerStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            tasks: Vec::new(),
            cleanup: None,
        }
    }

    /// Use a shared permissions engine instead of a private one.
    pub fn with_permission_engine(mut self, perms: Arc<PermissionEngine>) -> Self {
        self.perms = perms;
        self
    }

    /// The rpc directory this server owns.
    pub fn rpc_dir(&self) -> PathBuf {
        self.client.app_rpc_dir(&self.config.app_name)
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind a handler to an endpoint pattern. Must be called before
    /// `start`.
    pub fn on_request<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<(), ServerError>
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerResponse, HandlerError>> + Send + 'static,
    {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }
        let handler: BoxHandler = Arc::new(move |request| Box::pin(handler(request)));
        self.routes.register(pattern, handler)?;
        info!("Registered route {}", pattern);
        Ok(())
    }

    /// Bind an already-boxed handler (used by adapters like the HTTP
    /// bridge).
    pub fn on_request_boxed(&mut self, pattern: &str, handler: BoxHandler) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }
        self.routes.register(pattern, handler)?;
        info!("Registered route {}", pattern);
        Ok(())
    }

    /// Create the rpc tree, publish permissions and the route schema,
    /// process requests that arrived while the server was down, then
    /// spawn the watcher, rescan, dispatch, and cleanup tasks.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let rpc_dir = self.rpc_dir();
        tokio::fs::create_dir_all(&rpc_dir).await?;

        crate::rpc::write_atomic(&rpc_dir.join(POLICY_FILENAME), DEFAULT_RPC_POLICY.as_bytes())
            .await?;
        schema::publish_schema(&rpc_dir, &self.routes).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (intake_tx, intake_rx) = mpsc::channel(self.config.intake_capacity.max(1));

        let dispatcher = Arc::new(Dispatcher {
            client: self.client.clone(),
            perms: self.perms.clone(),
            routes: Arc::new(self.routes.clone()),
            rpc_dir: rpc_dir.clone(),
            stats: self.stats.clone(),
        });

        self.tasks.push(tokio::spawn(dispatch_loop(
            dispatcher,
            intake_rx,
            stop_rx.clone(),
            self.config.workers,
            self.config.shutdown_grace,
        )));

        // Startup scan: anything that arrived while we were down.
        let pending = scan_pending(&rpc_dir);
        if !pending.is_empty() {
            info!("Startup scan found {} pending request(s)", pending.len());
        }
        for path in pending {
            enqueue(&intake_tx, path, &self.stats);
        }

        self.tasks.push(tokio::spawn(rpc_watcher_task(
            rpc_dir.clone(),
            intake_tx.clone(),
            stop_rx.clone(),
            self.stats.clone(),
        )));
        self.tasks.push(tokio::spawn(rescan_task(
            rpc_dir.clone(),
            intake_tx,
            stop_rx,
            self.config.poll_interval,
            self.stats.clone(),
        )));

        let mut cleanup = PeriodicCleanup::new(
            rpc_dir,
            self.config.cleanup_interval,
            self.config.cleanup_retention,
        );
        cleanup.start();
        self.cleanup = Some(cleanup);

        self.stop_tx = Some(stop_tx);
        self.running.store(true, Ordering::SeqCst);
        info!("Event server for {} started", self.config.app_name);
        Ok(())
    }

    /// Stop the server: signal the tasks, let the dispatch loop drain
    /// and honor the grace period, then join everything.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Server task ended abnormally: {}", e);
                }
            }
        }
        if let Some(mut cleanup) = self.cleanup.take() {
            cleanup.stop().await;
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Event server for {} stopped", self.config.app_name);
    }
}
