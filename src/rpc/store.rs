use crate::protocol::{Headers, Method};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use syftbox_types::SyftUrl;
use tokio::sync::RwLock;
use uuid::Uuid;

// Table definitions
const FUTURES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("futures");
const CACHE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("send_cache");

#[derive(Debug, Clone)]
pub enum StoreError {
    DatabaseError(String),
    FutureNotFound(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            StoreError::FutureNotFound(id) => write!(f, "Future not found: {}", id),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable record of an outstanding request, the on-disk twin of
/// [`crate::rpc::RpcFuture`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureRecord {
    pub id: Uuid,
    pub url: SyftUrl,
    /// Directory containing the request/response files.
    pub path: PathBuf,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl FutureRecord {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }
}

/// Local persistent index of outstanding futures, plus the opt-in send
/// cache mapping request fingerprints to ids.
pub struct FutureStore {
    db: Arc<RwLock<Database>>,
}

impl FutureStore {
    /// Create or open a future store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Insert a future record.
    pub async fn register(&self, record: &FutureRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        let id = record.id.to_string();

        let db = self.db.write().await;
        let write_txn = db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        {
            let mut table = write_txn
                .open_table(FUTURES_TABLE)
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            table
                .insert(id.as_str(), json.as_str())
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        }

        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Get a future record by id.
    pub async fn lookup(&self, id: Uuid) -> Result<FutureRecord, StoreError> {
        let id = id.to_string();
        let db = self.db.read().await;
        let read_txn = db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let table = match read_txn.open_table(FUTURES_TABLE) {
            Ok(t) => t,
            Err(_) => return Err(StoreError::FutureNotFound(id)),
        };

        let json = table
            .get(id.as_str())
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?
            .ok_or(StoreError::FutureNotFound(id))?;

        serde_json::from_str(json.value()).map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Ids of futures that are neither resolved (dropped) nor expired.
    pub async fn list_pending(&self) -> Result<Vec<Uuid>, StoreError> {
        let db = self.db.read().await;
        let read_txn = db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let table = match read_txn.open_table(FUTURES_TABLE) {
            Ok(t) => t,
            Err(_) => return Ok(Vec::new()),
        };

        let mut pending = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        for entry in iter {
            let (_, value) = entry.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let record: FutureRecord = match serde_json::from_str(value.value()) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Skipping unreadable future record: {}", e);
                    continue;
                }
            };
            if !record.is_expired() {
                pending.push(record.id);
            }
        }

        Ok(pending)
    }

    /// Remove a future record.
    pub async fn drop_future(&self, id: Uuid) -> Result<(), StoreError> {
        let id = id.to_string();
        let db = self.db.write().await;
        let write_txn = db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        {
            let mut table = write_txn
                .open_table(FUTURES_TABLE)
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            table
                .remove(id.as_str())
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        }

        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Look up the future id cached under a request fingerprint.
    pub async fn cache_lookup(&self, fingerprint: &str) -> Result<Option<Uuid>, StoreError> {
        let db = self.db.read().await;
        let read_txn = db
            .begin_read()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let table = match read_txn.open_table(CACHE_TABLE) {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };

        let result = table
            .get(fingerprint)
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?
            .and_then(|v| Uuid::parse_str(v.value()).ok());

        Ok(result)
    }

    /// Bind a request fingerprint to a future id.
    pub async fn cache_insert(&self, fingerprint: &str, id: Uuid) -> Result<(), StoreError> {
        let id = id.to_string();
        let db = self.db.write().await;
        let write_txn = db
            .begin_write()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        {
            let mut table = write_txn
                .open_table(CACHE_TABLE)
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            table
                .insert(fingerprint, id.as_str())
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        }

        write_txn
            .commit()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        Ok(())
    }
}

/// Cache key for a send: sha256 over method, canonical URL, canonical
/// headers, and body.
pub fn request_fingerprint(method: Method, url: &SyftUrl, headers: &Headers, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(url.to_string().as_bytes());
    hasher.update(headers.canonical().as_bytes());
    hasher.update(body);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
