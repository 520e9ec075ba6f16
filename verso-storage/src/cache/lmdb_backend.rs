//! LMDB-backed cache store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store that survives process restarts.
//!
//! # Value Format
//!
//! `[expires_at_ms: 8 bytes LE][json value]`, where an expiry of 0 means the
//! entry never expires. Expired entries read as absent and are deleted on
//! the next access.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The store uses:
//! - Read transactions for `get` and `key_exists`
//! - Write transactions for `add`, `delete`, `remove_all` and expiry sweeps
//! - Statistics behind a `RwLock`

use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde_json::Value;
use verso_core::{CacheError, CacheResult};

use super::traits::{CacheStats, CacheStore};

/// Error type for LMDB store setup and internal operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded stored value.
struct Stored {
    expires_at_ms: i64,
    value: Value,
}

impl Stored {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms == 0 || now_ms < self.expires_at_ms
    }
}

fn encode(value: &Value, ttl: Option<Duration>) -> Result<Vec<u8>, LmdbCacheError> {
    let expires_at_ms = ttl
        .map(|ttl| {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            Utc::now().timestamp_millis().saturating_add(ttl_ms)
        })
        .unwrap_or(0);
    let value_bytes =
        serde_json::to_vec(value).map_err(|e| LmdbCacheError::Serialization(e.to_string()))?;

    let mut full_bytes = Vec::with_capacity(8 + value_bytes.len());
    full_bytes.extend_from_slice(&expires_at_ms.to_le_bytes());
    full_bytes.extend_from_slice(&value_bytes);
    Ok(full_bytes)
}

fn decode(bytes: &[u8]) -> Result<Stored, LmdbCacheError> {
    if bytes.len() < 8 {
        return Err(LmdbCacheError::Deserialization("value shorter than header".into()));
    }
    let header: [u8; 8] = bytes[0..8]
        .try_into()
        .map_err(|_| LmdbCacheError::Deserialization("Invalid expiry header".into()))?;
    let value = serde_json::from_slice(&bytes[8..])
        .map_err(|e| LmdbCacheError::Deserialization(e.to_string()))?;
    Ok(Stored {
        expires_at_ms: i64::from_le_bytes(header),
        value,
    })
}

/// LMDB-backed cache store.
///
/// # Example
///
/// ```ignore
/// use verso_storage::cache::LmdbCacheStore;
///
/// let store = LmdbCacheStore::new("far", "/var/cache/verso", 64)?;
/// store.add_with_ttl("photo-1", json!({"id": 1}), Duration::from_secs(60)).await?;
/// ```
pub struct LmdbCacheStore {
    name: String,
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    stats: RwLock<CacheStats>,
}

impl LmdbCacheStore {
    /// Create a new LMDB cache store.
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in logs and errors
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn new<P: AsRef<Path>>(
        name: impl Into<String>,
        path: P,
        max_size_mb: usize,
    ) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this store and
        // never opened twice in the same process with different options.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            env,
            db,
            stats: RwLock::new(CacheStats::default()),
        })
    }

    fn unreachable(&self, e: impl ToString) -> CacheError {
        CacheError::unreachable(&self.name, e)
    }

    fn put(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<(), LmdbCacheError> {
        let full_bytes = encode(value, ttl)?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let is_new = self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            .is_none();

        self.db
            .put(&mut wtxn, key.as_bytes(), &full_bytes)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        if let Ok(mut stats) = self.stats.write() {
            if is_new {
                stats.entry_count += 1;
            }
            stats.memory_bytes += full_bytes.len() as u64;
        }
        Ok(())
    }

    /// Read a live value; expired entries are deleted and read as absent.
    fn read_live(&self, key: &str) -> Result<Option<Value>, LmdbCacheError> {
        let stored = {
            let rtxn = self
                .env
                .read_txn()
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            match self
                .db
                .get(&rtxn, key.as_bytes())
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            {
                Some(bytes) => decode(bytes)?,
                None => return Ok(None),
            }
        };

        if stored.is_live(Utc::now().timestamp_millis()) {
            return Ok(Some(stored.value));
        }

        if self.remove_expired(key)? {
            if let Ok(mut stats) = self.stats.write() {
                stats.evictions += 1;
            }
        }
        Ok(None)
    }

    /// Delete `key` only if it is still expired inside the write transaction,
    /// so a concurrent `add` is not lost.
    fn remove_expired(&self, key: &str) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let expired = match self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
        {
            Some(bytes) => !decode(bytes)?.is_live(Utc::now().timestamp_millis()),
            None => false,
        };
        if !expired {
            return Ok(false);
        }

        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        if let Ok(mut stats) = self.stats.write() {
            stats.entry_count = stats.entry_count.saturating_sub(1);
        }
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let deleted = self
            .db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        if deleted {
            if let Ok(mut stats) = self.stats.write() {
                stats.entry_count = stats.entry_count.saturating_sub(1);
            }
        }
        Ok(deleted)
    }

    fn clear(&self) -> Result<(), LmdbCacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        self.db
            .clear(&mut wtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        if let Ok(mut stats) = self.stats.write() {
            stats.entry_count = 0;
            stats.memory_bytes = 0;
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for LmdbCacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, key: &str, value: Value) -> CacheResult<()> {
        self.put(key, &value, None).map_err(|e| self.unreachable(e))
    }

    async fn add_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()> {
        self.put(key, &value, Some(ttl)).map_err(|e| self.unreachable(e))
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        // A removed-but-expired entry does not count as a live removal.
        let live = self.read_live(key).map_err(|e| self.unreachable(e))?.is_some();
        if !live {
            return Ok(false);
        }
        self.remove(key).map_err(|e| self.unreachable(e))
    }

    async fn remove_all(&self) -> CacheResult<()> {
        self.clear().map_err(|e| self.unreachable(e))
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let found = self.read_live(key).map_err(|e| self.unreachable(e))?;
        if let Ok(mut stats) = self.stats.write() {
            if found.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
        Ok(found)
    }

    async fn key_exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self
            .read_live(key)
            .map_err(|e| self.unreachable(e))?
            .is_some())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(self.stats.read().map(|s| s.clone()).unwrap_or_default())
    }
}
