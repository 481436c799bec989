//! Key/value persistence for the library cache.
//!
//! - [`RedbStore`]: single redb table of JSON blobs (default)
//! - [`MemoryStore`]: process-local map, for tests and throwaway sessions
//!
//! [`HostCache`] scopes keys to one host and knows the two entries the engine
//! keeps per host: the mirror snapshot and the video fingerprints.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::fingerprint::FingerprintSet;
use crate::host::HostDescriptor;
use crate::mirror::Mirror;

const CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("library_cache");

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Human-readable backend name (e.g., "redb", "memory").
    fn backend_name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// Transactions run on the blocking pool; redb does file IO and fsync
/// inline.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new() -> Result<Self> {
        Self::open(&Self::get_db_path()?)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .context("Failed to open library cache database")?;
        // Ensure table exists
        let txn = db.begin_write()?;
        { let _ = txn.open_table(CACHE_TABLE)?; }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    fn get_db_path() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .context("Failed to get cache directory")?
            .join("drift-host");
        std::fs::create_dir_all(&cache_dir)
            .context("Failed to create cache directory")?;
        Ok(cache_dir.join("library.redb"))
    }
}

#[async_trait]
impl KeyValueStore for RedbStore {
    fn backend_name(&self) -> &str {
        "redb"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let txn = db.begin_read()?;
            let table = txn.open_table(CACHE_TABLE)?;
            Ok(table.get(key.as_str())?.map(|value| value.value().to_vec()))
        })
        .await
        .context("Library cache read task failed")?
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_string();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(CACHE_TABLE)?;
                table.insert(key.as_str(), value.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .context("Library cache write task failed")?
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: Mutex<HashMap<String, usize>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `key` has been written.
    pub fn write_count(&self, key: &str) -> usize {
        self.writes
            .lock()
            .map(|w| w.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Make every subsequent write fail (simulates a full disk).
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("write rejected for {key}");
        }
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?
            .insert(key.to_string(), value.to_vec());
        *self
            .writes
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?
            .entry(key.to_string())
            .or_default() += 1;
        Ok(())
    }
}

/// Everything written for a host in one persistence pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    pub mirror: Mirror,
    pub fingerprints: FingerprintSet,
}

#[derive(Serialize, Deserialize)]
struct StoredMirror {
    #[serde(with = "chrono::serde::ts_seconds")]
    saved_at: DateTime<Utc>,
    mirror: Mirror,
}

/// A store view scoped to one host.
#[derive(Clone)]
pub struct HostCache {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl HostCache {
    pub fn new(store: Arc<dyn KeyValueStore>, host: &HostDescriptor) -> Self {
        Self {
            store,
            namespace: host.cache_namespace(),
        }
    }

    pub fn mirror_key(&self) -> String {
        format!("{}:mirror", self.namespace)
    }

    pub fn fingerprints_key(&self) -> String {
        format!("{}:fingerprints", self.namespace)
    }

    /// Read the cached snapshot. Missing or unreadable entries mean "no
    /// cache"; the caller falls back to a full load.
    pub async fn load(&self) -> Option<CacheSnapshot> {
        let mirror = match self.store.get(&self.mirror_key()).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<StoredMirror>(&bytes) {
                Ok(stored) => {
                    tracing::debug!("Cached mirror from {} restored", stored.saved_at);
                    stored.mirror
                }
                Err(e) => {
                    tracing::warn!("Cached mirror corrupt, ignoring: {}", e);
                    return None;
                }
            },
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Could not read cached mirror: {}", e);
                return None;
            }
        };

        let fingerprints = match self.store.get(&self.fingerprints_key()).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("Cached fingerprints corrupt, ignoring: {}", e);
                FingerprintSet::default()
            }),
            Ok(None) => FingerprintSet::default(),
            Err(e) => {
                tracing::warn!("Could not read cached fingerprints: {}", e);
                FingerprintSet::default()
            }
        };

        Some(CacheSnapshot { mirror, fingerprints })
    }

    pub async fn save(&self, snapshot: &CacheSnapshot) -> Result<()> {
        let stored = StoredMirror {
            saved_at: Utc::now(),
            mirror: snapshot.mirror.clone(),
        };
        let mirror = serde_json::to_vec(&stored).context("Failed to serialize mirror")?;
        let fingerprints =
            serde_json::to_vec(&snapshot.fingerprints).context("Failed to serialize fingerprints")?;

        self.store.set(&self.fingerprints_key(), &fingerprints).await?;
        self.store.set(&self.mirror_key(), &mirror).await?;
        Ok(())
    }
}
