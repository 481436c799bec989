//! Debounced writes of the library cache.
//!
//! Every request restarts a single delayed task holding the newest snapshot.
//! Once the quiet interval elapses the write itself is detached, so a later
//! request (or a disconnect) never interrupts a write that already started.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::store::{CacheSnapshot, HostCache};

pub struct PersistenceDebouncer {
    cache: HostCache,
    interval: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceDebouncer {
    pub fn new(cache: HostCache, interval: Duration) -> Self {
        Self {
            cache,
            interval,
            pending: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &HostCache {
        &self.cache
    }

    /// Schedule a write of `snapshot` after the quiet interval, replacing any
    /// write still waiting for its timer.
    pub fn request_save(&self, snapshot: CacheSnapshot) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = pending.take() {
            timer.abort();
        }

        let cache = self.cache.clone();
        let interval = self.interval;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            tokio::spawn(async move { write(&cache, &snapshot).await });
        }));
    }

    /// Write now, dropping any scheduled write.
    pub async fn flush(&self, snapshot: CacheSnapshot) {
        if let Some(timer) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        write(&self.cache, &snapshot).await;
    }

    /// Whether a write is still waiting for its timer.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

async fn write(cache: &HostCache, snapshot: &CacheSnapshot) {
    match cache.save(snapshot).await {
        Ok(()) => tracing::debug!(
            "Library cache written ({} items)",
            snapshot.mirror.total_len()
        ),
        Err(e) => tracing::warn!("Failed to write library cache: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogItem, CatalogKind};
    use crate::mirror::Mirror;
    use crate::store::MemoryStore;
    use crate::testing::{self, settle};
    use std::sync::Arc;

    const INTERVAL: Duration = Duration::from_secs(3);

    fn snapshot_with(ids: &[u64]) -> CacheSnapshot {
        let mut mirror = Mirror::new();
        mirror.replace_kind(
            CatalogKind::Movie,
            ids.iter()
                .map(|id| {
                    CatalogItem::from_value(CatalogKind::Movie, testing::record(CatalogKind::Movie, *id))
                        .unwrap()
                })
                .collect(),
        );
        CacheSnapshot { mirror, fingerprints: Default::default() }
    }

    fn debouncer() -> (Arc<MemoryStore>, PersistenceDebouncer) {
        let store = Arc::new(MemoryStore::new());
        let cache = HostCache::new(store.clone(), &testing::host());
        (store, PersistenceDebouncer::new(cache, INTERVAL))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_requests_writes_once_with_last_snapshot() {
        let (store, debouncer) = debouncer();
        let key = debouncer.cache().mirror_key();

        for n in 1..=5 {
            debouncer.request_save(snapshot_with(&(1..=n).collect::<Vec<_>>()));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(store.write_count(&key), 0);
        assert!(debouncer.is_pending());

        tokio::time::sleep(INTERVAL).await;
        settle().await;

        assert_eq!(store.write_count(&key), 1);
        let restored = debouncer.cache().load().await.unwrap();
        assert_eq!(restored.mirror.len(CatalogKind::Movie), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_request_restarts_the_timer() {
        let (store, debouncer) = debouncer();
        let key = debouncer.cache().mirror_key();

        debouncer.request_save(snapshot_with(&[1]));
        tokio::time::sleep(INTERVAL - Duration::from_millis(100)).await;
        debouncer.request_save(snapshot_with(&[1, 2]));
        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;

        // the first timer would have fired by now
        assert_eq!(store.write_count(&key), 0);

        tokio::time::sleep(INTERVAL).await;
        settle().await;
        assert_eq!(store.write_count(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_not_retried() {
        let (store, debouncer) = debouncer();
        store.set_failing(true);

        debouncer.request_save(snapshot_with(&[1]));
        tokio::time::sleep(INTERVAL * 3).await;
        settle().await;

        assert!(!debouncer.is_pending());
        assert_eq!(store.write_count(&debouncer.cache().mirror_key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_immediately() {
        let (store, debouncer) = debouncer();
        debouncer.request_save(snapshot_with(&[1]));

        debouncer.flush(snapshot_with(&[1, 2])).await;
        tokio::time::sleep(INTERVAL * 2).await;
        settle().await;

        assert_eq!(store.write_count(&debouncer.cache().mirror_key()), 1);
    }
}
