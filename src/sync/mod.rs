//! Library synchronization.
//!
//! [`Library`] is the per-host mirror plus everything that must outlive a
//! single session (fingerprints, scan flags, the reconcile slot, pending
//! cache writes). [`LibrarySynchronizer`] is created per session and is the
//! only writer: every mutation runs while holding the library's reconcile
//! slot, so passes triggered by the initial load and by notifications are
//! applied one after another in arrival order.

mod load;
mod reconcile;

pub use reconcile::KindOutcome;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{broadcast, Mutex as SlotMutex, MutexGuard};

use crate::api::fetch::UserPlaylist;
use crate::api::RemoteApi;
use crate::catalog::{CatalogItem, CatalogKind, MediaDomain};
use crate::config::SyncConfig;
use crate::events::EngineEvent;
use crate::fingerprint::{Fingerprint, FingerprintSet};
use crate::host::{HostDescriptor, LibraryScope};
use crate::mirror::Mirror;
use crate::persistence::PersistenceDebouncer;
use crate::state::StateHolder;
use crate::store::{CacheSnapshot, HostCache, KeyValueStore};

pub struct Library {
    host: HostDescriptor,
    mirror: RwLock<Mirror>,
    fingerprints: Mutex<FingerprintSet>,
    playlists: RwLock<Vec<UserPlaylist>>,
    scanning_audio: AtomicBool,
    scanning_video: AtomicBool,
    restored: AtomicBool,
    slot: SlotMutex<()>,
    persistence: PersistenceDebouncer,
    events: broadcast::Sender<EngineEvent>,
}

impl Library {
    pub fn new(
        host: HostDescriptor,
        store: Arc<dyn KeyValueStore>,
        settings: &SyncConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let cache = HostCache::new(store, &host);
        Self {
            host,
            mirror: RwLock::new(Mirror::new()),
            fingerprints: Mutex::new(FingerprintSet::default()),
            playlists: RwLock::new(Vec::new()),
            scanning_audio: AtomicBool::new(false),
            scanning_video: AtomicBool::new(false),
            restored: AtomicBool::new(false),
            slot: SlotMutex::new(()),
            persistence: PersistenceDebouncer::new(cache, settings.save_debounce()),
            events,
        }
    }

    pub fn host(&self) -> &HostDescriptor {
        &self.host
    }

    /// Run `f` against the current mirror.
    pub fn with_mirror<R>(&self, f: impl FnOnce(&Mirror) -> R) -> R {
        f(&self.mirror.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn mirror(&self) -> Mirror {
        self.with_mirror(Mirror::clone)
    }

    pub fn items(&self, kind: CatalogKind) -> Vec<CatalogItem> {
        self.with_mirror(|mirror| mirror.items(kind).to_vec())
    }

    pub fn get(&self, kind: CatalogKind, id: u64) -> Option<CatalogItem> {
        self.with_mirror(|mirror| mirror.get(kind, id).cloned())
    }

    pub fn playlists(&self) -> Vec<UserPlaylist> {
        self.playlists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stored fingerprint of a video kind.
    pub fn fingerprint(&self, kind: CatalogKind) -> Option<Fingerprint> {
        self.fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    pub fn is_scanning(&self, domain: MediaDomain) -> bool {
        self.scan_flag(domain).load(Ordering::SeqCst)
    }

    pub(crate) fn set_scanning(&self, domain: MediaDomain, scanning: bool) {
        self.scan_flag(domain).store(scanning, Ordering::SeqCst);
    }

    /// Forget scans in progress. A scan's finish notice only reaches the
    /// session that saw it start.
    pub(crate) fn reset_scanning(&self) {
        self.scanning_audio.store(false, Ordering::SeqCst);
        self.scanning_video.store(false, Ordering::SeqCst);
    }

    fn scan_flag(&self, domain: MediaDomain) -> &AtomicBool {
        match domain {
            MediaDomain::Audio => &self.scanning_audio,
            MediaDomain::Video => &self.scanning_video,
        }
    }

    /// Wait for the reconcile slot. Held for the whole of one load pass or
    /// one notification-driven mutation.
    pub(crate) async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.slot.lock().await
    }

    /// Mutate mirror and fingerprints together. Callers hold the slot.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut Mirror, &mut FingerprintSet) -> R) -> R {
        let mut mirror = self.mirror.write().unwrap_or_else(PoisonError::into_inner);
        let mut fingerprints = self
            .fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut mirror, &mut fingerprints)
    }

    pub(crate) fn set_playlists(&self, playlists: Vec<UserPlaylist>) -> bool {
        let mut current = self.playlists.write().unwrap_or_else(PoisonError::into_inner);
        if *current == playlists {
            return false;
        }
        *current = playlists;
        true
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> CacheSnapshot {
        let mirror = self.mirror();
        let fingerprints = self
            .fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        CacheSnapshot { mirror, fingerprints }
    }

    /// Schedule a debounced cache write of the current state.
    pub(crate) fn request_save(&self) {
        self.persistence.request_save(self.snapshot());
    }

    /// Write the current state immediately.
    pub async fn flush(&self) {
        self.persistence.flush(self.snapshot()).await;
    }

    /// Seed an empty mirror from the host's cache. Only the first call per
    /// library reads the store.
    pub(crate) async fn restore_from_cache(&self) -> bool {
        if self.restored.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(snapshot) = self.persistence.cache().load().await else {
            tracing::debug!("No usable library cache for {}", self.host.name);
            return false;
        };

        let count = snapshot.mirror.total_len();
        let restored = self.write(|mirror, fingerprints| {
            if mirror.kinds().next().is_some() {
                return false;
            }
            *mirror = snapshot.mirror;
            *fingerprints = snapshot.fingerprints;
            true
        });
        if restored {
            tracing::info!("Restored {} cached items for {}", count, self.host.name);
        }
        restored
    }
}

/// Keeps one host's [`Library`] in step with that host for the lifetime of a
/// session.
pub struct LibrarySynchronizer {
    api: Arc<dyn RemoteApi>,
    library: Arc<Library>,
    scope: LibraryScope,
    settings: SyncConfig,
    state: StateHolder,
}

impl LibrarySynchronizer {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        library: Arc<Library>,
        settings: SyncConfig,
        state: StateHolder,
    ) -> Self {
        let scope = library.host().scope;
        library.reset_scanning();
        Self {
            api,
            library,
            scope,
            settings,
            state,
        }
    }

    pub fn api(&self) -> &dyn RemoteApi {
        self.api.as_ref()
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    pub fn scope(&self) -> LibraryScope {
        self.scope
    }

    pub fn state(&self) -> &StateHolder {
        &self.state
    }
}
