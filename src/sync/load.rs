//! Full loads and the staleness check that decides between them and
//! incremental reconciliation.

use std::collections::BTreeSet;

use futures_util::future::{join_all, try_join_all};

use super::reconcile::KindOutcome;
use super::LibrarySynchronizer;
use crate::api::fetch;
use crate::catalog::{CatalogKind, MediaDomain};
use crate::error::RemoteError;
use crate::events::EngineEvent;
use crate::fingerprint::{Fingerprint, FingerprintSet, KindFingerprint, Timestamps};
use crate::mirror::Mirror;
use crate::state::ConnectionState;

/// Result of comparing one kind against the host.
#[derive(Debug)]
enum Check {
    Fresh,
    /// Not in the mirror at all (no cache, or newly in scope).
    Missing,
    Stale(KindFingerprint),
    /// The host's summary could not be read.
    Unreadable,
}

/// The subset of library-wide timestamps that belongs to one kind.
fn kind_timestamps(kind: CatalogKind, all: &Timestamps) -> Timestamps {
    kind.timestamp_properties()
        .iter()
        .filter_map(|key| all.get(*key).map(|value| (key.to_string(), value.clone())))
        .collect()
}

impl LibrarySynchronizer {
    /// Bring the mirror up to date with the host.
    ///
    /// Without a usable mirror, or with `force`, every kind in scope is
    /// fetched from scratch. Otherwise cheap fingerprints decide which kinds
    /// need work, and only those are reconciled.
    pub async fn load_library(&self, force: bool) -> Result<(), RemoteError> {
        let _slot = self.library.acquire().await;
        self.state.transition(ConnectionState::LoadingLibrary);

        if !force {
            self.library.restore_from_cache().await;
        }
        let kinds = self.scope.kinds();
        self.drop_out_of_scope();

        let cached = self
            .library
            .with_mirror(|mirror| kinds.iter().any(|kind| mirror.has_kind(*kind)));

        if force || !cached {
            let complete = self.full_load(&kinds).await?;
            self.finish(complete);
        } else {
            self.update_from_fingerprints(&kinds).await?;
        }

        self.refresh_playlists().await
    }

    fn drop_out_of_scope(&self) {
        let dropped = self.library.write(|mirror, fingerprints| {
            let dropped: Vec<CatalogKind> = mirror
                .kinds()
                .filter(|kind| !self.scope.includes(*kind))
                .collect();
            for kind in &dropped {
                mirror.drop_kind(*kind);
            }
            if !dropped.is_empty() {
                let kept = std::mem::take(fingerprints);
                for kind in mirror.kinds().collect::<Vec<_>>() {
                    if let Some(fingerprint) = kept.get(kind) {
                        fingerprints.set(kind, fingerprint.clone());
                    }
                }
            }
            dropped
        });

        for kind in dropped {
            tracing::info!("Dropping {} from mirror (out of scope)", kind);
            self.library.emit(EngineEvent::LibraryChanged(kind));
        }
    }

    /// Audio timestamps for the given kinds. Unreadable timestamps are
    /// reported as `None` so affected kinds count as stale.
    async fn audio_timestamps(&self, kinds: &[CatalogKind]) -> Result<Option<Timestamps>, RemoteError> {
        let audio: Vec<CatalogKind> = kinds
            .iter()
            .copied()
            .filter(|kind| kind.domain() == MediaDomain::Audio)
            .collect();
        if audio.is_empty() {
            return Ok(None);
        }
        match fetch::fetch_audio_timestamps(self.api(), &audio).await {
            Ok(stamps) => Ok(Some(stamps)),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                tracing::warn!("Could not read audio library timestamps: {}", e);
                Ok(None)
            }
        }
    }

    /// Replace the whole mirror with a fresh copy of every kind in scope.
    ///
    /// Returns whether every kind decoded in full. A kind that did not keeps
    /// what the mirror already had for it and gets no new fingerprint, so the
    /// library cannot be reported as loaded.
    pub(crate) async fn full_load(&self, kinds: &[CatalogKind]) -> Result<bool, RemoteError> {
        tracing::info!("Full library load of {} ({} kinds)", self.library.host().name, kinds.len());

        // timestamps first, so changes during the fetch read as stale next time
        let stamps = self.audio_timestamps(kinds).await?;
        let lists = try_join_all(kinds.iter().map(|kind| fetch::fetch_kind(self.api(), *kind))).await?;

        let mut mirror = Mirror::new();
        let mut fingerprints = FingerprintSet::default();
        let mut degraded = Vec::new();
        for (kind, list) in kinds.iter().copied().zip(lists) {
            if !list.complete {
                degraded.push((kind, list.items));
                continue;
            }
            if kind.has_item_fingerprint() {
                fingerprints.set(kind, Fingerprint::from_items(&list.items));
            }
            if let Some(stamps) = &stamps {
                if kind.domain() == MediaDomain::Audio {
                    mirror.set_properties(kind, kind_timestamps(kind, stamps));
                }
            }
            mirror.replace_kind(kind, list.items);
        }
        let complete = degraded.is_empty();

        let total = self.library.write(|current, current_fingerprints| {
            for (kind, partial) in degraded {
                if current.has_kind(kind) {
                    mirror.replace_kind(kind, current.items(kind).to_vec());
                    if let Some(timestamps) = current.properties(kind) {
                        mirror.set_properties(kind, timestamps.clone());
                    }
                    if let Some(fingerprint) = current_fingerprints.get(kind) {
                        fingerprints.set(kind, fingerprint.clone());
                    }
                } else if !partial.is_empty() {
                    mirror.replace_kind(kind, partial);
                }
            }
            *current = mirror;
            *current_fingerprints = fingerprints;
            current.total_len()
        });
        tracing::info!("Loaded {} items from {}", total, self.library.host().name);

        for kind in kinds {
            self.library.emit(EngineEvent::LibraryChanged(*kind));
        }
        self.library.request_save();
        Ok(complete)
    }

    /// Fetch one kind in full and replace it in the mirror. Returns whether
    /// the kind decoded in full; if not, the mirror keeps what it had.
    async fn reload_kind(&self, kind: CatalogKind, stamps: Option<&Timestamps>) -> Result<bool, RemoteError> {
        let list = fetch::fetch_kind(self.api(), kind).await?;
        tracing::debug!("Refetched {} ({} items)", kind, list.items.len());
        if !list.complete {
            tracing::warn!("{} could not be read in full", kind);
            return Ok(false);
        }

        self.library.write(|mirror, fingerprints| {
            if kind.has_item_fingerprint() {
                fingerprints.set(kind, Fingerprint::from_items(&list.items));
            }
            if let Some(stamps) = stamps {
                mirror.set_properties(kind, kind_timestamps(kind, stamps));
            }
            mirror.replace_kind(kind, list.items);
        });
        self.library.emit(EngineEvent::LibraryChanged(kind));
        Ok(true)
    }

    /// Final state of a pass: loaded only when nothing is left unresolved.
    fn finish(&self, complete: bool) {
        if complete {
            self.state.transition(ConnectionState::LoadedLibrary);
        } else {
            tracing::warn!("Library of {} left outdated", self.library.host().name);
            self.state.transition(ConnectionState::OutdatedLibrary);
        }
    }

    /// Compare every kind in scope against the host. Also returns the audio
    /// timestamps read along the way.
    async fn check_kinds(
        &self,
        kinds: &[CatalogKind],
    ) -> Result<(Vec<(CatalogKind, Check)>, Option<Timestamps>), RemoteError> {
        let present: Vec<CatalogKind> = self.library.with_mirror(|mirror| {
            kinds.iter().copied().filter(|kind| mirror.has_kind(*kind)).collect()
        });
        let video: Vec<CatalogKind> = present
            .iter()
            .copied()
            .filter(|kind| kind.has_item_fingerprint())
            .collect();

        let remote = join_all(video.iter().map(|kind| fetch::fetch_fingerprint(self.api(), *kind))).await;
        let stamps = self.audio_timestamps(kinds).await?;

        let mut remote = video.into_iter().zip(remote);
        let mut checks = Vec::with_capacity(kinds.len());

        for kind in kinds.iter().copied() {
            if !present.contains(&kind) {
                checks.push((kind, Check::Missing));
                continue;
            }

            let check = if kind.has_item_fingerprint() {
                match remote.next() {
                    Some((_, Ok(fingerprint))) => {
                        let stored = self.stored_fingerprint(kind);
                        if stored == fingerprint {
                            Check::Fresh
                        } else {
                            Check::Stale(KindFingerprint::Items(fingerprint))
                        }
                    }
                    Some((_, Err(e))) if e.is_transport() => return Err(e),
                    Some((_, Err(e))) => {
                        tracing::warn!("Could not read {} fingerprint: {}", kind, e);
                        Check::Unreadable
                    }
                    None => Check::Unreadable,
                }
            } else {
                match &stamps {
                    Some(stamps) => {
                        let current = kind_timestamps(kind, stamps);
                        let cached = self.library.with_mirror(|mirror| mirror.properties(kind).cloned());
                        if cached.as_ref() == Some(&current) {
                            Check::Fresh
                        } else {
                            Check::Stale(KindFingerprint::Timestamps(current))
                        }
                    }
                    None => Check::Unreadable,
                }
            };
            checks.push((kind, check));
        }

        Ok((checks, stamps))
    }

    /// Stored fingerprint, or one derived from the mirror when none was
    /// cached. A derived one is kept for later passes.
    pub(crate) fn stored_fingerprint(&self, kind: CatalogKind) -> Fingerprint {
        if let Some(stored) = self.library.fingerprint(kind) {
            return stored;
        }
        self.library.write(|mirror, fingerprints| {
            let derived = Fingerprint::from_items(mirror.items(kind));
            fingerprints.set(kind, derived.clone());
            derived
        })
    }

    /// Staleness check and incremental reconciliation of a cached mirror.
    async fn update_from_fingerprints(&self, kinds: &[CatalogKind]) -> Result<(), RemoteError> {
        let (checks, stamps) = self.check_kinds(kinds).await?;

        if checks.iter().all(|(_, check)| matches!(check, Check::Fresh)) {
            tracing::info!("Library of {} is up to date", self.library.host().name);
            self.state.transition(ConnectionState::LoadedLibrary);
            return Ok(());
        }

        self.state.transition(ConnectionState::OutdatedLibrary);
        self.state.transition(ConnectionState::UpdatingLibrary);

        let mut unresolved: Vec<CatalogKind> = Vec::new();
        let mut parents: BTreeSet<(CatalogKind, u64)> = BTreeSet::new();

        for (kind, check) in checks {
            match check {
                Check::Fresh => {}
                Check::Missing => {
                    let stamps = stamps.as_ref().filter(|_| kind.domain() == MediaDomain::Audio);
                    if !self.reload_kind(kind, stamps).await? {
                        unresolved.push(kind);
                    }
                }
                Check::Unreadable => unresolved.push(kind),
                Check::Stale(KindFingerprint::Timestamps(stamps)) => {
                    if !self.reload_kind(kind, Some(&stamps)).await? {
                        unresolved.push(kind);
                    }
                }
                Check::Stale(KindFingerprint::Items(remote)) => {
                    match self.reconcile_kind(kind, &remote, &mut parents).await? {
                        KindOutcome::Reconciled => {}
                        KindOutcome::TooLarge(count) => {
                            tracing::warn!(
                                "{} differs in {} items, above the reconcile threshold of {}",
                                kind, count, self.settings.reconcile_threshold
                            );
                            unresolved.push(kind);
                        }
                        KindOutcome::Unresolved(ids) => {
                            tracing::warn!("{} items of {} could not be fetched: {:?}", ids.len(), kind, ids);
                            unresolved.push(kind);
                        }
                    }
                }
            }
        }

        self.refresh_parents(parents).await?;
        self.library.request_save();

        if unresolved.is_empty() {
            self.state.transition(ConnectionState::LoadedLibrary);
            return Ok(());
        }

        tracing::warn!("Library of {} left outdated: {:?}", self.library.host().name, unresolved);
        self.state.transition(ConnectionState::OutdatedLibrary);

        if self.settings.auto_reload_outdated {
            self.state.transition(ConnectionState::LoadingLibrary);
            let complete = self.full_load(kinds).await?;
            self.finish(complete);
        }
        Ok(())
    }

    pub(crate) async fn refresh_playlists(&self) -> Result<(), RemoteError> {
        let playlists = fetch::fetch_user_playlists(self.api()).await?;
        tracing::debug!("{} user playlists", playlists.len());
        if self.library.set_playlists(playlists) {
            self.library.emit(EngineEvent::PlaylistsChanged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::catalog::CatalogKind;
    use crate::config::SyncConfig;
    use crate::error::RemoteError;
    use crate::host::LibraryScope;
    use crate::state::ConnectionState;
    use crate::events::EngineEvent;
    use crate::store::KeyValueStore;
    use crate::testing::{self, settle, Fixture};

    fn movies(ids: &[u64]) -> Vec<serde_json::Value> {
        ids.iter().map(|id| testing::record(CatalogKind::Movie, *id)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_load_fetches_every_kind_in_scope() {
        let fx = Fixture::new(LibraryScope::Video);
        fx.api.set_records(CatalogKind::Movie, movies(&[1, 2]));
        fx.api.set_records(CatalogKind::TvShow, vec![testing::record(CatalogKind::TvShow, 7)]);
        fx.api.set_records(CatalogKind::Episode, vec![testing::episode(70, 7)]);

        fx.sync.load_library(false).await.unwrap();

        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);
        assert_eq!(fx.library().items(CatalogKind::Movie).len(), 2);
        assert_eq!(fx.library().items(CatalogKind::Episode).len(), 1);
        assert!(fx.api.calls().iter().all(|m| !m.starts_with("AudioLibrary.")));
        assert_eq!(fx.library().fingerprint(CatalogKind::Movie).unwrap().len(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fx.mirror_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_fingerprints_fetch_no_items() {
        let mut fx = Fixture::new(LibraryScope::Video);
        fx.api.set_records(CatalogKind::Movie, movies(&[10, 11, 12]));
        fx.seed_cache().await;
        fx.reconnect();

        fx.sync.load_library(false).await.unwrap();

        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);
        for kind in LibraryScope::Video.kinds() {
            assert!(fx.api.detail_requests(kind).is_empty(), "{} details fetched", kind);
        }
        // one cheap listing per video kind, nothing else from the library
        assert_eq!(fx.api.call_count("VideoLibrary.GetMovies"), 1);
        assert_eq!(fx.library().items(CatalogKind::Movie).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_movies_reconciled_and_persisted_once() {
        let mut fx = Fixture::new(LibraryScope::Video);
        fx.api.set_records(CatalogKind::Movie, movies(&[10, 11, 12]));
        fx.seed_cache().await;
        let writes_before = fx.mirror_writes();

        fx.api.set_records(CatalogKind::Movie, movies(&[11, 12, 13]));
        fx.reconnect();
        fx.sync.load_library(false).await.unwrap();

        let ids: Vec<u64> = fx.library().items(CatalogKind::Movie).iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![11, 12, 13]);
        assert_eq!(fx.api.detail_requests(CatalogKind::Movie), vec![13]);
        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fx.mirror_writes() - writes_before, 1);

        let cached = fx.cache().load().await.unwrap();
        assert_eq!(cached.mirror.len(CatalogKind::Movie), 3);
        assert_eq!(
            cached.fingerprints.get(CatalogKind::Movie).unwrap().ids().collect::<Vec<_>>(),
            vec![11, 12, 13]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_differences_leave_library_outdated() {
        let mut fx = Fixture::with_settings(
            LibraryScope::Video,
            SyncConfig { reconcile_threshold: 2, ..SyncConfig::default() },
        );
        fx.api.set_records(CatalogKind::Movie, movies(&[1, 2]));
        fx.seed_cache().await;

        fx.api.set_records(CatalogKind::Movie, movies(&[3, 4, 5, 6]));
        fx.reconnect();
        fx.sync.load_library(false).await.unwrap();

        assert_eq!(fx.state(), ConnectionState::OutdatedLibrary);
        // untouched: no partial application above the threshold
        let ids: Vec<u64> = fx.library().items(CatalogKind::Movie).iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(fx.api.detail_requests(CatalogKind::Movie).is_empty());

        // a forced reload converges
        fx.sync.load_library(true).await.unwrap();
        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);
        assert_eq!(fx.library().items(CatalogKind::Movie).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reload_when_outdated() {
        let mut fx = Fixture::with_settings(
            LibraryScope::Video,
            SyncConfig { reconcile_threshold: 1, auto_reload_outdated: true, ..SyncConfig::default() },
        );
        fx.api.set_records(CatalogKind::Movie, movies(&[1]));
        fx.seed_cache().await;

        fx.api.set_records(CatalogKind::Movie, movies(&[2, 3, 4]));
        fx.reconnect();
        fx.sync.load_library(false).await.unwrap();

        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);
        assert_eq!(fx.library().items(CatalogKind::Movie).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_audio_timestamps_skip_refetch() {
        let mut fx = Fixture::new(LibraryScope::Audio);
        fx.api.set_records(CatalogKind::Song, vec![testing::record(CatalogKind::Song, 1)]);
        fx.api.set_property("songsmodified", "2024-01-01 10:00:00");
        fx.seed_cache().await;

        fx.reconnect();
        fx.sync.load_library(false).await.unwrap();
        assert_eq!(fx.api.call_count("AudioLibrary.GetSongs"), 0);
        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);

        fx.api.set_records(
            CatalogKind::Song,
            vec![testing::record(CatalogKind::Song, 1), testing::record(CatalogKind::Song, 2)],
        );
        fx.api.set_property("songsmodified", "2024-01-02 09:00:00");
        fx.reconnect();
        fx.sync.load_library(false).await.unwrap();

        assert_eq!(fx.api.call_count("AudioLibrary.GetSongs"), 1);
        assert_eq!(fx.library().items(CatalogKind::Song).len(), 2);
        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_change_fetches_new_kinds_and_drops_old() {
        let fx = Fixture::new(LibraryScope::Video);
        fx.api.set_records(CatalogKind::Movie, movies(&[1]));
        fx.api.set_records(CatalogKind::Album, vec![testing::record(CatalogKind::Album, 4)]);
        fx.seed_cache().await;

        let fx = fx.with_scope(LibraryScope::Audio);
        fx.sync.load_library(false).await.unwrap();

        assert!(fx.library().items(CatalogKind::Movie).is_empty());
        assert!(!fx.library().with_mirror(|m| m.has_kind(CatalogKind::Movie)));
        assert_eq!(fx.library().items(CatalogKind::Album).len(), 1);
        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_cache_means_full_load() {
        let fx = Fixture::new(LibraryScope::Video);
        fx.api.set_records(CatalogKind::Movie, movies(&[1, 2]));
        fx.store.set(&fx.cache().mirror_key(), b"\x00garbage").await.unwrap();

        fx.sync.load_library(false).await.unwrap();

        assert_eq!(fx.library().items(CatalogKind::Movie).len(), 2);
        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_aborts_load() {
        let fx = Fixture::new(LibraryScope::Video);
        fx.api.fail("VideoLibrary.GetMovies", RemoteError::Transport("timed out".into()));

        let result = fx.sync.load_library(false).await;

        assert!(matches!(result, Err(RemoteError::Transport(_))));
        assert!(fx.library().with_mirror(|m| m.kinds().next().is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_fingerprint_is_not_reported_loaded() {
        let mut fx = Fixture::new(LibraryScope::Video);
        fx.api.set_records(CatalogKind::Movie, movies(&[1]));
        fx.seed_cache().await;

        fx.api.respond("VideoLibrary.GetMovies", json!({ "movies": "nope" }));
        fx.reconnect();
        fx.sync.load_library(false).await.unwrap();

        assert_eq!(fx.state(), ConnectionState::OutdatedLibrary);
        assert_eq!(fx.library().items(CatalogKind::Movie).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_list_is_not_reported_loaded() {
        let fx = Fixture::new(LibraryScope::Video);
        fx.api.respond("VideoLibrary.GetMovies", json!({ "movies": "nope" }));

        fx.sync.load_library(false).await.unwrap();

        assert_eq!(fx.state(), ConnectionState::OutdatedLibrary);
        assert!(!fx.library().with_mirror(|m| m.has_kind(CatalogKind::Movie)));
        assert!(fx.library().fingerprint(CatalogKind::Movie).is_none());

        // once the host answers properly a forced reload converges
        fx.api.clear_override("VideoLibrary.GetMovies");
        fx.api.set_records(CatalogKind::Movie, movies(&[1, 2]));
        fx.sync.load_library(true).await.unwrap();
        assert_eq!(fx.state(), ConnectionState::LoadedLibrary);
        assert_eq!(fx.library().items(CatalogKind::Movie).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_reload_keeps_kind_that_fails_to_decode() {
        let fx = Fixture::new(LibraryScope::Video);
        fx.api.set_records(CatalogKind::Movie, movies(&[1, 2]));
        fx.sync.load_library(false).await.unwrap();
        let fingerprint = fx.library().fingerprint(CatalogKind::Movie);

        fx.api.respond("VideoLibrary.GetMovies", json!({ "movies": 7 }));
        fx.sync.load_library(true).await.unwrap();

        assert_eq!(fx.state(), ConnectionState::OutdatedLibrary);
        assert_eq!(fx.library().items(CatalogKind::Movie).len(), 2);
        assert_eq!(fx.library().fingerprint(CatalogKind::Movie), fingerprint);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playlists_fetched_after_load() {
        let fx = Fixture::new(LibraryScope::None);
        fx.api.respond(
            "Files.GetDirectory",
            json!({ "files": [{ "label": "Party", "file": "special://profile/playlists/music/Party.m3u" }] }),
        );
        let mut events = fx.events.subscribe();

        fx.sync.load_library(false).await.unwrap();

        assert_eq!(fx.library().playlists().len(), 2);
        assert_eq!(events.recv().await.unwrap(), EngineEvent::PlaylistsChanged);
    }
}
