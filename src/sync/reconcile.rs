//! Per-kind diff reconciliation and the targeted mutations driven by
//! notifications.

use std::collections::BTreeSet;

use futures_util::future::join_all;

use super::LibrarySynchronizer;
use crate::api::fetch;
use crate::catalog::{CatalogItem, CatalogKind};
use crate::error::RemoteError;
use crate::events::EngineEvent;
use crate::fingerprint::Fingerprint;
use crate::mirror::Upsert;

/// How far one kind got towards the host's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindOutcome {
    Reconciled,
    /// Differing ids above the threshold; nothing was applied.
    TooLarge(usize),
    /// Applied, except for these ids whose details could not be fetched.
    Unresolved(Vec<u64>),
}

impl LibrarySynchronizer {
    /// Move one video kind from its stored fingerprint to `remote`.
    ///
    /// Removals are applied before anything is fetched. Inserted and changed
    /// ids are then fetched concurrently and applied under one write. Parents
    /// referenced by applied children are collected into `parents` for the
    /// caller to refresh.
    pub(crate) async fn reconcile_kind(
        &self,
        kind: CatalogKind,
        remote: &Fingerprint,
        parents: &mut BTreeSet<(CatalogKind, u64)>,
    ) -> Result<KindOutcome, RemoteError> {
        let mut fingerprint = self.stored_fingerprint(kind);
        let diff = fingerprint.diff(remote);

        if diff.is_empty() {
            return Ok(KindOutcome::Reconciled);
        }
        if diff.len() > self.settings.reconcile_threshold {
            return Ok(KindOutcome::TooLarge(diff.len()));
        }

        tracing::info!(
            "Reconciling {}: {} removed, {} inserted, {} changed",
            kind,
            diff.removed.len(),
            diff.inserted.len(),
            diff.changed.len()
        );

        if !diff.removed.is_empty() {
            for id in &diff.removed {
                fingerprint.remove(*id);
            }
            let removed = self.library.write(|mirror, fingerprints| {
                let mut removed = Vec::new();
                for id in &diff.removed {
                    removed.extend(mirror.remove(kind, *id));
                }
                fingerprints.set(kind, fingerprint.clone());
                for (child, id) in removed.iter().filter(|(k, _)| *k != kind) {
                    if let Some(child_fingerprint) = fingerprints.get_mut(*child) {
                        child_fingerprint.remove(*id);
                    }
                }
                removed
            });
            self.emit_changed(removed.iter().map(|(k, _)| *k));
        }

        let wanted: Vec<u64> = diff.inserted.iter().chain(&diff.changed).copied().collect();
        if wanted.is_empty() {
            return Ok(KindOutcome::Reconciled);
        }

        let (items, unresolved) = self.fetch_many(kind, &wanted).await?;

        self.library.write(|mirror, fingerprints| {
            for item in items {
                let id = item.id();
                let key = remote
                    .key_of(id)
                    .map(str::to_string)
                    .unwrap_or_else(|| item.natural_key().to_string());
                let parent = item.parent_id();

                match mirror.upsert(item) {
                    Upsert::Replaced { previous_parent } if previous_parent != parent => {
                        if let Some(parent_kind) = kind.parent() {
                            parents.extend(previous_parent.map(|p| (parent_kind, p)));
                            parents.extend(parent.map(|p| (parent_kind, p)));
                        }
                    }
                    Upsert::Inserted => {
                        if let (Some(parent_kind), Some(p)) = (kind.parent(), parent) {
                            if !mirror.contains(parent_kind, p) {
                                parents.insert((parent_kind, p));
                            }
                        }
                    }
                    Upsert::Replaced { .. } => {}
                }
                fingerprint.upsert(id, key);
            }
            fingerprints.set(kind, fingerprint);
        });
        self.library.emit(EngineEvent::LibraryChanged(kind));

        if unresolved.is_empty() {
            Ok(KindOutcome::Reconciled)
        } else {
            Ok(KindOutcome::Unresolved(unresolved))
        }
    }

    /// Fetch details for `ids` concurrently. Ids that come back empty get one
    /// more individual attempt; those still missing are returned separately.
    async fn fetch_many(
        &self,
        kind: CatalogKind,
        ids: &[u64],
    ) -> Result<(Vec<CatalogItem>, Vec<u64>), RemoteError> {
        let results = join_all(ids.iter().map(|id| fetch::fetch_details(self.api(), kind, *id))).await;

        let mut items = Vec::with_capacity(ids.len());
        let mut retry = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            match result? {
                Some(item) => items.push(item),
                None => retry.push(*id),
            }
        }

        let mut unresolved = Vec::new();
        for id in retry {
            match fetch::fetch_details(self.api(), kind, id).await? {
                Some(item) => items.push(item),
                None => unresolved.push(id),
            }
        }
        Ok((items, unresolved))
    }

    /// Re-read parent records whose children moved, appeared or changed.
    pub(crate) async fn refresh_parents(
        &self,
        parents: BTreeSet<(CatalogKind, u64)>,
    ) -> Result<(), RemoteError> {
        let mut changed = BTreeSet::new();
        for (kind, id) in parents {
            let Some(item) = fetch::fetch_details(self.api(), kind, id).await? else {
                tracing::debug!("Parent {} {} not available on host", kind, id);
                continue;
            };
            self.library.write(|mirror, fingerprints| {
                if let Some(fingerprint) = fingerprints.get_mut(kind) {
                    fingerprint.upsert(id, item.natural_key());
                }
                mirror.upsert(item);
            });
            changed.insert(kind);
        }
        self.emit_changed(changed);
        Ok(())
    }

    fn emit_changed(&self, kinds: impl IntoIterator<Item = CatalogKind>) {
        let kinds: BTreeSet<CatalogKind> = kinds.into_iter().collect();
        for kind in kinds {
            self.library.emit(EngineEvent::LibraryChanged(kind));
        }
    }

    /// Delete one record (and its dependents) after the host reported it
    /// removed. Returns whether anything left the mirror.
    pub async fn remove_item(&self, kind: CatalogKind, id: u64) -> bool {
        let _slot = self.library.acquire().await;

        let removed = self.library.write(|mirror, fingerprints| {
            let removed = mirror.remove(kind, id);
            for (k, i) in &removed {
                if let Some(fingerprint) = fingerprints.get_mut(*k) {
                    fingerprint.remove(*i);
                }
            }
            removed
        });

        if removed.is_empty() {
            tracing::debug!("Removed {} {} was not mirrored", kind, id);
            return false;
        }
        tracing::debug!("Removed {} {} ({} records)", kind, id, removed.len());
        self.emit_changed(removed.iter().map(|(k, _)| *k));
        self.library.request_save();
        true
    }

    /// Fetch one record and upsert it, then re-read its parent.
    pub async fn refresh_item(&self, kind: CatalogKind, id: u64) -> Result<bool, RemoteError> {
        let _slot = self.library.acquire().await;

        let Some(item) = fetch::fetch_details(self.api(), kind, id).await? else {
            tracing::debug!("{} {} vanished before it could be refreshed", kind, id);
            return Ok(false);
        };
        let parent = item.parent_id();
        let key = item.natural_key().to_string();

        let outcome = self.library.write(|mirror, fingerprints| {
            if let Some(fingerprint) = fingerprints.get_mut(kind) {
                fingerprint.upsert(id, key);
            }
            mirror.upsert(item)
        });
        self.library.emit(EngineEvent::LibraryChanged(kind));

        let mut parents = BTreeSet::new();
        if let Some(parent_kind) = kind.parent() {
            parents.extend(parent.map(|p| (parent_kind, p)));
            if let Upsert::Replaced { previous_parent: Some(previous) } = outcome {
                parents.insert((parent_kind, previous));
            }
        }
        self.refresh_parents(parents).await?;

        self.library.request_save();
        Ok(true)
    }
}
