//! The local copy of the host's catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogItem, CatalogKind};
use crate::fingerprint::Timestamps;

/// One ordered collection per catalog kind, plus library-wide timestamps for
/// kinds that are not fingerprinted per item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    items: BTreeMap<CatalogKind, Vec<CatalogItem>>,
    #[serde(default)]
    properties: BTreeMap<CatalogKind, Timestamps>,
}

/// Outcome of [`Mirror::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// Replaced in place; carries the parent id the old record pointed at.
    Replaced { previous_parent: Option<u64> },
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this kind has been loaded at all (an empty library still
    /// counts as loaded).
    pub fn has_kind(&self, kind: CatalogKind) -> bool {
        self.items.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = CatalogKind> + '_ {
        self.items.keys().copied()
    }

    pub fn items(&self, kind: CatalogKind) -> &[CatalogItem] {
        self.items.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, kind: CatalogKind) -> usize {
        self.items(kind).len()
    }

    pub fn total_len(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    pub fn get(&self, kind: CatalogKind, id: u64) -> Option<&CatalogItem> {
        self.items(kind).iter().find(|item| item.id() == id)
    }

    pub fn contains(&self, kind: CatalogKind, id: u64) -> bool {
        self.get(kind, id).is_some()
    }

    pub fn replace_kind(&mut self, kind: CatalogKind, items: Vec<CatalogItem>) {
        self.items.insert(kind, items);
    }

    pub fn drop_kind(&mut self, kind: CatalogKind) {
        self.items.remove(&kind);
        self.properties.remove(&kind);
    }

    /// Replace the record with the same id in place, or append it.
    pub fn upsert(&mut self, item: CatalogItem) -> Upsert {
        let items = self.items.entry(item.kind()).or_default();
        match items.iter_mut().find(|existing| existing.id() == item.id()) {
            Some(existing) => {
                let previous_parent = existing.parent_id();
                *existing = item;
                Upsert::Replaced { previous_parent }
            }
            None => {
                items.push(item);
                Upsert::Inserted
            }
        }
    }

    /// Delete one record. Shows and albums take their episodes and songs with
    /// them; movies in a deleted set are detached instead. Returns every
    /// `(kind, id)` that left the mirror.
    pub fn remove(&mut self, kind: CatalogKind, id: u64) -> Vec<(CatalogKind, u64)> {
        let mut removed = Vec::new();

        if let Some(items) = self.items.get_mut(&kind) {
            let before = items.len();
            items.retain(|item| item.id() != id);
            if items.len() == before {
                return removed;
            }
            removed.push((kind, id));
        } else {
            return removed;
        }

        for child in kind.children() {
            let Some(items) = self.items.get_mut(child) else {
                continue;
            };
            if kind.cascades_delete() {
                items.retain(|item| {
                    if item.parent_id() == Some(id) {
                        removed.push((*child, item.id()));
                        false
                    } else {
                        true
                    }
                });
            } else {
                for item in items.iter_mut().filter(|item| item.parent_id() == Some(id)) {
                    item.detach_parent();
                }
            }
        }

        removed
    }

    pub fn properties(&self, kind: CatalogKind) -> Option<&Timestamps> {
        self.properties.get(&kind)
    }

    pub fn set_properties(&mut self, kind: CatalogKind, timestamps: Timestamps) {
        self.properties.insert(kind, timestamps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(kind: CatalogKind, value: serde_json::Value) -> CatalogItem {
        CatalogItem::from_value(kind, value).unwrap()
    }

    fn show(id: u64) -> CatalogItem {
        item(CatalogKind::TvShow, json!({ "tvshowid": id, "file": format!("/tv/{}/", id) }))
    }

    fn episode(id: u64, show: u64) -> CatalogItem {
        item(
            CatalogKind::Episode,
            json!({ "episodeid": id, "tvshowid": show, "file": format!("/tv/{}/{}.mkv", show, id) }),
        )
    }

    #[test]
    fn test_removing_show_cascades_to_episodes() {
        let mut mirror = Mirror::new();
        mirror.replace_kind(CatalogKind::TvShow, vec![show(1), show(2)]);
        mirror.replace_kind(
            CatalogKind::Episode,
            vec![episode(10, 1), episode(11, 1), episode(20, 2)],
        );

        let removed = mirror.remove(CatalogKind::TvShow, 1);

        assert_eq!(
            removed,
            vec![
                (CatalogKind::TvShow, 1),
                (CatalogKind::Episode, 10),
                (CatalogKind::Episode, 11)
            ]
        );
        assert_eq!(mirror.len(CatalogKind::TvShow), 1);
        assert_eq!(mirror.len(CatalogKind::Episode), 1);
        assert!(mirror.contains(CatalogKind::Episode, 20));
    }

    #[test]
    fn test_removing_set_detaches_movies() {
        let mut mirror = Mirror::new();
        mirror.replace_kind(
            CatalogKind::MovieSet,
            vec![item(CatalogKind::MovieSet, json!({ "setid": 4, "title": "Trilogy" }))],
        );
        mirror.replace_kind(
            CatalogKind::Movie,
            vec![item(CatalogKind::Movie, json!({ "movieid": 1, "setid": 4, "file": "/m/1.mkv" }))],
        );

        let removed = mirror.remove(CatalogKind::MovieSet, 4);

        assert_eq!(removed, vec![(CatalogKind::MovieSet, 4)]);
        let movie = mirror.get(CatalogKind::Movie, 1).unwrap();
        assert_eq!(movie.parent_id(), None);
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let mut mirror = Mirror::new();
        mirror.replace_kind(CatalogKind::TvShow, vec![show(1)]);
        assert!(mirror.remove(CatalogKind::TvShow, 99).is_empty());
        assert!(mirror.remove(CatalogKind::Song, 1).is_empty());
        assert_eq!(mirror.len(CatalogKind::TvShow), 1);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut mirror = Mirror::new();
        mirror.replace_kind(CatalogKind::Episode, vec![episode(1, 1), episode(2, 1)]);

        let result = mirror.upsert(episode(1, 5));
        assert_eq!(result, Upsert::Replaced { previous_parent: Some(1) });
        assert_eq!(mirror.items(CatalogKind::Episode)[0].parent_id(), Some(5));

        assert_eq!(mirror.upsert(episode(3, 1)), Upsert::Inserted);
        let ids: Vec<u64> = mirror.items(CatalogKind::Episode).iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_kind_counts_as_loaded() {
        let mut mirror = Mirror::new();
        assert!(!mirror.has_kind(CatalogKind::Genre));
        mirror.replace_kind(CatalogKind::Genre, Vec::new());
        assert!(mirror.has_kind(CatalogKind::Genre));
        mirror.drop_kind(CatalogKind::Genre);
        assert!(!mirror.has_kind(CatalogKind::Genre));
    }

    #[test]
    fn test_mirror_serializes_for_cache() {
        let mut mirror = Mirror::new();
        mirror.replace_kind(CatalogKind::TvShow, vec![show(1)]);
        let mut stamps = Timestamps::new();
        stamps.insert("songsmodified".into(), "2024-01-01 10:00:00".into());
        mirror.set_properties(CatalogKind::Song, stamps);

        let bytes = serde_json::to_vec(&mirror).unwrap();
        let restored: Mirror = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(restored, mirror);
    }
}
