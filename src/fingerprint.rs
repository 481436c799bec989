//! Cheap summaries of a kind's remote state, and the ordered diff used to
//! reconcile two of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogItem, CatalogKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub id: u64,
    pub key: String,
}

/// `(id, natural key)` pairs sorted by id. Two fingerprints are equal exactly
/// when membership and every natural key match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    entries: Vec<FingerprintEntry>,
}

impl Fingerprint {
    /// Build from unordered pairs. A repeated id keeps its last key.
    pub fn from_entries(entries: impl IntoIterator<Item = (u64, String)>) -> Self {
        let mut by_id: BTreeMap<u64, String> = BTreeMap::new();
        for (id, key) in entries {
            by_id.insert(id, key);
        }
        Self {
            entries: by_id
                .into_iter()
                .map(|(id, key)| FingerprintEntry { id, key })
                .collect(),
        }
    }

    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a CatalogItem>) -> Self {
        Self::from_entries(
            items
                .into_iter()
                .map(|item| (item.id(), item.natural_key().to_string())),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    pub fn key_of(&self, id: u64) -> Option<&str> {
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|pos| self.entries[pos].key.as_str())
    }

    pub fn upsert(&mut self, id: u64, key: impl Into<String>) {
        let key = key.into();
        match self.entries.binary_search_by_key(&id, |e| e.id) {
            Ok(pos) => self.entries[pos].key = key,
            Err(pos) => self.entries.insert(pos, FingerprintEntry { id, key }),
        }
    }

    pub fn remove(&mut self, id: u64) {
        if let Ok(pos) = self.entries.binary_search_by_key(&id, |e| e.id) {
            self.entries.remove(pos);
        }
    }

    /// Walk both id-ordered sequences in lockstep. For sorted sequences of
    /// unique ids this yields the same edit script as a longest common
    /// subsequence diff.
    pub fn diff(&self, newer: &Fingerprint) -> FingerprintDiff {
        let mut diff = FingerprintDiff::default();
        let mut old = self.entries.iter().peekable();
        let mut new = newer.entries.iter().peekable();

        loop {
            match (old.peek(), new.peek()) {
                (Some(o), Some(n)) if o.id == n.id => {
                    if o.key != n.key {
                        diff.changed.push(o.id);
                    }
                    old.next();
                    new.next();
                }
                (Some(o), Some(n)) if o.id < n.id => {
                    diff.removed.push(o.id);
                    old.next();
                }
                (Some(_), Some(n)) => {
                    diff.inserted.push(n.id);
                    new.next();
                }
                (Some(o), None) => {
                    diff.removed.push(o.id);
                    old.next();
                }
                (None, Some(n)) => {
                    diff.inserted.push(n.id);
                    new.next();
                }
                (None, None) => break,
            }
        }

        diff
    }
}

/// Edit script between two fingerprints of the same kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintDiff {
    pub removed: Vec<u64>,
    pub inserted: Vec<u64>,
    /// Present on both sides but with a different natural key.
    pub changed: Vec<u64>,
}

impl FingerprintDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.inserted.is_empty() && self.changed.is_empty()
    }

    /// Number of differing ids.
    pub fn len(&self) -> usize {
        self.removed.len() + self.inserted.len() + self.changed.len()
    }
}

/// Library-wide modification timestamps for kinds without per-item
/// fingerprints.
pub type Timestamps = BTreeMap<String, String>;

/// The current remote state of one kind, in whichever form that kind is
/// summarized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindFingerprint {
    Items(Fingerprint),
    Timestamps(Timestamps),
}

/// Last-known per-item fingerprints of the video kinds, cached next to the
/// mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSet {
    kinds: BTreeMap<CatalogKind, Fingerprint>,
}

impl FingerprintSet {
    pub fn get(&self, kind: CatalogKind) -> Option<&Fingerprint> {
        self.kinds.get(&kind)
    }

    /// Only kinds that already have a stored fingerprint; a missing one is
    /// rebuilt from the mirror when it is next needed.
    pub fn get_mut(&mut self, kind: CatalogKind) -> Option<&mut Fingerprint> {
        self.kinds.get_mut(&kind)
    }

    pub fn set(&mut self, kind: CatalogKind, fingerprint: Fingerprint) {
        self.kinds.insert(kind, fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(entries: &[(u64, &str)]) -> Fingerprint {
        Fingerprint::from_entries(entries.iter().map(|(id, k)| (*id, k.to_string())))
    }

    #[test]
    fn test_equal_fingerprints_have_empty_diff() {
        let a = fp(&[(1, "/a"), (2, "/b")]);
        let b = fp(&[(2, "/b"), (1, "/a")]);
        assert_eq!(a, b);
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_diff_removes_and_inserts() {
        let old = fp(&[(1, "/1"), (2, "/2"), (3, "/3")]);
        let new = fp(&[(2, "/2"), (3, "/3"), (4, "/4")]);

        let diff = old.diff(&new);

        assert_eq!(diff.removed, vec![1]);
        assert_eq!(diff.inserted, vec![4]);
        assert!(diff.changed.is_empty());
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn test_diff_detects_changed_natural_key() {
        let old = fp(&[(1, "/1"), (2, "/old/2")]);
        let new = fp(&[(2, "/new/2"), (3, "/3")]);

        let diff = old.diff(&new);

        assert_eq!(diff.removed, vec![1]);
        assert_eq!(diff.inserted, vec![3]);
        assert_eq!(diff.changed, vec![2]);
    }

    #[test]
    fn test_diff_against_empty() {
        let new = fp(&[(5, "/5"), (6, "/6")]);
        let diff = Fingerprint::default().diff(&new);
        assert_eq!(diff.inserted, vec![5, 6]);

        let diff = new.diff(&Fingerprint::default());
        assert_eq!(diff.removed, vec![5, 6]);
    }

    #[test]
    fn test_upsert_and_remove_keep_order() {
        let mut f = fp(&[(1, "/1"), (5, "/5")]);
        f.upsert(3, "/3");
        f.upsert(5, "/five");
        f.remove(1);

        assert_eq!(f.ids().collect::<Vec<_>>(), vec![3, 5]);
        assert_eq!(f.key_of(5), Some("/five"));
        assert_eq!(f.key_of(1), None);
    }
}
