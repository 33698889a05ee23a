//! Last-writer-wins map keyed by cluster address.
//!
//! Each node only ever writes its own key, so merging two maps is a per-key
//! comparison and never needs cross-key conflict resolution. Semantic conflicts
//! between keys (two nodes claiming one group) are the coordinator's concern.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::{AckUpdate, ClaimTable, ClusterAddress};

/// A value together with the version that orders it. `None` is a tombstone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Option<AckUpdate>,
}

impl Versioned {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Total order used by merge: higher version, then tombstone, then greater value.
    pub fn supersedes(&self, other: &Versioned) -> bool {
        (self.version, self.is_tombstone(), &self.value)
            > (other.version, other.is_tombstone(), &other.value)
    }
}

#[derive(Debug, Default)]
pub struct LwwMap {
    entries: DashMap<ClusterAddress, Versioned>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `value` under `key` with a version newer than anything seen for it.
    pub fn put(&self, key: ClusterAddress, value: AckUpdate) -> Versioned {
        let now = now_ms();

        match self.entries.entry(key) {
            Entry::Occupied(mut existing) => {
                let version = now.max(existing.get().version + 1);
                let entry = Versioned {
                    version,
                    value: Some(value),
                };
                existing.insert(entry.clone());
                entry
            }
            Entry::Vacant(vacant) => {
                let entry = Versioned {
                    version: now,
                    value: Some(value),
                };
                vacant.insert(entry.clone());
                entry
            }
        }
    }

    /// Tombstones `key`. Returns `None` if the key is unknown or already removed.
    pub fn remove(&self, key: &ClusterAddress) -> Option<Versioned> {
        let mut existing = self.entries.get_mut(key)?;
        if existing.is_tombstone() {
            return None;
        }

        let tombstone = Versioned {
            version: existing.version + 1,
            value: None,
        };
        *existing = tombstone.clone();
        Some(tombstone)
    }

    /// Merges one remote entry. Returns `true` if the local state changed.
    pub fn merge_entry(&self, key: ClusterAddress, incoming: Versioned) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut existing) => {
                if incoming.supersedes(existing.get()) {
                    existing.insert(incoming);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(incoming);
                true
            }
        }
    }

    /// Merges a batch of remote entries and returns the keys that changed.
    pub fn merge_all(
        &self,
        entries: impl IntoIterator<Item = (ClusterAddress, Versioned)>,
    ) -> Vec<ClusterAddress> {
        entries
            .into_iter()
            .filter_map(|(key, incoming)| {
                let changed = self.merge_entry(key.clone(), incoming);
                changed.then_some(key)
            })
            .collect()
    }

    /// Drops tombstones whose version is below `cutoff` and returns their keys.
    ///
    /// Live entries are never dropped here; only the membership monitor removes
    /// a key.
    pub fn purge_tombstones(&self, cutoff: u64) -> Vec<ClusterAddress> {
        let mut purged = Vec::new();
        self.entries.retain(|key, entry| {
            let expired = entry.is_tombstone() && entry.version < cutoff;
            if expired {
                purged.push(key.clone());
            }
            !expired
        });
        purged
    }

    pub fn get(&self, key: &ClusterAddress) -> Option<Versioned> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Every entry including tombstones, for gossip.
    pub fn snapshot(&self) -> Vec<(ClusterAddress, Versioned)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Live entries only, ordered by address.
    pub fn table(&self) -> ClaimTable {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .value
                    .clone()
                    .map(|update| (entry.key().clone(), update))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
