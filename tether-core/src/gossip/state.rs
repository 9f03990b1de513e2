use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Advertised high-water version for one node's key/value state.
///
/// Peers exchange digests so each side can work out which updates the other
/// is missing without shipping the full state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    /// Node whose state the version describes.
    pub node: String,
    /// Highest version the sender holds for that node.
    pub version: u64,
}

/// Single key update for one node's state. `value: None` is a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Node the key belongs to.
    pub node: String,
    /// Updated key.
    pub key: String,
    /// New value, or `None` when the key was deleted.
    pub value: Option<String>,
    /// Version the write was made at on the owning node.
    pub version: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    version: u64,
}

/// Versioned key/value state for a single node.
///
/// Every write is stamped with a monotonically increasing version; deletions
/// leave tombstones so they propagate like any other write. Replicas apply
/// updates with latest-wins semantics, which makes delivery order and
/// duplication irrelevant per key.
#[derive(Debug, Clone, Default)]
pub struct KeyState {
    entries: HashMap<String, Entry>,
    version: u64,
}

impl KeyState {
    /// Creates empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest version written or applied so far.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Current value for `key`, if live.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|entry| entry.value.as_deref())
    }

    /// Records a local write and returns the version assigned to it.
    pub fn upsert(&mut self, key: &str, value: &str) -> u64 {
        self.version += 1;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Some(value.to_string()),
                version: self.version,
            },
        );
        self.version
    }

    /// Records a local deletion as a tombstone and returns its version.
    pub fn delete(&mut self, key: &str) -> u64 {
        self.version += 1;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: None,
                version: self.version,
            },
        );
        self.version
    }

    /// Applies a replicated update. Returns `true` when the update was newer
    /// than the entry held locally and took effect; stale and duplicate
    /// deliveries return `false`.
    pub fn apply(&mut self, key: &str, value: Option<String>, version: u64) -> bool {
        let applied = match self.entries.get(key) {
            Some(entry) if entry.version >= version => false,
            _ => {
                self.entries.insert(key.to_string(), Entry { value, version });
                true
            }
        };
        self.version = self.version.max(version);
        applied
    }

    /// Updates (including tombstones) written after `since`, oldest first,
    /// capped at `limit`.
    #[must_use]
    pub fn updates_since(&self, since: u64, limit: usize) -> Vec<(String, Option<String>, u64)> {
        let mut updates: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.version > since)
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.version))
            .collect();
        updates.sort_unstable_by_key(|(_, _, version)| *version);
        updates.truncate(limit);
        updates
    }
}
