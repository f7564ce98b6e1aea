//! Merge functions for reconciling persisted values with in-memory state.
//!
//! A store may be mutated before its persisted value has been read. When the
//! read completes the two are combined with [`Merge::merge`] under a
//! [`MergePolicy`] instead of the persisted value simply replacing what is in
//! memory.

use std::collections::{BTreeMap, BTreeSet};

/// How to combine an in-memory value with one loaded from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Keep entries from both sides; on a key conflict the in-memory entry wins.
    Union,
    /// Keep entries from both sides; on a key conflict the newer entry wins.
    LastWriteWins,
    /// The persisted value replaces the in-memory value.
    Overwrite,
}

/// Values that can absorb a persisted counterpart.
pub trait Merge {
    fn merge(&mut self, persisted: Self, policy: MergePolicy);
}

/// Entries that carry a write version for last-write-wins resolution.
///
/// `None` sorts before every `Some`.
pub trait Versioned {
    fn version(&self) -> Option<i64>;
}

impl<T: Ord> Merge for BTreeSet<T> {
    fn merge(&mut self, persisted: Self, policy: MergePolicy) {
        match policy {
            MergePolicy::Union | MergePolicy::LastWriteWins => self.extend(persisted),
            MergePolicy::Overwrite => *self = persisted,
        }
    }
}

impl<K: Ord, V: Versioned> Merge for BTreeMap<K, V> {
    fn merge(&mut self, persisted: Self, policy: MergePolicy) {
        match policy {
            MergePolicy::Overwrite => *self = persisted,
            MergePolicy::Union => {
                for (key, value) in persisted {
                    self.entry(key).or_insert(value);
                }
            }
            MergePolicy::LastWriteWins => {
                for (key, value) in persisted {
                    match self.get(&key) {
                        Some(current) if current.version() >= value.version() => {}
                        _ => {
                            self.insert(key, value);
                        }
                    }
                }
            }
        }
    }
}

/// Lay the fields of `persisted` over `current`, field by field.
///
/// With `Overwrite` every persisted field wins. Otherwise a persisted field
/// only replaces a field that still holds its default, so a change made
/// before the load survives it. Keys missing from `persisted` are untouched.
pub fn merge_fields(
    current: &mut serde_json::Map<String, serde_json::Value>,
    persisted: serde_json::Map<String, serde_json::Value>,
    defaults: &serde_json::Map<String, serde_json::Value>,
    policy: MergePolicy,
) {
    for (key, value) in persisted {
        let untouched = match (current.get(&key), defaults.get(&key)) {
            (None, _) => true,
            (Some(cur), Some(default)) => cur == default,
            (Some(_), None) => false,
        };
        if policy == MergePolicy::Overwrite || untouched {
            current.insert(key, value);
        }
    }
}
