//! Persisted user state: unlocked stories, auxiliary records, the trigger
//! blacklist and settings.
//!
//! Each store wraps a [`PersistedCell`]: an in-memory value, a ready flag and
//! a storage key. The cell loads once, merges what was persisted into
//! whatever is already in memory, then becomes ready. Writes are suppressed
//! until then so an empty default can never replace a saved value.

use crate::merge::{merge_fields, Merge, MergePolicy, Versioned};
use crate::persist::{keys, read_json, write_json, KeyValueStore};
use crate::story::StoryId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Unlocked story ids.
pub type UnlockedSet = BTreeSet<StoryId>;

/// Per-story auxiliary records.
pub type AuxiliaryMap = BTreeMap<StoryId, AuxiliaryRecord>;

/// Blacklisted trigger tag names.
pub type BlacklistSet = BTreeSet<String>;

/// Small per-story metadata kept beside the story itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuxiliaryRecord {
    /// Milliseconds since the Unix epoch of the most recent unlock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_time: Option<i64>,
}

impl Versioned for AuxiliaryRecord {
    fn version(&self) -> Option<i64> {
        self.unlock_time
    }
}

/// User settings.
///
/// Decoded key by key: a known option with the wrong type falls back to its
/// default without discarding the rest of the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SettingsObject", rename_all = "camelCase")]
pub struct Settings {
    /// Periodically re-fetch the catalog.
    pub auto_refresh: bool,
    /// Options this version does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            extra: serde_json::Map::new(),
        }
    }
}

type SettingsObject = serde_json::Map<String, serde_json::Value>;

impl From<SettingsObject> for Settings {
    fn from(mut object: SettingsObject) -> Self {
        let mut settings = Settings::default();
        match object.remove("autoRefresh") {
            Some(serde_json::Value::Bool(enabled)) => settings.auto_refresh = enabled,
            Some(other) => {
                warn!(value = %other, "Ignoring autoRefresh setting that is not a boolean")
            }
            None => {}
        }
        settings.extra = object;
        settings
    }
}

impl Merge for Settings {
    fn merge(&mut self, persisted: Self, policy: MergePolicy) {
        let (Some(mut current), Some(persisted), Some(defaults)) = (
            to_object(&*self),
            to_object(&persisted),
            to_object(&Settings::default()),
        ) else {
            return;
        };

        merge_fields(&mut current, persisted, &defaults, policy);
        match serde_json::from_value(serde_json::Value::Object(current)) {
            Ok(merged) => *self = merged,
            Err(e) => warn!(error = %e, "Failed to merge persisted settings"),
        }
    }
}

fn to_object<T: Serialize>(value: &T) -> Option<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

// ============================================================================
// Persisted cell
// ============================================================================

/// A value mirrored to durable storage under one key.
pub struct PersistedCell<T> {
    key: &'static str,
    policy: MergePolicy,
    store: Arc<dyn KeyValueStore>,
    value: watch::Sender<T>,
    ready: watch::Sender<bool>,
    write_lock: Mutex<()>,
}

impl<T> PersistedCell<T>
where
    T: Clone + PartialEq + Merge + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(
        key: &'static str,
        initial: T,
        policy: MergePolicy,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            key,
            policy,
            store,
            value: watch::Sender::new(initial),
            ready: watch::Sender::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.value.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Wait until the initial load has completed.
    pub async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives in `self`, so this can only fail after drop.
        let _ = ready.wait_for(|r| *r).await;
    }

    /// Read the persisted value, merge it into memory and become ready.
    ///
    /// If storage cannot be read the cell stays not-ready, so nothing it holds
    /// can overwrite the value that failed to load.
    pub async fn load(&self) {
        let persisted = match read_json::<T>(self.store.as_ref(), self.key).await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(key = self.key, error = %e, "Failed to load persisted value");
                return;
            }
        };

        if let Some(persisted) = persisted {
            let policy = self.policy;
            self.value.send_modify(|current| current.merge(persisted, policy));
        }
        self.ready.send_replace(true);
        debug!(key = self.key, "Store ready");

        self.flush().await;
    }

    /// Apply `f` to the value, persisting it if `f` reports a change.
    ///
    /// Returns whether the value changed.
    pub async fn update(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        let changed = self.value.send_if_modified(f);
        if changed {
            self.flush().await;
        }
        changed
    }

    /// Replace the value outright.
    pub async fn set(&self, value: T) -> bool {
        self.update(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
        .await
    }

    /// Write the latest value to storage. A no-op until ready.
    ///
    /// Writes are serialized and each one snapshots the value only after
    /// acquiring the lock, so a slow earlier write can never land last with
    /// stale data.
    pub async fn flush(&self) {
        let _guard = self.write_lock.lock().await;
        if !self.is_ready() {
            return;
        }

        let snapshot = self.get();
        if let Err(e) = write_json(self.store.as_ref(), self.key, &snapshot).await {
            warn!(key = self.key, error = %e, "Failed to persist value");
        }
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Unlocked stories and their auxiliary records.
pub struct UnlockStore {
    unlocked: PersistedCell<UnlockedSet>,
    auxiliary: PersistedCell<AuxiliaryMap>,
}

impl UnlockStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            unlocked: PersistedCell::new(
                keys::UNLOCKED_SET,
                UnlockedSet::new(),
                MergePolicy::Union,
                store.clone(),
            ),
            auxiliary: PersistedCell::new(
                keys::AUXILIARY_MAP,
                AuxiliaryMap::new(),
                MergePolicy::LastWriteWins,
                store,
            ),
        }
    }

    pub fn unlocked(&self) -> &PersistedCell<UnlockedSet> {
        &self.unlocked
    }

    pub fn auxiliary(&self) -> &PersistedCell<AuxiliaryMap> {
        &self.auxiliary
    }

    pub fn is_unlocked(&self, id: &str) -> bool {
        self.unlocked.value.borrow().contains(id)
    }

    /// Load both halves concurrently.
    pub async fn load(&self) {
        tokio::join!(self.unlocked.load(), self.auxiliary.load());
    }

    /// Stamp the story's auxiliary record with the current time and unlock it.
    pub async fn unlock(&self, id: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        self.auxiliary
            .update(|map| {
                map.entry(id.to_string()).or_default().unlock_time = Some(now);
                true
            })
            .await;
        self.unlocked
            .update(|set| set.insert(id.to_string()))
            .await;
        debug!(story = %id, "Unlocked story");
    }

    /// Lock the story again. Its auxiliary record is kept.
    pub async fn lock(&self, id: &str) {
        if self.unlocked.update(|set| set.remove(id)).await {
            debug!(story = %id, "Locked story");
        }
    }

    /// Lock every story. Auxiliary records are kept.
    pub async fn clear(&self) {
        self.unlocked
            .update(|set| {
                let changed = !set.is_empty();
                set.clear();
                changed
            })
            .await;
        debug!("Cleared all unlocks");
    }
}

/// Trigger tags the user has chosen to hide.
pub struct BlacklistStore {
    tags: PersistedCell<BlacklistSet>,
}

impl BlacklistStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            tags: PersistedCell::new(
                keys::BLACKLIST,
                BlacklistSet::new(),
                MergePolicy::Union,
                store,
            ),
        }
    }

    pub fn cell(&self) -> &PersistedCell<BlacklistSet> {
        &self.tags
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.value.borrow().contains(tag)
    }

    pub async fn load(&self) {
        self.tags.load().await;
    }

    /// Set whether `tag` is blacklisted. Returns whether anything changed.
    pub async fn set_blocked(&self, tag: &str, blocked: bool) -> bool {
        self.tags
            .update(|set| {
                if blocked {
                    set.insert(tag.to_string())
                } else {
                    set.remove(tag)
                }
            })
            .await
    }

    /// Flip `tag` against the current value. Returns the new membership.
    pub async fn toggle(&self, tag: &str) -> bool {
        let mut blocked = false;
        self.tags
            .update(|set| {
                blocked = if set.remove(tag) {
                    false
                } else {
                    set.insert(tag.to_string())
                };
                true
            })
            .await;
        blocked
    }
}

/// User settings, with defaults for anything never saved.
pub struct SettingsStore {
    settings: PersistedCell<Settings>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            settings: PersistedCell::new(
                keys::SETTINGS,
                Settings::default(),
                MergePolicy::Union,
                store,
            ),
        }
    }

    pub fn cell(&self) -> &PersistedCell<Settings> {
        &self.settings
    }

    pub fn get(&self) -> Settings {
        self.settings.get()
    }

    pub async fn load(&self) {
        self.settings.load().await;
    }

    pub async fn set(&self, settings: Settings) -> bool {
        self.settings.set(settings).await
    }

    pub async fn update(&self, f: impl FnOnce(&mut Settings)) -> bool {
        self.settings
            .update(|settings| {
                let before = settings.clone();
                f(settings);
                *settings != before
            })
            .await
    }
}
