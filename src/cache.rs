use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Duration, Instant};

use crate::error::FetchError;
use crate::key::{KeyFilter, ResourceKey};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::registry::{Callback, Registration, SubscriberRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Idle => "idle",
            FetchStatus::Loading => "loading",
            FetchStatus::Success => "success",
            FetchStatus::Error => "error",
        }
    }
}

/// Last known state of one remote resource.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: ResourceKey,
    pub value: Option<Value>,
    pub status: FetchStatus,
    pub error: Option<FetchError>,
    /// Time of the last successful value write.
    pub updated_at: Option<Instant>,
    pub stale_after: Duration,
    invalidated: bool,
    /// Epoch of the fetch whose result this entry will accept.
    pending_epoch: Option<u64>,
    /// Cache-wide write counter at the time of this snapshot.
    version: u64,
}

impl CacheEntry {
    pub fn idle(key: ResourceKey) -> Self {
        Self {
            key,
            value: None,
            status: FetchStatus::Idle,
            error: None,
            updated_at: None,
            stale_after: Duration::ZERO,
            invalidated: false,
            pending_epoch: None,
            version: 0,
        }
    }

    /// An entry is stale once invalidated, when it never received a value, or
    /// when its value is older than `stale_after`.
    pub fn is_stale(&self) -> bool {
        if self.invalidated {
            return true;
        }
        match self.updated_at {
            Some(at) => at.elapsed() >= self.stale_after,
            None => true,
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn is_loading(&self) -> bool {
        self.status == FetchStatus::Loading
    }

    pub(crate) fn pending_epoch(&self) -> Option<u64> {
        self.pending_epoch
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    /// Decode the cached value into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<Result<T, FetchError>> {
        self.value
            .as_ref()
            .map(|v| serde_json::from_value(v.clone()).map_err(FetchError::from))
    }

    fn settle_status(&mut self) {
        self.status = if self.error.is_some() {
            FetchStatus::Error
        } else if self.value.is_some() {
            FetchStatus::Success
        } else {
            FetchStatus::Idle
        };
    }
}

/// Partial update applied by [`ResourceCache::set`].
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    value: Option<Value>,
    status: Option<FetchStatus>,
    error: Option<Option<FetchError>>,
    stale_after: Option<Duration>,
}

impl EntryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn status(mut self, status: FetchStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error(mut self, error: FetchError) -> Self {
        self.error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    fn apply(self, entry: &mut CacheEntry) {
        if let Some(value) = self.value {
            entry.value = Some(value);
            entry.updated_at = Some(Instant::now());
            entry.invalidated = false;
        }
        if let Some(status) = self.status {
            entry.status = status;
        }
        if let Some(error) = self.error {
            entry.error = error;
        }
        if let Some(stale_after) = self.stale_after {
            entry.stale_after = stale_after;
        }
    }
}

/// The single shared store of remote resource state.
///
/// Entries are only handed out as clones; every write goes through this type
/// and is announced to the subscribers of the affected key.
#[derive(Default)]
pub struct ResourceCache {
    entries: Mutex<HashMap<ResourceKey, CacheEntry>>,
    registry: SubscriberRegistry,
    version: AtomicU64,
}

impl ResourceCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, CacheEntry>> {
        // Entries hold no invariants that a panicking writer could break
        // half-way, so a poisoned lock is still usable.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Must be called with the entries lock held, so versions follow the
    /// order of writes.
    fn stamp(&self, entry: &mut CacheEntry) {
        entry.version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
    }

    fn removed(&self, key: &ResourceKey) -> CacheEntry {
        let mut idle = CacheEntry::idle(key.clone());
        self.stamp(&mut idle);
        idle
    }

    pub fn get(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().keys().cloned().collect()
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Merge `patch` into the entry for `key`, creating it if absent.
    pub fn set(&self, key: &ResourceKey, patch: EntryPatch) -> CacheEntry {
        let snapshot = {
            let mut entries = self.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::idle(key.clone()));
            patch.apply(entry);
            self.stamp(entry);
            entry.clone()
        };
        self.registry.notify(&snapshot);
        snapshot
    }

    /// Mark every matching entry stale and drop any pending fetch result for
    /// it. Returns the affected keys.
    pub fn invalidate(&self, filter: &KeyFilter) -> Vec<ResourceKey> {
        let snapshots: Vec<CacheEntry> = {
            let mut entries = self.lock();
            entries
                .values_mut()
                .filter(|e| filter.matches(&e.key))
                .map(|e| {
                    e.invalidated = true;
                    e.pending_epoch = None;
                    self.stamp(e);
                    e.clone()
                })
                .collect()
        };
        for entry in &snapshots {
            log(Level::Debug, Domain::Cache, "invalidate", obj(&[("key", v_str(&entry.key.to_string()))]));
            self.registry.notify(entry);
        }
        snapshots.into_iter().map(|e| e.key).collect()
    }

    /// Drop every entry. Subscribers see a fresh idle entry; in-flight results
    /// find no entry to land in and are ignored.
    pub fn clear_all(&self) -> Vec<ResourceKey> {
        let removed: Vec<CacheEntry> = {
            let mut entries = self.lock();
            entries.drain().map(|(k, _)| self.removed(&k)).collect()
        };
        log(
            Level::Info,
            Domain::Cache,
            "clear_all",
            obj(&[("entries", serde_json::json!(removed.len()))]),
        );
        for idle in &removed {
            self.registry.notify(idle);
        }
        removed.into_iter().map(|e| e.key).collect()
    }

    /// Drop one entry. Subscribers see a fresh idle entry.
    pub fn remove(&self, key: &ResourceKey) -> Option<CacheEntry> {
        let (old, idle) = {
            let mut entries = self.lock();
            let old = entries.remove(key)?;
            (old, self.removed(key))
        };
        log(Level::Debug, Domain::Cache, "remove", obj(&[("key", v_str(&key.to_string()))]));
        self.registry.notify(&idle);
        Some(old)
    }

    /// Register `callback` for `key` and call it once with the current entry.
    pub fn subscribe(&self, key: &ResourceKey, callback: Arc<Callback>) -> Registration {
        let registration = self.registry.register(key.clone(), callback);
        let current = self.get(key).unwrap_or_else(|| CacheEntry::idle(key.clone()));
        registration.deliver(&current);
        registration
    }

    /// Move the entry to `loading` and make it wait for `epoch`.
    pub(crate) fn begin_fetch(&self, key: &ResourceKey, epoch: u64, stale_after: Duration) -> CacheEntry {
        let snapshot = {
            let mut entries = self.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::idle(key.clone()));
            entry.status = FetchStatus::Loading;
            entry.stale_after = stale_after;
            entry.pending_epoch = Some(epoch);
            self.stamp(entry);
            entry.clone()
        };
        self.registry.notify(&snapshot);
        snapshot
    }

    /// Make an entry that lost track of a fetch still on the wire wait for it
    /// again. Refused when the entry already waits on a fetch or was
    /// invalidated since.
    pub(crate) fn rejoin(&self, key: &ResourceKey, epoch: u64, stale_after: Duration) -> bool {
        let snapshot = {
            let mut entries = self.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::idle(key.clone()));
            if entry.pending_epoch.is_some() || entry.invalidated {
                return false;
            }
            entry.status = FetchStatus::Loading;
            entry.stale_after = stale_after;
            entry.pending_epoch = Some(epoch);
            self.stamp(entry);
            entry.clone()
        };
        log(
            Level::Debug,
            Domain::Cache,
            "rejoin",
            obj(&[("key", v_str(&key.to_string())), ("epoch", serde_json::json!(epoch))]),
        );
        self.registry.notify(&snapshot);
        true
    }

    /// Apply a fetch result if the entry still waits for `epoch`.
    ///
    /// Failures keep the previous value so it can be shown next to the error.
    pub(crate) fn resolve(&self, key: &ResourceKey, epoch: u64, result: Result<Value, FetchError>) -> bool {
        let snapshot = {
            let mut entries = self.lock();
            let entry = match entries.get_mut(key) {
                Some(e) if e.pending_epoch == Some(epoch) => e,
                _ => return false,
            };
            entry.pending_epoch = None;
            entry.invalidated = false;
            match result {
                Ok(value) => EntryPatch::new()
                    .value(value)
                    .status(FetchStatus::Success)
                    .clear_error()
                    .apply(entry),
                Err(err) => EntryPatch::new().status(FetchStatus::Error).error(err).apply(entry),
            }
            self.stamp(entry);
            entry.clone()
        };
        self.registry.notify(&snapshot);
        true
    }

    /// Forget the pending fetch for `key` once nobody is interested in it.
    /// An entry left with nothing to show is evicted.
    pub(crate) fn release(&self, key: &ResourceKey) {
        let snapshot = {
            let mut entries = self.lock();
            let entry = match entries.get_mut(key) {
                Some(entry) => entry,
                None => return,
            };
            if entry.pending_epoch.is_some() || entry.is_loading() {
                entry.pending_epoch = None;
                entry.settle_status();
            } else if entry.status != FetchStatus::Idle {
                return;
            }
            if entry.status == FetchStatus::Idle {
                entries.remove(key);
                self.removed(key)
            } else {
                self.stamp(entry);
                entry.clone()
            }
        };
        self.registry.notify(&snapshot);
    }
}
