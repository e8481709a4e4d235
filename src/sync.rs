//! Keeps cache entries in step with the backend while somebody watches them.
//!
//! Each subscribed key owns a slot holding its descriptor, subscriber count
//! and polling timer. Every issued fetch gets a fresh epoch; the cache only
//! accepts the result whose epoch the entry is still waiting for, so answers
//! for superseded requests, released keys or cleared entries fall on the floor.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::cache::{CacheEntry, ResourceCache};
use crate::error::FetchError;
use crate::fetcher::{FetchDescriptor, Mutation};
use crate::key::{KeyFilter, ResourceKey};
use crate::logging::{log, obj, v_str, Domain, Level, ProfileScope};
use crate::registry::{self, Callback, Registration};

/// What asked for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Subscribe,
    Manual,
    Interval,
    Enabled,
    /// The cached value was invalidated; a fetch already in flight no longer
    /// counts and must be followed by a new one.
    Invalidated,
    Rerun,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Subscribe => "subscribe",
            Trigger::Manual => "manual",
            Trigger::Interval => "interval",
            Trigger::Enabled => "enabled",
            Trigger::Invalidated => "invalidated",
            Trigger::Rerun => "rerun",
        }
    }
}

struct Slot {
    descriptor: FetchDescriptor,
    subscribers: usize,
    rerun: bool,
    timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn active(&self) -> bool {
        self.subscribers > 0 && self.descriptor.enabled
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// The request currently on the wire for a key.
#[derive(Debug, Clone, Copy)]
struct Flight {
    epoch: u64,
    /// Issued before an invalidation or clear; its answer must not be used.
    superseded: bool,
}

/// What a trigger ended up doing.
enum Issued {
    Fetch(u64, FetchDescriptor),
    Rejoin(u64, Duration),
    Coalesced,
}

#[derive(Default)]
struct SyncState {
    slots: HashMap<ResourceKey, Slot>,
    in_flight: HashMap<ResourceKey, Flight>,
    next_epoch: u64,
    fetches_issued: u64,
}

struct Inner {
    cache: Arc<ResourceCache>,
    state: Mutex<SyncState>,
    handle: Handle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        for slot in state.slots.values_mut() {
            slot.stop_timer();
        }
    }
}

/// Orchestrates fetches for subscribed keys.
///
/// Cheap to clone; clones share the same slots and cache.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

impl Synchronizer {
    /// Create a synchronizer spawning its tasks on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; use [`Synchronizer::with_handle`]
    /// from other threads.
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self::with_handle(cache, Handle::current())
    }

    pub fn with_handle(cache: Arc<ResourceCache>, handle: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                state: Mutex::new(SyncState::default()),
                handle,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.inner.cache
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Watch `descriptor.key`.
    ///
    /// `callback` runs once right away with the current entry and then after
    /// every change. The first subscriber of a key decides its descriptor and
    /// fetches when the entry is missing or stale; later subscribers share the
    /// slot and its fetches.
    pub fn subscribe<F>(&self, descriptor: FetchDescriptor, callback: F) -> Subscription
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        let callback: Arc<Callback> = Arc::new(callback);
        let registration = self.attach(descriptor.clone(), callback);
        Subscription {
            sync: Arc::downgrade(&self.inner),
            descriptor,
            registration: Some(registration),
        }
    }

    fn attach(&self, descriptor: FetchDescriptor, callback: Arc<Callback>) -> Registration {
        let key = descriptor.key.clone();
        let registration = self.inner.cache.subscribe(&key, callback);

        let first = {
            let mut state = self.state();
            match state.slots.entry(key.clone()) {
                Entry::Occupied(mut slot) => {
                    slot.get_mut().subscribers += 1;
                    false
                }
                Entry::Vacant(vacant) => {
                    let mut slot = Slot {
                        descriptor,
                        subscribers: 1,
                        rerun: false,
                        timer: None,
                    };
                    if slot.descriptor.enabled {
                        slot.timer = self.spawn_timer(&slot.descriptor);
                    }
                    vacant.insert(slot);
                    true
                }
            }
        };

        log(
            Level::Debug,
            Domain::Sync,
            "subscribe",
            obj(&[("key", v_str(&key.to_string())), ("first", json!(first))]),
        );

        if first && self.needs_fetch(&key) {
            self.trigger(key, Trigger::Subscribe);
        }
        registration
    }

    fn detach(&self, key: &ResourceKey) {
        let released = {
            let mut state = self.state();
            let remaining = match state.slots.get_mut(key) {
                Some(slot) => {
                    slot.subscribers = slot.subscribers.saturating_sub(1);
                    slot.subscribers
                }
                None => return,
            };
            if remaining == 0 {
                if let Some(mut slot) = state.slots.remove(key) {
                    slot.stop_timer();
                }
            }
            remaining == 0
        };
        if released {
            log(Level::Debug, Domain::Sync, "release", obj(&[("key", v_str(&key.to_string()))]));
            self.inner.cache.release(key);
        }
    }

    fn needs_fetch(&self, key: &ResourceKey) -> bool {
        let enabled = self
            .state()
            .slots
            .get(key)
            .map(|s| s.descriptor.enabled)
            .unwrap_or(false);
        enabled && self.inner.cache.get(key).map_or(true, |e| e.is_stale())
    }

    fn spawn_timer(&self, descriptor: &FetchDescriptor) -> Option<JoinHandle<()>> {
        let period = descriptor.refetch_interval.filter(|p| !p.is_zero())?;
        let key = descriptor.key.clone();
        let weak = Arc::downgrade(&self.inner);
        Some(self.inner.handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                Synchronizer { inner }.trigger(key.clone(), Trigger::Interval);
            }
        }))
    }

    /// Turn fetching for an active key on or off.
    pub fn set_enabled(&self, key: &ResourceKey, enabled: bool) {
        let changed = {
            let mut state = self.state();
            match state.slots.get_mut(key) {
                Some(slot) if slot.descriptor.enabled != enabled => {
                    slot.descriptor.enabled = enabled;
                    if enabled {
                        slot.timer = self.spawn_timer(&slot.descriptor);
                    } else {
                        slot.stop_timer();
                    }
                    true
                }
                _ => false,
            }
        };
        if changed && enabled && self.needs_fetch(key) {
            self.trigger(key.clone(), Trigger::Enabled);
        }
    }

    // -------------------------------------------------------------------------
    // Triggers
    // -------------------------------------------------------------------------

    /// Fetch `key` again unless a fetch for it is already running.
    pub fn refetch(&self, key: &ResourceKey) {
        self.trigger(key.clone(), Trigger::Manual);
    }

    /// Mark matching entries stale and refetch the ones somebody watches.
    pub fn invalidate(&self, filter: &KeyFilter) {
        let idle = self.supersede(filter);
        self.inner.cache.invalidate(filter);
        for key in idle {
            self.trigger(key, Trigger::Invalidated);
        }
    }

    /// Drop the whole cache; watched keys refetch from scratch.
    ///
    /// Requests already on the wire are not cancelled. Their results find no
    /// entry waiting for them and are ignored.
    pub fn clear_all(&self) {
        let idle = self.supersede(&KeyFilter::All);
        self.inner.cache.clear_all();
        for key in idle {
            self.trigger(key, Trigger::Invalidated);
        }
    }

    /// Flag matching requests on the wire as superseded; watched keys among
    /// them fetch again once their request settles. Returns the watched keys
    /// with nothing on the wire.
    fn supersede(&self, filter: &KeyFilter) -> Vec<ResourceKey> {
        let mut guard = self.state();
        let SyncState { slots, in_flight, .. } = &mut *guard;
        for (key, flight) in in_flight.iter_mut().filter(|(k, _)| filter.matches(k)) {
            flight.superseded = true;
            if let Some(slot) = slots.get_mut(key) {
                slot.rerun = true;
            }
        }
        slots
            .iter()
            .filter(|(k, s)| s.active() && filter.matches(k) && !in_flight.contains_key(*k))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop cached entries matching `filter` that nobody watches, e.g. the
    /// conversations of users no longer selected.
    pub fn evict_unwatched(&self, filter: &KeyFilter) -> Vec<ResourceKey> {
        let candidates: Vec<ResourceKey> = {
            let state = self.state();
            self.inner
                .cache
                .keys()
                .into_iter()
                .filter(|k| filter.matches(k) && !state.slots.contains_key(k))
                .collect()
        };
        candidates
            .into_iter()
            .filter(|k| self.inner.cache.remove(k).is_some())
            .collect()
    }

    fn trigger(&self, key: ResourceKey, reason: Trigger) {
        if registry::is_dispatching() {
            // Called from a subscriber callback: run after it returns.
            let this = self.clone();
            self.inner.handle.spawn(async move {
                this.trigger_now(key, reason);
            });
            return;
        }
        self.trigger_now(key, reason);
    }

    fn trigger_now(&self, key: ResourceKey, reason: Trigger) {
        let issued = {
            let mut guard = self.state();
            let SyncState {
                slots,
                in_flight,
                next_epoch,
                fetches_issued,
            } = &mut *guard;

            let slot = match slots.get_mut(&key) {
                Some(slot) if slot.active() => slot,
                _ => return,
            };
            match in_flight.get(&key) {
                // The entry may have let go of this request while nobody
                // watched the key; it is still the right answer.
                Some(flight) if !flight.superseded => Issued::Rejoin(flight.epoch, slot.descriptor.stale_after),
                Some(_) => Issued::Coalesced,
                None => {
                    *next_epoch += 1;
                    *fetches_issued += 1;
                    in_flight.insert(
                        key.clone(),
                        Flight {
                            epoch: *next_epoch,
                            superseded: false,
                        },
                    );
                    Issued::Fetch(*next_epoch, slot.descriptor.clone())
                }
            }
        };

        let (epoch, descriptor) = match issued {
            Issued::Fetch(epoch, descriptor) => (epoch, descriptor),
            Issued::Rejoin(epoch, stale_after) => {
                let rejoined = self.inner.cache.rejoin(&key, epoch, stale_after);
                log(
                    Level::Trace,
                    Domain::Sync,
                    "coalesced",
                    obj(&[
                        ("key", v_str(&key.to_string())),
                        ("reason", v_str(reason.as_str())),
                        ("rejoined", json!(rejoined)),
                    ]),
                );
                return;
            }
            Issued::Coalesced => {
                log(
                    Level::Trace,
                    Domain::Sync,
                    "coalesced",
                    obj(&[("key", v_str(&key.to_string())), ("reason", v_str(reason.as_str()))]),
                );
                return;
            }
        };

        log(
            Level::Debug,
            Domain::Sync,
            "fetch",
            obj(&[
                ("key", v_str(&key.to_string())),
                ("epoch", json!(epoch)),
                ("reason", v_str(reason.as_str())),
            ]),
        );
        self.inner.cache.begin_fetch(&key, epoch, descriptor.stale_after);

        let this = self.clone();
        let handle = self.inner.handle.clone();
        self.inner.handle.spawn(async move {
            let result = {
                let _profile = ProfileScope::new("fetch", &[("key", v_str(&key.to_string()))]);
                let fetch_key = key.clone();
                // A panicking fetcher must still settle the key.
                let task = handle.spawn(async move { descriptor.fetcher.fetch(&fetch_key).await });
                match task.await {
                    Ok(result) => result,
                    Err(err) => Err(FetchError::network(format!("fetch task failed: {}", err))),
                }
            };
            this.complete(key, epoch, result);
        });
    }

    fn complete(&self, key: ResourceKey, epoch: u64, result: Result<Value, FetchError>) {
        {
            let mut state = self.state();
            if state.in_flight.get(&key).map(|f| f.epoch) == Some(epoch) {
                state.in_flight.remove(&key);
            }
        }

        if let Err(err) = &result {
            let domain = if err.is_auth() { Domain::Auth } else { Domain::Sync };
            log(
                Level::Warn,
                domain,
                "fetch_failed",
                obj(&[
                    ("key", v_str(&key.to_string())),
                    ("epoch", json!(epoch)),
                    ("code", v_str(err.error_code())),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        }

        let applied = self.inner.cache.resolve(&key, epoch, result);
        if !applied {
            log(
                Level::Debug,
                Domain::Sync,
                "discarded",
                obj(&[("key", v_str(&key.to_string())), ("epoch", json!(epoch))]),
            );
        }

        let rerun = {
            let mut guard = self.state();
            let SyncState { slots, in_flight, .. } = &mut *guard;
            match slots.get_mut(&key) {
                Some(slot) if slot.active() && !in_flight.contains_key(&key) => {
                    let rerun = slot.rerun || !applied;
                    slot.rerun = false;
                    rerun
                }
                _ => false,
            }
        };
        if rerun {
            self.trigger_now(key, Trigger::Rerun);
        }
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Run `mutation` once and, on success, invalidate its dependents.
    pub async fn mutate(&self, mutation: &Mutation) -> Result<Value, FetchError> {
        let label = mutation.label.to_string();
        let result = {
            let _profile = ProfileScope::new("mutation", &[("key", v_str(&label))]);
            mutation.fetcher.fetch(&mutation.label).await
        };
        match &result {
            Ok(_) => {
                log(
                    Level::Info,
                    Domain::Sync,
                    "mutation_ok",
                    obj(&[("key", v_str(&label)), ("clears_all", json!(mutation.clears_all))]),
                );
                if mutation.clears_all {
                    self.clear_all();
                } else {
                    for filter in &mutation.invalidates {
                        self.invalidate(filter);
                    }
                }
            }
            Err(err) => log(
                Level::Warn,
                if err.is_auth() { Domain::Auth } else { Domain::Sync },
                "mutation_failed",
                obj(&[
                    ("key", v_str(&label)),
                    ("code", v_str(err.error_code())),
                    ("error", v_str(&err.to_string())),
                ]),
            ),
        }
        result
    }

    // -------------------------------------------------------------------------
    // Introspection and teardown
    // -------------------------------------------------------------------------

    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.state().slots.get(key).map(|s| s.subscribers).unwrap_or(0)
    }

    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.state().in_flight.contains_key(key)
    }

    pub fn has_timer(&self, key: &ResourceKey) -> bool {
        self.state()
            .slots
            .get(key)
            .map(|s| s.timer.is_some())
            .unwrap_or(false)
    }

    /// Total number of fetches issued since creation.
    pub fn fetches_issued(&self) -> u64 {
        self.state().fetches_issued
    }

    /// Stop every timer and forget every slot. Outstanding subscriptions
    /// become inert.
    pub fn shutdown(&self) {
        let keys: Vec<ResourceKey> = {
            let mut state = self.state();
            state
                .slots
                .drain()
                .map(|(key, mut slot)| {
                    slot.stop_timer();
                    key
                })
                .collect()
        };
        for key in &keys {
            self.inner.cache.release(key);
        }
        log(Level::Info, Domain::System, "sync_shutdown", obj(&[("slots", json!(keys.len()))]));
    }
}

/// A consumer's interest in one key.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) detaches the
/// consumer; the last one out stops the key's timer.
pub struct Subscription {
    sync: Weak<Inner>,
    descriptor: FetchDescriptor,
    registration: Option<Registration>,
}

impl Subscription {
    pub fn key(&self) -> &ResourceKey {
        &self.descriptor.key
    }

    fn sync(&self) -> Option<Synchronizer> {
        self.sync.upgrade().map(|inner| Synchronizer { inner })
    }

    /// Current entry for the watched key.
    pub fn entry(&self) -> CacheEntry {
        self.sync()
            .and_then(|s| s.cache().get(self.key()))
            .unwrap_or_else(|| CacheEntry::idle(self.key().clone()))
    }

    pub fn refetch(&self) {
        if let Some(sync) = self.sync() {
            sync.refetch(self.key());
        }
    }

    /// Watch a different key with the same fetcher and policy, e.g. after the
    /// selected user changed. The old key is released first, so its pending
    /// answer can no longer land anywhere.
    pub fn switch_to(&mut self, key: ResourceKey) {
        let descriptor = self.descriptor.with_key(key);
        self.retarget(descriptor);
    }

    /// Replace the watched descriptor, keeping the same callback.
    pub fn retarget(&mut self, descriptor: FetchDescriptor) {
        if descriptor.key == self.descriptor.key && descriptor.enabled == self.descriptor.enabled {
            return;
        }
        let Some(callback) = self.registration.as_ref().and_then(|r| r.callback()) else {
            return;
        };
        let old = std::mem::replace(&mut self.descriptor, descriptor.clone());
        if let Some(registration) = self.registration.take() {
            registration.unregister();
        }
        if let Some(sync) = self.sync() {
            sync.detach(&old.key);
            self.registration = Some(sync.attach(descriptor, callback));
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.unregister();
            if let Some(sync) = self.sync() {
                sync.detach(&self.descriptor.key);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
