use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::cache::CacheEntry;
use crate::key::ResourceKey;

/// Consumer callback, invoked with a snapshot of the entry after each change.
pub type Callback = dyn Fn(&CacheEntry) + Send + Sync;

thread_local! {
    static DISPATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// True while this thread is inside a subscriber callback.
///
/// Triggers requested from a callback are deferred to a spawned task instead
/// of running inline.
pub fn is_dispatching() -> bool {
    DISPATCH_DEPTH.with(|d| d.get() > 0)
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|d| d.set(d.get() + 1));
        DispatchGuard
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[derive(Default)]
struct KeyListeners {
    callbacks: Vec<(u64, Weak<Callback>)>,
    /// Version of the newest snapshot handed out for this key.
    delivered: u64,
}

type Listeners = HashMap<ResourceKey, KeyListeners>;

/// Fan-out of cache changes to consumers.
///
/// Only weak references are stored: a consumer stays registered exactly as
/// long as it holds its [`Registration`].
#[derive(Default)]
pub struct SubscriberRegistry {
    listeners: Arc<Mutex<Listeners>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: ResourceKey, callback: Arc<Callback>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners
                .entry(key.clone())
                .or_default()
                .callbacks
                .push((id, Arc::downgrade(&callback)));
        }
        Registration {
            key,
            id,
            callback: Some(callback),
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of live consumers for `key`.
    pub fn count(&self, key: &ResourceKey) -> usize {
        self.listeners
            .lock()
            .map(|l| {
                l.get(key)
                    .map(|v| v.callbacks.iter().filter(|(_, cb)| cb.strong_count() > 0).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Invoke every live callback for `entry.key`. No lock is held while the
    /// callbacks run.
    ///
    /// A snapshot older than one already announced for the same key is
    /// dropped: a writer that lost a race to another thread must not roll
    /// consumers back to an earlier state.
    pub fn notify(&self, entry: &CacheEntry) {
        let callbacks: Vec<Arc<Callback>> = match self.listeners.lock() {
            Ok(mut listeners) => match listeners.get_mut(&entry.key) {
                Some(list) if entry.version() < list.delivered => Vec::new(),
                Some(list) => {
                    list.delivered = entry.version();
                    list.callbacks.retain(|(_, cb)| cb.strong_count() > 0);
                    list.callbacks.iter().filter_map(|(_, cb)| cb.upgrade()).collect()
                }
                None => Vec::new(),
            },
            Err(_) => Vec::new(),
        };
        deliver(&callbacks, entry);
    }
}

fn deliver(callbacks: &[Arc<Callback>], entry: &CacheEntry) {
    let _guard = DispatchGuard::enter();
    for cb in callbacks {
        cb(entry);
    }
}

/// A consumer's registration; dropping it unregisters the callback.
pub struct Registration {
    key: ResourceKey,
    id: u64,
    callback: Option<Arc<Callback>>,
    listeners: Weak<Mutex<Listeners>>,
}

impl Registration {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Deliver `entry` to this registration only.
    pub(crate) fn deliver(&self, entry: &CacheEntry) {
        if let Some(cb) = &self.callback {
            deliver(std::slice::from_ref(cb), entry);
        }
    }

    pub(crate) fn callback(&self) -> Option<Arc<Callback>> {
        self.callback.clone()
    }

    pub fn unregister(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        self.callback = None;
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut l) = listeners.lock() {
                if let Some(list) = l.get_mut(&self.key) {
                    list.callbacks.retain(|(id, _)| *id != self.id);
                    if list.callbacks.is_empty() {
                        l.remove(&self.key);
                    }
                }
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.remove();
    }
}
