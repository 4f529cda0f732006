//! Per-key subscriptions and change notification.
//!
//! Every cache entry keeps an ordered list of listeners. [`Notifier::notify`]
//! hands each of them the latest [`EntrySnapshot`], in subscription order, after
//! releasing the store lock, so a listener may call back into the client.
//!
//! When the last [`Subscription`] of a key goes away, a garbage-collection check
//! is scheduled after the entry's cache time. The entry is evicted only if it
//! stayed unobserved for the whole delay.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::cache::{EntrySnapshot, EntryStore};
use crate::key::QueryKey;

pub(crate) type Listener = Arc<dyn Fn(&EntrySnapshot) + Send + Sync>;

/// Listeners of one entry, ordered by subscription.
#[derive(Default)]
pub(crate) struct Listeners {
    inner: BTreeMap<u64, Listener>,
}

impl Listeners {
    pub(crate) fn insert(&mut self, id: u64, listener: Listener) {
        self.inner.insert(id, listener);
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.inner.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn to_vec(&self) -> Vec<Listener> {
        self.inner.values().cloned().collect()
    }
}

/// Dispatches entry changes to subscribers and schedules garbage collection.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<EntryStore>,
}

impl Notifier {
    pub(crate) fn new(store: Arc<EntryStore>) -> Self {
        Self { store }
    }

    /// Registers `listener` for changes of `key`, creating the entry if needed.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or [`unsubscribed`](Subscription::unsubscribe).
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
    where
        F: Fn(&EntrySnapshot) + Send + Sync + 'static,
    {
        let id = self.store.next_listener_id();
        self.store.upsert(key, |entry| {
            entry.listeners.insert(id, Arc::new(listener));
        });
        Subscription {
            store: Arc::downgrade(&self.store),
            hash: key.encode().to_owned(),
            id,
            active: true,
        }
    }

    /// Invokes every listener of `key` with the current snapshot.
    pub fn notify(&self, key: &QueryKey) {
        self.notify_hash(key.encode());
    }

    pub(crate) fn notify_hash(&self, hash: &str) {
        let Some((snapshot, listeners)) = self
            .store
            .with_entry(hash, |entry| {
                let snapshot = entry.snapshot(Instant::now(), self.store.next_version());
                (snapshot, entry.listeners.to_vec())
            })
        else {
            return;
        };
        for listener in listeners {
            listener(&snapshot);
        }
    }

    /// Schedules collection of an entry that currently has no subscribers.
    pub(crate) fn release_if_idle(&self, hash: &str) {
        release_if_idle(&self.store, hash);
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("store", &self.store).finish()
    }
}

fn release_if_idle(store: &Arc<EntryStore>, hash: &str) {
    let idle = store
        .with_entry(hash, |entry| {
            entry.listeners.is_empty().then(|| {
                entry.gc_epoch += 1;
                (entry.gc_epoch, entry.options.cache_time)
            })
        })
        .flatten();
    if let Some((epoch, delay)) = idle {
        schedule_gc(Arc::downgrade(store), hash.to_owned(), epoch, delay);
    }
}

fn schedule_gc(store: Weak<EntryStore>, hash: String, epoch: u64, delay: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!(key = %hash, "no runtime available, entry will not be collected");
        return;
    };
    runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(store) = store.upgrade() else {
            return;
        };
        if store.remove_if_idle(&hash, epoch) {
            debug!(key = %hash, "collected unobserved entry");
        }
    });
}

/// A live registration of a listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: Weak<EntryStore>,
    hash: String,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Canonical key this subscription observes.
    pub fn key_hash(&self) -> &str {
        &self.hash
    }

    /// Removes the listener now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let removed = store
            .with_entry(&self.hash, |entry| entry.listeners.remove(self.id))
            .unwrap_or(false);
        if removed {
            release_if_idle(&store, &self.hash);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.hash)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
