//! The entry store: one cache entry per canonical query key.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::{QueryConfig, RetryPolicy};
use crate::error::QueryError;
use crate::fetch::{ErasedFetcher, InFlight};
use crate::key::QueryKey;
use crate::subscription::Listeners;

/// Type-erased cached value. Queries downcast it to their data type.
pub type AnyData = Arc<dyn Any + Send + Sync>;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// Nothing has been fetched yet.
    #[default]
    Idle,
    /// A fetch is running and there is no data to show.
    Pending,
    /// The last settled fetch succeeded.
    Success,
    /// The last settled fetch failed.
    Error,
}

/// Fetch options of an entry. The most recent binding of a key wins.
#[derive(Clone)]
pub(crate) struct EntryOptions {
    pub(crate) fetcher: Option<ErasedFetcher>,
    pub(crate) stale_time: Duration,
    pub(crate) cache_time: Duration,
    pub(crate) retry: RetryPolicy,
}

impl EntryOptions {
    pub(crate) fn from_config(config: &QueryConfig) -> Self {
        Self {
            fetcher: None,
            stale_time: config.stale_time,
            cache_time: config.cache_time,
            retry: config.retry,
        }
    }
}

/// A cached entry with its fetch state, subscribers and staleness information.
pub(crate) struct CacheEntry {
    pub(crate) key: QueryKey,
    pub(crate) status: QueryStatus,
    /// Status to fall back to if the in-flight fetch is cancelled.
    settled_status: QueryStatus,
    pub(crate) data: Option<AnyData>,
    pub(crate) error: Option<QueryError>,
    pub(crate) last_fetched_at: Option<Instant>,
    /// With data present, `None` means the data never goes stale.
    pub(crate) stale_at: Option<Instant>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) listeners: Listeners,
    pub(crate) retry_count: u32,
    pub(crate) gc_epoch: u64,
    pub(crate) options: EntryOptions,
}

impl CacheEntry {
    pub(crate) fn new(key: QueryKey, options: EntryOptions) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            settled_status: QueryStatus::Idle,
            data: None,
            error: None,
            last_fetched_at: None,
            stale_at: None,
            in_flight: None,
            listeners: Listeners::default(),
            retry_count: 0,
            gc_epoch: 0,
            options,
        }
    }

    /// Checks if this entry is stale at `now`. Entries without data are always stale.
    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        self.data.is_none() || self.stale_at.is_some_and(|at| now >= at)
    }

    /// Marks this entry as stale without touching its data.
    pub(crate) fn mark_stale(&mut self, now: Instant) {
        if self.stale_at.is_none_or(|at| at > now) {
            self.stale_at = Some(now);
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
    }

    pub(crate) fn begin_fetch(&mut self, in_flight: InFlight) {
        self.settled_status = self.status;
        if self.data.is_none() {
            self.status = QueryStatus::Pending;
        }
        self.retry_count = 0;
        self.in_flight = Some(in_flight);
    }

    pub(crate) fn record_failure(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Stores freshly fetched data, resetting staleness and the failure count.
    pub(crate) fn settle_success(&mut self, data: AnyData, now: Instant) {
        self.in_flight = None;
        self.set_data(data, now);
    }

    pub(crate) fn settle_error(&mut self, error: QueryError) {
        self.in_flight = None;
        self.status = QueryStatus::Error;
        self.settled_status = QueryStatus::Error;
        self.error = Some(error);
    }

    pub(crate) fn set_data(&mut self, data: AnyData, now: Instant) {
        self.data = Some(data);
        self.error = None;
        self.status = QueryStatus::Success;
        self.settled_status = QueryStatus::Success;
        self.retry_count = 0;
        self.last_fetched_at = Some(now);
        self.stale_at = now.checked_add(self.options.stale_time);
    }

    /// Signals the in-flight fetch, if any, and restores the settled status.
    pub(crate) fn cancel_in_flight(&mut self) -> bool {
        match self.in_flight.take() {
            Some(in_flight) => {
                in_flight.token.cancel();
                self.status = self.settled_status;
                true
            }
            None => false,
        }
    }

    /// Builds a snapshot stamped with `version`, which must be taken from
    /// [`EntryStore::next_version`] while the entry is locked.
    pub(crate) fn snapshot(&self, now: Instant, version: u64) -> EntrySnapshot {
        EntrySnapshot {
            version,
            key: self.key.clone(),
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            is_fetching: self.in_flight.is_some(),
            is_stale: self.is_stale(now),
            retry_count: self.retry_count,
            subscriber_count: self.subscriber_count(),
            last_fetched_at: self.last_fetched_at,
            stale_at: self.stale_at,
        }
    }
}

/// A point-in-time, type-erased view of a cache entry.
#[derive(Clone)]
pub struct EntrySnapshot {
    /// Ordering stamp. Of two snapshots of one entry, the one with the larger
    /// version reflects the later state.
    pub version: u64,
    /// Key of the entry.
    pub key: QueryKey,
    /// Lifecycle status.
    pub status: QueryStatus,
    /// Last successfully fetched value.
    pub data: Option<AnyData>,
    /// Last error.
    pub error: Option<QueryError>,
    /// Whether a fetch is in flight.
    pub is_fetching: bool,
    /// Whether the data is stale.
    pub is_stale: bool,
    /// Failed attempts of the current fetch run.
    pub retry_count: u32,
    /// Number of subscribers.
    pub subscriber_count: usize,
    /// When the last successful fetch completed.
    pub last_fetched_at: Option<Instant>,
    /// When the data becomes stale.
    pub stale_at: Option<Instant>,
}

impl EntrySnapshot {
    /// Returns the data downcast to `V`, or `None` if absent or of another type.
    pub fn data_as<V: 'static>(&self) -> Option<&V> {
        self.data.as_deref().and_then(|data| data.downcast_ref::<V>())
    }
}

impl fmt::Debug for EntrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySnapshot")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("has_data", &self.data.is_some())
            .field("version", &self.version)
            .field("error", &self.error)
            .field("is_fetching", &self.is_fetching)
            .field("is_stale", &self.is_stale)
            .field("retry_count", &self.retry_count)
            .field("subscriber_count", &self.subscriber_count)
            .finish_non_exhaustive()
    }
}

/// Holds one cache entry per canonical key, with its data, status and subscribers.
pub struct EntryStore {
    entries: DashMap<String, CacheEntry>,
    defaults: QueryConfig,
    generations: AtomicU64,
    versions: AtomicU64,
    listener_ids: AtomicU64,
}

impl EntryStore {
    pub(crate) fn new(defaults: QueryConfig) -> Self {
        Self {
            entries: DashMap::new(),
            defaults,
            generations: AtomicU64::new(0),
            versions: AtomicU64::new(0),
            listener_ids: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot versions are store-wide. Taken under an entry's lock, they
    /// increase in the order the entry's states were observed.
    pub(crate) fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_listener_id(&self) -> u64 {
        self.listener_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns a snapshot of the entry for `key`, if present.
    pub fn get(&self, key: &QueryKey) -> Option<EntrySnapshot> {
        self.with_entry(key.encode(), |entry| entry.snapshot(Instant::now(), self.next_version()))
    }

    /// Returns a snapshot of the entry for `key`, creating an idle entry first if needed.
    pub fn get_or_create(&self, key: &QueryKey) -> EntrySnapshot {
        self.upsert(key, |entry| entry.snapshot(Instant::now(), self.next_version()))
    }

    /// Removes the entry for `key`, cancelling its in-flight fetch.
    pub fn delete(&self, key: &QueryKey) -> bool {
        self.remove(key.encode()).is_some()
    }

    /// Marks every entry whose key starts with `prefix` as stale and cancels its
    /// in-flight fetch.
    ///
    /// Returns the canonical keys of the matching entries that have at least one
    /// subscriber; those are the ones that must be refetched now. Entries
    /// without subscribers are refetched lazily on their next subscription.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> Vec<String> {
        let now = Instant::now();
        let mut active = Vec::new();
        for mut item in self.entries.iter_mut() {
            let (hash, entry) = item.pair_mut();
            if !entry.key.starts_with(prefix) {
                continue;
            }
            entry.mark_stale(now);
            entry.cancel_in_flight();
            if entry.subscriber_count() > 0 {
                active.push(hash.clone());
            }
        }
        active
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of all entries, in no particular order.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|item| item.value().key.clone()).collect()
    }

    /// Number of entries with a fetch in flight.
    pub fn fetching_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|item| item.value().in_flight.is_some())
            .count()
    }

    /// Runs `f` on the entry for `hash` if it exists. The shard lock is held for
    /// the duration of `f`, so `f` must not touch the store.
    pub(crate) fn with_entry<R>(&self, hash: &str, f: impl FnOnce(&mut CacheEntry) -> R) -> Option<R> {
        self.entries.get_mut(hash).map(|mut entry| f(&mut entry))
    }

    /// Like [`with_entry`](Self::with_entry), creating the entry first if needed.
    pub(crate) fn upsert<R>(&self, key: &QueryKey, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
        let mut entry = self
            .entries
            .entry(key.encode().to_owned())
            .or_insert_with(|| CacheEntry::new(key.clone(), EntryOptions::from_config(&self.defaults)));
        f(&mut entry)
    }

    /// Canonical keys of entries matching `prefix`.
    pub(crate) fn matching(&self, prefix: &QueryKey) -> Vec<String> {
        self.entries
            .iter()
            .filter(|item| item.value().key.starts_with(prefix))
            .map(|item| item.key().clone())
            .collect()
    }

    pub(crate) fn remove(&self, hash: &str) -> Option<CacheEntry> {
        let (_, mut entry) = self.entries.remove(hash)?;
        entry.cancel_in_flight();
        Some(entry)
    }

    /// Removes the entry only if it has had no subscribers since `epoch` began.
    pub(crate) fn remove_if_idle(&self, hash: &str, epoch: u64) -> bool {
        let removed = self
            .entries
            .remove_if(hash, |_, entry| entry.listeners.is_empty() && entry.gc_epoch == epoch);
        match removed {
            Some((_, mut entry)) => {
                entry.cancel_in_flight();
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&self) {
        let hashes: Vec<String> = self.entries.iter().map(|item| item.key().clone()).collect();
        for hash in hashes {
            self.remove(&hash);
        }
    }
}

impl fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("entries", &self.entries.len())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::FutureExt;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::query_key;

    fn store() -> EntryStore {
        EntryStore::new(QueryConfig::default().with_stale_time(Duration::from_secs(10)))
    }

    fn in_flight(store: &EntryStore) -> (InFlight, CancellationToken) {
        let token = CancellationToken::new();
        let in_flight = InFlight {
            generation: store.next_generation(),
            token: token.clone(),
            done: async {}.boxed().shared(),
        };
        (in_flight, token)
    }

    #[test]
    fn test_new_entry() {
        let store = store();
        let key = query_key!["vendors"];
        assert!(store.get(&key).is_none());

        let snapshot = store.get_or_create(&key);
        assert_eq!(snapshot.status, QueryStatus::Idle);
        assert!(snapshot.data.is_none());
        assert!(snapshot.is_stale);
        assert_eq!(store.len(), 1);

        // A second call reuses the entry.
        store.get_or_create(&key);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_snapshot_versions_increase() {
        let store = store();
        let key = query_key!["vendors"];
        let first = store.get_or_create(&key);
        store.upsert(&key, |entry| entry.set_data(Arc::new(1_u8), Instant::now()));
        let second = store.get(&key).expect("entry");
        assert!(second.version > first.version);
        assert!(store.get(&key).expect("entry").version > second.version);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_success_sets_staleness() {
        let store = store();
        let key = query_key!["vendors"];
        let now = Instant::now();
        store.upsert(&key, |entry| {
            entry.retry_count = 2;
            entry.settle_success(Arc::new(7_u32), now);
        });

        let snapshot = store.get(&key).expect("entry exists");
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert_eq!(snapshot.data_as::<u32>(), Some(&7));
        assert_eq!(snapshot.retry_count, 0);
        assert!(!snapshot.is_stale);
        assert_eq!(snapshot.stale_at, Some(now + Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.get(&key).expect("entry exists").is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_prefix_marks_stale_and_reports_active() {
        let store = store();
        let now = Instant::now();
        let keys = [
            query_key!["bookings", {"status": "New Bookings"}],
            query_key!["bookings", {"status": "Completed"}],
            query_key!["vendors"],
        ];
        for key in &keys {
            store.upsert(key, |entry| entry.settle_success(Arc::new(()), now));
        }
        // Only the first bookings entry has a subscriber.
        store.upsert(&keys[0], |entry| entry.listeners.insert(0, Arc::new(|_: &EntrySnapshot| {})));

        let active = store.invalidate_prefix(&query_key!["bookings"]);
        assert_eq!(active, vec![keys[0].encode().to_owned()]);

        assert!(store.get(&keys[0]).expect("entry").is_stale);
        assert!(store.get(&keys[1]).expect("entry").is_stale);
        assert!(!store.get(&keys[2]).expect("entry").is_stale);
        // Data is kept.
        assert!(store.get(&keys[1]).expect("entry").data.is_some());
    }

    #[test]
    fn test_invalidate_cancels_in_flight_and_restores_status() {
        let store = store();
        let key = query_key!["users"];
        let (in_flight, token) = in_flight(&store);
        store.upsert(&key, |entry| entry.begin_fetch(in_flight));
        assert_eq!(store.get(&key).expect("entry").status, QueryStatus::Pending);

        store.invalidate_prefix(&QueryKey::root());
        assert!(token.is_cancelled());
        let snapshot = store.get(&key).expect("entry");
        assert_eq!(snapshot.status, QueryStatus::Idle);
        assert!(!snapshot.is_fetching);
    }

    #[test]
    fn test_delete_cancels_in_flight() {
        let store = store();
        let key = query_key!["withdrawals"];
        let (in_flight, token) = in_flight(&store);
        store.upsert(&key, |entry| entry.begin_fetch(in_flight));

        assert!(store.delete(&key));
        assert!(token.is_cancelled());
        assert!(store.is_empty());
        assert!(!store.delete(&key));
    }

    #[test]
    fn test_is_current_tracks_generation() {
        let store = store();
        let key = query_key!["transactions"];
        let (first, _) = in_flight(&store);
        let first_generation = first.generation;
        store.upsert(&key, |entry| entry.begin_fetch(first));
        assert_eq!(store.with_entry(key.encode(), |entry| entry.is_current(first_generation)), Some(true));

        store.with_entry(key.encode(), CacheEntry::cancel_in_flight);
        let (second, _) = in_flight(&store);
        store.upsert(&key, |entry| entry.begin_fetch(second));
        assert_eq!(store.with_entry(key.encode(), |entry| entry.is_current(first_generation)), Some(false));
        assert_eq!(store.fetching_count(), 1);
    }

    #[test]
    fn test_remove_if_idle_respects_epoch_and_subscribers() {
        let store = store();
        let key = query_key!["administrators"];
        store.upsert(&key, |entry| entry.gc_epoch = 3);

        assert!(!store.remove_if_idle(key.encode(), 2));
        store.upsert(&key, |entry| entry.listeners.insert(1, Arc::new(|_: &EntrySnapshot| {})));
        assert!(!store.remove_if_idle(key.encode(), 3));
        store.upsert(&key, |entry| entry.listeners.remove(1));
        assert!(store.remove_if_idle(key.encode(), 3));
        assert!(store.is_empty());
    }

    #[test]
    fn test_matching_and_clear() {
        let store = store();
        store.get_or_create(&query_key!["bookings", 1]);
        store.get_or_create(&query_key!["bookings", 2]);
        store.get_or_create(&query_key!["vendors"]);

        assert_eq!(store.matching(&query_key!["bookings"]).len(), 2);
        assert_eq!(store.keys().len(), 3);

        store.clear();
        assert!(store.is_empty());
    }
}
