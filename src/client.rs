//! The [`QueryClient`]: entry point tying the store, fetch coordinator and
//! notifier together.

use std::fmt;
use std::sync::Arc;

use futures::future;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{AnyData, EntryOptions, EntryStore};
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::fetch::{FetchCoordinator, FetchDone, Trigger};
use crate::key::QueryKey;
use crate::query::Query;
use crate::session::{NoSession, SessionProvider};
use crate::subscription::Notifier;

/// A client for managing the query cache, invalidation and refetching.
///
/// The `QueryClient` is the central state manager for queries and mutations.
/// It handles:
/// - Caching query results under canonical keys
/// - Deduplicating concurrent fetches of the same key
/// - Invalidating and refetching entries by key prefix
/// - Supplying the session token to authenticated fetchers
///
/// Cloning is cheap; clones share the same cache. The client must be used
/// inside a Tokio runtime.
///
/// # Example
///
/// ```rust
/// use quarry::{QueryClient, QueryConfig};
/// use std::time::Duration;
///
/// let config = QueryConfig::new(
///     Duration::from_secs(30),  // stale_time
///     Duration::from_secs(300), // cache_time
/// );
///
/// let client = QueryClient::with_config(config);
/// assert_eq!(client.config().stale_time, Duration::from_secs(30));
/// ```
#[derive(Clone)]
pub struct QueryClient {
    store: Arc<EntryStore>,
    session: Arc<dyn SessionProvider>,
    coordinator: FetchCoordinator,
    notifier: Notifier,
    config: QueryConfig,
}

impl QueryClient {
    /// Creates a new query client with default configuration and no session.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration and no session.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        Self::with_session(config, NoSession)
    }

    /// Creates a new query client whose authenticated fetchers and mutators
    /// read their token from `session`.
    pub fn with_session(config: QueryConfig, session: impl SessionProvider + 'static) -> Self {
        let store = Arc::new(EntryStore::new(config.clone()));
        let session: Arc<dyn SessionProvider> = Arc::new(session);
        Self {
            coordinator: FetchCoordinator::new(Arc::clone(&store), Arc::clone(&session)),
            notifier: Notifier::new(Arc::clone(&store)),
            store,
            session,
            config,
        }
    }

    /// Gets the default query configuration.
    pub const fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// The underlying entry store.
    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// The notifier for low-level subscriptions.
    pub const fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub(crate) const fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    pub(crate) const fn session(&self) -> &Arc<dyn SessionProvider> {
        &self.session
    }

    /// Creates the entry for `key` if needed and replaces its fetch options.
    pub(crate) fn configure(&self, key: &QueryKey, options: EntryOptions) -> String {
        self.store.upsert(key, |entry| entry.options = options);
        key.encode().to_owned()
    }

    /// Awaits `done`, then any fetch that superseded it, until the entry has
    /// nothing in flight.
    pub(crate) async fn settle(&self, hash: &str, mut done: Option<FetchDone>) {
        while let Some(pending) = done {
            pending.await;
            done = self
                .store
                .with_entry(hash, |entry| entry.in_flight.as_ref().map(|in_flight| in_flight.done.clone()))
                .flatten();
        }
    }

    /// Invalidates every query whose key starts with `prefix`.
    ///
    /// Matching entries are marked stale and any in-flight fetch is cancelled.
    /// Entries with subscribers are refetched once in the background; the others
    /// are refetched on their next subscription. Returns the number of entries
    /// refetched.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// // Refetches ["bookings", {"status": "New Bookings"}], ["bookings", "b-1"], ...
    /// client.invalidate_queries("bookings");
    /// ```
    pub fn invalidate_queries(&self, prefix: impl Into<QueryKey>) -> usize {
        let prefix = prefix.into();
        let active = self.store.invalidate_prefix(&prefix);
        debug!(prefix = %prefix, refetching = active.len(), "invalidated queries");
        for hash in &active {
            if self.coordinator.fetch(hash, Trigger::Invalidate).is_none() {
                self.notifier.notify_hash(hash);
            }
        }
        active.len()
    }

    /// Refetches every subscribed query whose key starts with `prefix`,
    /// regardless of staleness, and waits for the fetches to settle.
    ///
    /// Returns the number of entries refetched.
    pub async fn refetch_queries(&self, prefix: impl Into<QueryKey>) -> usize {
        let prefix = prefix.into();
        let fetches: Vec<_> = self
            .store
            .matching(&prefix)
            .into_iter()
            .filter(|hash| {
                self.store
                    .with_entry(hash, |entry| entry.subscriber_count() > 0)
                    .unwrap_or(false)
            })
            .filter_map(|hash| {
                let done = self.coordinator.fetch(&hash, Trigger::Refetch)?;
                Some((hash, done))
            })
            .collect();

        let count = fetches.len();
        future::join_all(fetches.into_iter().map(|(hash, done)| async move {
            self.settle(&hash, Some(done)).await;
        }))
        .await;
        count
    }

    /// Fetches `query` without subscribing to it.
    ///
    /// Cached data that is still fresh is returned as is. Otherwise a fetch is
    /// started, or the in-flight one joined, and its outcome returned. The entry
    /// is garbage collected once idle for its cache time.
    ///
    /// # Errors
    ///
    /// Returns the entry's error if the fetch failed, [`QueryError::Cancelled`]
    /// if the entry was removed or invalidated before it settled, and
    /// [`QueryError::TypeMismatch`] if the key holds data of another type.
    pub async fn fetch_query<V>(&self, query: &Query<V>) -> Result<V, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let hash = self.configure(query.key(), query.options());
        let stale = self
            .store
            .with_entry(&hash, |entry| entry.is_stale(Instant::now()))
            .unwrap_or(true);
        if stale {
            let done = self.coordinator.fetch(&hash, Trigger::Prefetch);
            self.settle(&hash, done).await;
        }
        self.notifier.release_if_idle(&hash);

        let (data, error) = self
            .store
            .with_entry(&hash, |entry| (entry.data.clone(), entry.error.clone()))
            .ok_or(QueryError::Cancelled)?;
        if let Some(error) = error {
            return Err(error);
        }
        let data = data.ok_or(QueryError::Cancelled)?;
        downcast(&data, query.key())
    }

    /// Like [`fetch_query`](Self::fetch_query), discarding the result.
    pub async fn prefetch_query<V>(&self, query: &Query<V>)
    where
        V: Clone + Send + Sync + 'static,
    {
        if let Err(err) = self.fetch_query(query).await {
            debug!(key = %query.key(), %err, "prefetch failed");
        }
    }

    /// Returns the cached data for `key`, if present and of type `V`.
    pub fn get_query_data<V>(&self, key: impl Into<QueryKey>) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let key = key.into();
        self.store
            .with_entry(key.encode(), |entry| entry.data.clone())
            .flatten()
            .and_then(|data| data.downcast_ref::<V>().cloned())
    }

    /// Writes `data` into the cache for `key` and notifies its subscribers.
    ///
    /// The data counts as freshly fetched. An in-flight fetch is left running
    /// and overwrites it when it settles.
    pub fn set_query_data<V>(&self, key: impl Into<QueryKey>, data: V)
    where
        V: Send + Sync + 'static,
    {
        let key = key.into();
        let data: AnyData = Arc::new(data);
        self.store.upsert(&key, |entry| entry.set_data(data, Instant::now()));
        self.notifier.notify_hash(key.encode());
        self.notifier.release_if_idle(key.encode());
    }

    /// Removes every query whose key starts with `prefix`, cancelling their
    /// in-flight fetches. Observers of removed entries stop receiving updates.
    ///
    /// Returns the number of entries removed.
    pub fn remove_queries(&self, prefix: impl Into<QueryKey>) -> usize {
        let prefix = prefix.into();
        let removed = self
            .store
            .matching(&prefix)
            .iter()
            .filter(|hash| self.store.remove(hash).is_some())
            .count();
        debug!(prefix = %prefix, removed, "removed queries");
        removed
    }

    /// Removes every query.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Number of queries with a fetch in flight.
    pub fn is_fetching(&self) -> usize {
        self.store.fetching_count()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn downcast<V: Clone + 'static>(data: &AnyData, key: &QueryKey) -> Result<V, QueryError> {
    data.downcast_ref::<V>()
        .cloned()
        .ok_or_else(|| QueryError::TypeMismatch(key.to_string()))
}
