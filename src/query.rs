//! Query bindings and live observers.
//!
//! A [`Query`] declares how to fetch the data behind a [`QueryKey`]. Binding it
//! subscribes to the key's cache entry and returns a [`QueryObserver`] that
//! always holds the latest [`QueryResult`]:
//!
//! 1. If cached data exists, it's immediately available
//! 2. If data is stale or missing, a fetch is automatically triggered
//! 3. When the key is invalidated, the query refetches in the background
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures::FutureExt;
//! use quarry::{Query, QueryClient, QueryError, query_key};
//!
//! # async fn demo() {
//! let client = Arc::new(QueryClient::new());
//! let vendors = Query::new(
//!     query_key!["vendors"],
//!     |_cancel| async { Ok::<_, QueryError>(vec!["acme".to_string()]) }.boxed(),
//!     Arc::clone(&client),
//! );
//!
//! let mut observer = vendors.bind();
//! let result = observer.wait_for(|result| result.is_settled()).await;
//! # }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::{AnyData, EntryOptions, EntrySnapshot, QueryStatus};
use crate::client::QueryClient;
use crate::config::RetryPolicy;
use crate::error::QueryError;
use crate::fetch::{ErasedFetcher, FetchContext, Trigger};
use crate::key::QueryKey;
use crate::session::BearerToken;
use crate::subscription::Subscription;

/// A typed view of a cache entry.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
    /// Lifecycle status of the entry.
    pub status: QueryStatus,
    /// The last successfully fetched data.
    pub data: Option<T>,
    /// The last error.
    pub error: Option<QueryError>,
    /// Whether a fetch is in flight.
    pub is_fetching: bool,
    /// Whether the data is stale.
    pub is_stale: bool,
    /// Failed attempts of the current fetch run.
    pub retry_count: u32,
    /// When the data was last fetched.
    pub updated_at: Option<Instant>,
}

impl<T> QueryResult<T> {
    /// Returns the data, if any.
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns `true` if the query is fetching without data to show.
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Pending)
    }

    /// Returns `true` if the last settled fetch succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    /// Returns `true` if the last settled fetch failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    /// Returns `true` if nothing has been fetched yet.
    pub const fn is_idle(&self) -> bool {
        matches!(self.status, QueryStatus::Idle)
    }

    /// Returns `true` if a background fetch runs while data is shown.
    pub const fn is_refetching(&self) -> bool {
        self.is_fetching && self.data.is_some()
    }

    /// Returns `true` if the query holds an outcome and nothing is in flight.
    pub const fn is_settled(&self) -> bool {
        !self.is_fetching && matches!(self.status, QueryStatus::Success | QueryStatus::Error)
    }
}

impl<T: Clone + 'static> QueryResult<T> {
    pub(crate) fn from_snapshot(snapshot: &EntrySnapshot) -> Self {
        let data = snapshot.data_as::<T>().cloned();
        if data.is_none() && snapshot.data.is_some() {
            warn!(key = %snapshot.key, "cached data has an unexpected type");
        }
        Self {
            status: snapshot.status,
            data,
            error: snapshot.error.clone(),
            is_fetching: snapshot.is_fetching,
            is_stale: snapshot.is_stale,
            retry_count: snapshot.retry_count,
            updated_at: snapshot.last_fetched_at,
        }
    }
}

/// A query binding: a key, the fetcher behind it, and per-query options.
///
/// Options that are not set fall back to the client's [`QueryConfig`](crate::QueryConfig).
/// When several bindings of one key coexist, the most recently bound one
/// supplies the fetcher and options.
///
/// # Example
///
/// ```rust,ignore
/// let query = Query::new(
///     query_key!["bookings", {"status": "New Bookings"}],
///     |cancel| Box::pin(async move { api.bookings("New Bookings", cancel).await }),
///     Arc::clone(&client),
/// )
/// .stale_time(Duration::from_secs(30));
/// ```
pub struct Query<V> {
    key: QueryKey,
    fetcher: ErasedFetcher,
    client: Arc<QueryClient>,
    stale_time: Option<Duration>,
    cache_time: Option<Duration>,
    retry: Option<RetryPolicy>,
    enabled: bool,
    _phantom: PhantomData<fn() -> V>,
}

impl<V> Query<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new query with the given key, fetcher, and client.
    ///
    /// # Arguments
    ///
    /// * `key` - Identifies the cached data
    /// * `fetcher` - An async function that fetches the data; it may stop early
    ///   once the token is cancelled
    /// * `client` - The query client for cache management
    pub fn new<F>(key: impl Into<QueryKey>, fetcher: F, client: Arc<QueryClient>) -> Self
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, Result<V, QueryError>> + Send + Sync + 'static,
    {
        let fetcher: ErasedFetcher = Arc::new(move |context: FetchContext| erase(fetcher(context.cancel)));
        Self::from_erased(key.into(), fetcher, client)
    }

    /// Creates a query whose fetcher needs the session token.
    ///
    /// The token is read from the client's session provider on every attempt.
    /// Without one the fetcher is not called and the query fails with
    /// [`QueryError::FetcherUnavailable`].
    pub fn with_session<F>(key: impl Into<QueryKey>, fetcher: F, client: Arc<QueryClient>) -> Self
    where
        F: Fn(BearerToken, CancellationToken) -> BoxFuture<'static, Result<V, QueryError>>
            + Send
            + Sync
            + 'static,
    {
        let fetcher: ErasedFetcher = Arc::new(move |context: FetchContext| match context.session {
            Some(token) => erase(fetcher(token, context.cancel)),
            None => future::ready(Err(QueryError::no_session())).boxed(),
        });
        Self::from_erased(key.into(), fetcher, client)
    }

    fn from_erased(key: QueryKey, fetcher: ErasedFetcher, client: Arc<QueryClient>) -> Self {
        Self {
            key,
            fetcher,
            client,
            stale_time: None,
            cache_time: None,
            retry: None,
            enabled: true,
            _phantom: PhantomData,
        }
    }

    /// Overrides how long fetched data stays fresh.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Overrides how long the entry is kept once unobserved.
    #[must_use]
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Disables automatic fetching on bind, e.g. while a key segment is not
    /// known yet. [`QueryObserver::refetch`] still fetches.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The key of this query.
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    pub(crate) fn options(&self) -> EntryOptions {
        let defaults = self.client.config();
        EntryOptions {
            fetcher: Some(Arc::clone(&self.fetcher)),
            stale_time: self.stale_time.unwrap_or(defaults.stale_time),
            cache_time: self.cache_time.unwrap_or(defaults.cache_time),
            retry: self.retry.unwrap_or(defaults.retry),
        }
    }

    /// Subscribes to the entry and starts a fetch if its data is stale or missing.
    pub fn bind(&self) -> QueryObserver<V> {
        let hash = self.client.configure(&self.key, self.options());
        let initial = self.client.store().get_or_create(&self.key);
        let (tx, rx) = watch::channel(QueryResult::from_snapshot(&initial));
        let tx = Arc::new(ResultSender {
            tx,
            version: AtomicU64::new(initial.version),
        });

        let sender = Arc::clone(&tx);
        let subscription = self
            .client
            .notifier()
            .subscribe(&self.key, move |snapshot| sender.publish(snapshot));

        if self.enabled {
            let stale = self
                .client
                .store()
                .get(&self.key)
                .is_some_and(|snapshot| snapshot.is_stale);
            if stale {
                self.client.coordinator().fetch(&hash, Trigger::Subscribe);
            }
        }
        if let Some(snapshot) = self.client.store().get(&self.key) {
            tx.publish(&snapshot);
        }

        QueryObserver {
            hash,
            key: self.key.clone(),
            client: Arc::clone(&self.client),
            rx,
            subscription,
        }
    }

    /// Binds the query and streams its results, starting with the current one.
    ///
    /// The binding lives as long as the stream.
    pub fn stream(&self) -> BoxStream<'static, QueryResult<V>> {
        self.bind().into_stream()
    }
}

impl<V> fmt::Debug for Query<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("retry", &self.retry)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Feeds an observer's channel, dropping snapshots older than the one it holds.
///
/// Listeners run outside the store lock, so a listener that writes to its own
/// key delivers the newer snapshot to later listeners before the outer
/// notification reaches them with the older one.
struct ResultSender<V> {
    tx: watch::Sender<QueryResult<V>>,
    version: AtomicU64,
}

impl<V: Clone + 'static> ResultSender<V> {
    fn publish(&self, snapshot: &EntrySnapshot) {
        // The channel's write lock serializes updates of `version`.
        self.tx.send_if_modified(|current| {
            if snapshot.version <= self.version.load(Ordering::Relaxed) {
                return false;
            }
            self.version.store(snapshot.version, Ordering::Relaxed);
            *current = QueryResult::from_snapshot(snapshot);
            true
        });
    }
}

fn erase<V: Send + Sync + 'static>(
    future: BoxFuture<'static, Result<V, QueryError>>,
) -> BoxFuture<'static, Result<AnyData, QueryError>> {
    future
        .map(|result| result.map(|data| Arc::new(data) as AnyData))
        .boxed()
}

/// A live, subscribed view of a query.
///
/// Dropping the observer (or calling [`unbind`](Self::unbind)) unsubscribes.
pub struct QueryObserver<V> {
    hash: String,
    key: QueryKey,
    client: Arc<QueryClient>,
    rx: watch::Receiver<QueryResult<V>>,
    subscription: Subscription,
}

impl<V> QueryObserver<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// The latest result.
    pub fn result(&self) -> QueryResult<V> {
        QueryResult::clone(&self.rx.borrow())
    }

    /// The key of the observed query.
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Waits for the next change and returns the new result.
    ///
    /// Returns `None` once the entry has been removed from the cache.
    pub async fn changed(&mut self) -> Option<QueryResult<V>> {
        self.rx.changed().await.ok()?;
        Some(QueryResult::clone(&self.rx.borrow_and_update()))
    }

    /// Waits until `predicate` holds for the current result.
    ///
    /// Returns `None` if the entry is removed first.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&QueryResult<V>) -> bool) -> Option<QueryResult<V>> {
        self.rx
            .wait_for(|result| predicate(result))
            .await
            .ok()
            .map(|result| QueryResult::clone(&result))
    }

    /// Fetches regardless of staleness, joining a fetch already in flight, and
    /// returns the result once it settles.
    pub async fn refetch(&self) -> QueryResult<V> {
        let done = self.client.coordinator().fetch(&self.hash, Trigger::Refetch);
        self.client.settle(&self.hash, done).await;
        self.result()
    }

    /// A stream of results, starting with the current one.
    ///
    /// The stream ends when the observer is dropped.
    pub fn stream(&self) -> WatchStream<QueryResult<V>> {
        WatchStream::new(self.rx.clone())
    }

    /// Turns the observer into a stream of results that keeps the binding alive.
    pub fn into_stream(mut self) -> BoxStream<'static, QueryResult<V>> {
        let first = QueryResult::clone(&self.rx.borrow_and_update());
        stream::once(future::ready(first))
            .chain(stream::unfold(self, |mut observer| async move {
                let next = observer.changed().await?;
                Some((next, observer))
            }))
            .boxed()
    }

    /// Unsubscribes now.
    pub fn unbind(self) {
        self.subscription.unsubscribe();
    }
}

impl<V> fmt::Debug for QueryObserver<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.key)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Semaphore;

    use super::*;
    use crate::config::QueryConfig;
    use crate::query_key;
    use crate::session::SessionStore;

    fn result(status: QueryStatus, data: Option<i32>, is_fetching: bool) -> QueryResult<i32> {
        QueryResult {
            status,
            data,
            error: None,
            is_fetching,
            is_stale: false,
            retry_count: 0,
            updated_at: None,
        }
    }

    #[test]
    fn test_query_result_predicates() {
        let loading = result(QueryStatus::Pending, None, true);
        assert!(loading.is_loading());
        assert!(!loading.is_refetching());
        assert!(!loading.is_settled());

        let refetching = result(QueryStatus::Success, Some(1), true);
        assert!(refetching.is_success());
        assert!(refetching.is_refetching());
        assert!(!refetching.is_settled());
        assert_eq!(refetching.data(), Some(&1));

        let failed = result(QueryStatus::Error, None, false);
        assert!(failed.is_error());
        assert!(failed.is_settled());
        assert!(result(QueryStatus::Idle, None, false).is_idle());
    }

    #[tokio::test]
    async fn test_bind_fetches_and_updates_observer() {
        let client = Arc::new(QueryClient::new());
        let gate = Arc::new(Semaphore::new(0));
        let permits = Arc::clone(&gate);
        let query = Query::new(
            query_key!["vendors"],
            move |_cancel| {
                let gate = Arc::clone(&permits);
                async move {
                    let _permit = gate.acquire().await.map_err(QueryError::fetch)?;
                    Ok::<_, QueryError>(vec!["acme".to_string()])
                }
                .boxed()
            },
            Arc::clone(&client),
        );

        let mut observer = query.bind();
        let pending = observer.result();
        assert!(pending.is_loading());
        assert!(pending.is_fetching);

        gate.add_permits(1);
        let settled = observer.wait_for(QueryResult::is_settled).await.expect("entry alive");
        assert!(settled.is_success());
        assert_eq!(settled.data(), Some(&vec!["acme".to_string()]));
        assert_eq!(settled.retry_count, 0);
        assert!(settled.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_disabled_query_waits_for_refetch() {
        let client = Arc::new(QueryClient::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = Query::new(
            query_key!["getUser", null],
            move |_cancel| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, QueryError>(7) }.boxed()
            },
            Arc::clone(&client),
        )
        .enabled(false);

        let observer = query.bind();
        assert!(observer.result().is_idle());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let result = observer.refetch().await;
        assert_eq!(result.data(), Some(&7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_data_is_not_refetched_on_bind() {
        let client = Arc::new(QueryClient::with_config(
            QueryConfig::default().with_stale_time(Duration::from_secs(60)),
        ));
        client.set_query_data(["administrators"], 3_u32);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = Query::new(
            "administrators",
            move |_cancel| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, QueryError>(4_u32) }.boxed()
            },
            Arc::clone(&client),
        );

        let observer = query.bind();
        let result = observer.result();
        assert!(result.is_success());
        assert!(!result.is_fetching);
        assert_eq!(result.data(), Some(&3));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_authenticated_query_without_session() {
        let session = Arc::new(SessionStore::new());
        let client = Arc::new(QueryClient::with_session(QueryConfig::default(), Arc::clone(&session)));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = Query::with_session(
            query_key!["transactions"],
            move |token: BearerToken, _cancel| {
                counter.fetch_add(1, Ordering::SeqCst);
                let header = token.authorization();
                async move { Ok::<_, QueryError>(header) }.boxed()
            },
            Arc::clone(&client),
        );

        let mut observer = query.bind();
        let failed = observer.wait_for(QueryResult::is_settled).await.expect("entry alive");
        assert_eq!(failed.error, Some(QueryError::no_session()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        session.sign_in(BearerToken::new("t0k"));
        let result = observer.refetch().await;
        assert!(result.is_success());
        assert!(result.error.is_none());
        assert_eq!(result.data(), Some(&"Bearer t0k".to_string()));
    }

    #[tokio::test]
    async fn test_into_stream_yields_current_then_changes() {
        let client = Arc::new(QueryClient::new());
        let query = Query::new(
            "withdrawals",
            |_cancel| async { Ok::<_, QueryError>(10_u64) }.boxed(),
            Arc::clone(&client),
        );

        let mut results = query.stream();
        let mut last = results.next().await.expect("first result");
        while !last.is_settled() {
            last = results.next().await.expect("next result");
        }
        assert_eq!(last.data(), Some(&10));
    }

    #[tokio::test]
    async fn test_observer_stream_follows_fetch() {
        let client = Arc::new(QueryClient::new());
        let query = Query::new(
            "vendors",
            |_cancel| async { Ok::<_, QueryError>(vec!["acme".to_string()]) }.boxed(),
            Arc::clone(&client),
        );

        let observer = query.bind();
        let mut results = observer.stream();
        let first = results.next().await.expect("current result");
        assert!(first.is_loading());

        let mut last = first;
        while !last.is_settled() {
            last = results.next().await.expect("next result");
        }
        assert_eq!(last.data(), Some(&vec!["acme".to_string()]));
        assert_eq!(observer.result().data(), last.data());
    }

    #[tokio::test(start_paused = true)]
    async fn test_into_stream_does_not_repeat_first_result() {
        let client = Arc::new(QueryClient::with_config(
            QueryConfig::default().with_stale_time(Duration::from_secs(60)),
        ));
        client.set_query_data("administrators", 2_u32);
        let query = Query::new(
            "administrators",
            |_cancel| async { Ok::<_, QueryError>(3_u32) }.boxed(),
            Arc::clone(&client),
        );

        let mut results = query.bind().into_stream();
        assert_eq!(results.next().await.expect("first result").data(), Some(&2));
        let repeated = tokio::time::timeout(Duration::from_secs(1), results.next()).await;
        assert!(repeated.is_err());
    }

    #[tokio::test]
    async fn test_reentrant_listener_does_not_leave_observer_behind() {
        let client = Arc::new(QueryClient::with_config(
            QueryConfig::default().with_stale_time(Duration::from_secs(60)),
        ));
        let key = query_key!["bookings"];

        // Clamps every write below 10 up to 10 from inside the notification.
        let writer = Arc::clone(&client);
        let _clamp = client.notifier().subscribe(&key, move |snapshot| {
            if snapshot.data_as::<i32>().is_some_and(|count| *count < 10) {
                writer.set_query_data(["bookings"], 10);
            }
        });
        let query = Query::new(
            key.clone(),
            |_cancel| async { Ok::<_, QueryError>(0) }.boxed(),
            Arc::clone(&client),
        )
        .enabled(false);
        let observer = query.bind();

        client.set_query_data(["bookings"], 1);

        assert_eq!(client.get_query_data::<i32>(key), Some(10));
        assert_eq!(observer.result().data(), Some(&10));
    }

    #[tokio::test]
    async fn test_removed_entry_ends_observer() {
        let client = Arc::new(QueryClient::new());
        let query = Query::new(
            "withdrawals",
            |_cancel| async { Ok::<_, QueryError>(1_u8) }.boxed(),
            Arc::clone(&client),
        );
        let mut observer = query.bind();
        observer.wait_for(QueryResult::is_settled).await.expect("entry alive");

        assert_eq!(client.remove_queries("withdrawals"), 1);
        assert!(observer.changed().await.is_none());
    }
}
