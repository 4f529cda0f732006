//! Fetch coordination: single-flight, retries with backoff, and cancellation.
//!
//! At most one fetch runs per cache entry. A fetch is identified by a
//! generation number taken from the store when it starts; its result is only
//! written back if the entry still exists, still points at that generation,
//! and the fetch's [`CancellationToken`] has not been signalled. Anything else
//! is a stale result and is dropped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::{AnyData, CacheEntry, EntryStore};
use crate::config::RetryPolicy;
use crate::error::QueryError;
use crate::session::{BearerToken, SessionProvider};
use crate::subscription::Notifier;

/// A type-erased fetcher, as stored on a cache entry.
pub(crate) type ErasedFetcher =
    Arc<dyn Fn(FetchContext) -> BoxFuture<'static, Result<AnyData, QueryError>> + Send + Sync>;

/// Completion handle of an in-flight fetch. Joining callers await a clone.
pub(crate) type FetchDone = Shared<BoxFuture<'static, ()>>;

/// Per-attempt input handed to an erased fetcher.
pub(crate) struct FetchContext {
    pub(crate) cancel: CancellationToken,
    pub(crate) session: Option<BearerToken>,
}

/// The single outstanding fetch of an entry.
pub(crate) struct InFlight {
    pub(crate) generation: u64,
    pub(crate) token: CancellationToken,
    pub(crate) done: FetchDone,
}

/// What caused a fetch to be requested. Only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Subscribe,
    Refetch,
    Invalidate,
    Prefetch,
}

#[derive(Clone)]
pub(crate) struct FetchCoordinator {
    store: Arc<EntryStore>,
    session: Arc<dyn SessionProvider>,
}

impl FetchCoordinator {
    pub(crate) fn new(store: Arc<EntryStore>, session: Arc<dyn SessionProvider>) -> Self {
        Self { store, session }
    }

    /// Starts a fetch for the entry `hash`, or joins the one already in flight.
    ///
    /// Returns `None` if the entry does not exist or has no fetcher bound.
    pub(crate) fn fetch(&self, hash: &str, trigger: Trigger) -> Option<FetchDone> {
        let (done, started) = self
            .store
            .with_entry(hash, |entry| {
                if let Some(in_flight) = &entry.in_flight {
                    trace!(key = %entry.key, ?trigger, "joining in-flight fetch");
                    return Some((in_flight.done.clone(), false));
                }
                let fetcher = entry.options.fetcher.clone()?;
                let generation = self.store.next_generation();
                let token = CancellationToken::new();
                let run = FetchRun {
                    store: Arc::downgrade(&self.store),
                    session: Arc::clone(&self.session),
                    hash: hash.to_owned(),
                    generation,
                    token: token.clone(),
                    fetcher,
                    retry: entry.options.retry,
                    supervised: entry.subscriber_count() > 0,
                };
                let done = run.execute().boxed().shared();
                entry.begin_fetch(InFlight {
                    generation,
                    token,
                    done: done.clone(),
                });
                debug!(key = %entry.key, generation, ?trigger, "starting fetch");
                Some((done, true))
            })
            .flatten()?;

        if started {
            Notifier::new(Arc::clone(&self.store)).notify_hash(hash);
            tokio::spawn(done.clone());
        }
        Some(done)
    }
}

/// One fetch run of one entry, including its retries.
struct FetchRun {
    store: Weak<EntryStore>,
    session: Arc<dyn SessionProvider>,
    hash: String,
    generation: u64,
    token: CancellationToken,
    fetcher: ErasedFetcher,
    retry: RetryPolicy,
    /// The entry had subscribers when the run started; retries stop once they are gone.
    supervised: bool,
}

impl FetchRun {
    async fn execute(self) {
        let mut attempt = 0;
        loop {
            let context = FetchContext {
                cancel: self.token.clone(),
                session: self.session.bearer_token(),
            };
            let outcome = tokio::select! {
                () = self.token.cancelled() => None,
                outcome = self.attempt(context) => Some(outcome),
            };

            let error = match outcome {
                None => {
                    debug!(key = %self.hash, generation = self.generation, "fetch cancelled");
                    return;
                }
                Some(Ok(data)) => {
                    self.apply(|entry| entry.settle_success(data, Instant::now()));
                    return;
                }
                Some(Err(error)) => error,
            };

            if !error.is_retryable() || attempt >= self.retry.max_retries {
                debug!(key = %self.hash, attempts = attempt + 1, %error, "fetch failed");
                self.apply(|entry| {
                    entry.record_failure();
                    entry.settle_error(error);
                });
                return;
            }

            if !self.apply(CacheEntry::record_failure) {
                return;
            }
            let delay = self.retry.delay_for(attempt);
            debug!(key = %self.hash, attempt, ?delay, %error, "fetch failed, retrying");
            tokio::select! {
                () = self.token.cancelled() => {
                    debug!(key = %self.hash, generation = self.generation, "fetch cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            if self.abandoned() {
                debug!(key = %self.hash, "no subscribers left, abandoning retries");
                self.apply(|entry| entry.settle_error(error));
                return;
            }
            attempt += 1;
        }
    }

    /// Runs the fetcher once. A panic inside it fails the attempt instead of
    /// tearing down the run, which would leave the entry in flight forever.
    async fn attempt(&self, context: FetchContext) -> Result<AnyData, QueryError> {
        AssertUnwindSafe(async { (self.fetcher)(context).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(QueryError::fetch(panic_message(payload.as_ref()))))
    }

    fn abandoned(&self) -> bool {
        self.supervised
            && self
                .store
                .upgrade()
                .and_then(|store| store.with_entry(&self.hash, |entry| entry.subscriber_count()))
                == Some(0)
    }

    /// Applies `f` if this run is still the entry's current fetch, then notifies
    /// subscribers. Returns `false` for a stale result.
    fn apply(&self, f: impl FnOnce(&mut CacheEntry)) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let applied = store
            .with_entry(&self.hash, |entry| {
                if self.token.is_cancelled() || !entry.is_current(self.generation) {
                    return false;
                }
                f(entry);
                true
            })
            .unwrap_or(false);

        if applied {
            Notifier::new(store).notify_hash(&self.hash);
        } else {
            debug!(key = %self.hash, generation = self.generation, "discarding stale fetch result");
        }
        applied
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic");
    format!("fetcher panicked: {message}")
}
