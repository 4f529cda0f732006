//! Mutations: one-off writes that invalidate cached queries on success.
//!
//! Unlike queries, mutations are not cached or deduplicated. Each call to
//! [`Mutation::mutate`] starts an independent [`MutationOp`] whose state moves
//! from `Pending` to `Success` or `Error`. On success every declared key prefix
//! is invalidated before the operation settles, so subscribed queries refetch.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures::FutureExt;
//! use quarry::{Mutation, QueryClient, QueryError};
//!
//! # async fn demo() -> Result<(), QueryError> {
//! let client = Arc::new(QueryClient::new());
//! let approve = Mutation::new(
//!     |booking_id: String| async move { Ok::<_, QueryError>(booking_id) }.boxed(),
//!     Arc::clone(&client),
//! )
//! .invalidates("bookings");
//!
//! let approved = approve.run("b-42".to_string()).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::watch;
use tracing::debug;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::session::BearerToken;

static NEXT_MUTATION_ID: AtomicU64 = AtomicU64::new(1);

type Mutator<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, QueryError>> + Send + Sync>;
type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// The state of a mutation operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MutationState<T> {
    /// Mutation is idle (not yet started).
    #[default]
    Idle,
    /// Mutation is in progress.
    Pending,
    /// Mutation succeeded with a result.
    Success(T),
    /// Mutation failed with an error.
    Error(QueryError),
}

impl<T> MutationState<T> {
    /// Returns the result data if the mutation succeeded, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the error if the mutation failed, otherwise `None`.
    pub const fn error(&self) -> Option<&QueryError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` if the mutation is in progress.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// A mutation for performing data modifications (create, update, delete).
///
/// Mutations are never retried. A failed mutation invalidates nothing and its
/// error is reported only on the [`MutationOp`], never on a query entry.
///
/// # Example
///
/// ```rust,ignore
/// let delete_vendor = Mutation::with_session(
///     |token, vendor_id: String| Box::pin(async move {
///         api.delete_vendor(&token, &vendor_id).await
///     }),
///     Arc::clone(&client),
/// )
/// .invalidates("vendors")
/// .on_success(|_| toast("Vendor deleted"))
/// .on_error(|err| toast(&err.to_string()));
/// ```
pub struct Mutation<I, O> {
    mutator: Mutator<I, O>,
    client: Arc<QueryClient>,
    invalidates: Vec<QueryKey>,
    on_success: Option<Callback<O>>,
    on_error: Option<Callback<QueryError>>,
}

impl<I, O> Mutation<I, O>
where
    I: Send + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Creates a mutation from an async function.
    ///
    /// # Arguments
    ///
    /// * `mutator` - An async function that performs the mutation
    /// * `client` - The query client whose queries are invalidated on success
    pub fn new<F>(mutator: F, client: Arc<QueryClient>) -> Self
    where
        F: Fn(I) -> BoxFuture<'static, Result<O, QueryError>> + Send + Sync + 'static,
    {
        Self::from_mutator(Arc::new(mutator), client)
    }

    /// Creates a mutation that needs the session token.
    ///
    /// The token is read when the mutation is invoked. Without one the mutator
    /// is not called and the operation fails with
    /// [`QueryError::FetcherUnavailable`].
    pub fn with_session<F>(mutator: F, client: Arc<QueryClient>) -> Self
    where
        F: Fn(BearerToken, I) -> BoxFuture<'static, Result<O, QueryError>> + Send + Sync + 'static,
    {
        let session = Arc::clone(client.session());
        let mutator: Mutator<I, O> = Arc::new(move |input| match session.bearer_token() {
            Some(token) => mutator(token, input),
            None => future::ready(Err(QueryError::no_session())).boxed(),
        });
        Self::from_mutator(mutator, client)
    }

    fn from_mutator(mutator: Mutator<I, O>, client: Arc<QueryClient>) -> Self {
        Self {
            mutator,
            client,
            invalidates: Vec::new(),
            on_success: None,
            on_error: None,
        }
    }

    /// Adds a key prefix to invalidate after every successful invocation.
    #[must_use]
    pub fn invalidates(mut self, prefix: impl Into<QueryKey>) -> Self {
        self.invalidates.push(prefix.into());
        self
    }

    /// Runs `callback` after a successful invocation has invalidated its prefixes.
    #[must_use]
    pub fn on_success(mut self, callback: impl Fn(&O) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Runs `callback` after a failed invocation.
    #[must_use]
    pub fn on_error(mut self, callback: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Starts the mutation in a background task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn mutate(&self, input: I) -> MutationOp<O> {
        let id = NEXT_MUTATION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(MutationState::Pending);

        let future = (self.mutator)(input);
        let client = Arc::clone(&self.client);
        let invalidates = self.invalidates.clone();
        let on_success = self.on_success.clone();
        let on_error = self.on_error.clone();

        debug!(mutation = id, "mutation started");
        tokio::spawn(async move {
            match future.await {
                Ok(output) => {
                    for prefix in &invalidates {
                        client.invalidate_queries(prefix);
                    }
                    debug!(mutation = id, invalidated = invalidates.len(), "mutation succeeded");
                    tx.send_replace(MutationState::Success(output.clone()));
                    if let Some(callback) = on_success {
                        callback(&output);
                    }
                }
                Err(err) => {
                    debug!(mutation = id, %err, "mutation failed");
                    tx.send_replace(MutationState::Error(err.clone()));
                    if let Some(callback) = on_error {
                        callback(&err);
                    }
                }
            }
        });

        MutationOp { id, rx }
    }

    /// Runs the mutation and waits for its outcome.
    ///
    /// # Errors
    ///
    /// Returns the mutator's error, or [`QueryError::Cancelled`] if the task
    /// was torn down before settling.
    pub async fn run(&self, input: I) -> Result<O, QueryError> {
        self.mutate(input).settled().await
    }
}

impl<I, O> fmt::Debug for Mutation<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("invalidates", &self.invalidates)
            .finish_non_exhaustive()
    }
}

/// One invocation of a [`Mutation`].
#[derive(Debug, Clone)]
pub struct MutationOp<O> {
    id: u64,
    rx: watch::Receiver<MutationState<O>>,
}

impl<O: Clone> MutationOp<O> {
    /// Identifier of this invocation, unique within the process.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The current state.
    pub fn state(&self) -> MutationState<O> {
        MutationState::clone(&self.rx.borrow())
    }

    /// Waits until the operation settles.
    ///
    /// # Errors
    ///
    /// Returns the mutator's error, or [`QueryError::Cancelled`] if the task
    /// was torn down before settling.
    pub async fn settled(&self) -> Result<O, QueryError> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|state| !state.is_pending())
            .await
            .map_err(|_| QueryError::Cancelled)?;
        match &*state {
            MutationState::Success(output) => Ok(output.clone()),
            MutationState::Error(err) => Err(err.clone()),
            MutationState::Idle | MutationState::Pending => Err(QueryError::Cancelled),
        }
    }
}
