//! # Quarry - keyed async query cache
//!
//! Quarry keeps server state on the client: the results of asynchronous
//! fetches, cached under structured [`QueryKey`]s, deduplicated while in flight,
//! revalidated when stale and invalidated by key prefix after mutations. It is
//! built on [Tokio](https://tokio.rs/) and modeled after TanStack Query.
//!
//! ## Architecture
//!
//! 1. **Key Codec** ([`key`]): canonical encoding and prefix matching of keys
//! 2. **Entry Store** ([`cache`]): one entry per key with data, error and status
//! 3. **Fetch Coordinator**: single-flight fetches with retry and cancellation
//! 4. **Notifier** ([`subscription`]): per-key listeners and garbage collection
//! 5. **Mutations** ([`mutation`]): one-off writes that invalidate queries
//! 6. **Client** ([`client`], [`query`]): the facade tying it together
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use futures::FutureExt;
//! use quarry::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client = Arc::new(QueryClient::new());
//!
//! let bookings = Query::new(
//!     query_key!["bookings", {"status": "New Bookings"}],
//!     |_cancel| async { Ok::<_, QueryError>(vec!["b-1".to_string()]) }.boxed(),
//!     Arc::clone(&client),
//! );
//!
//! let mut observer = bookings.bind();
//! let result = observer.wait_for(QueryResult::is_settled).await.unwrap();
//! assert_eq!(result.data(), Some(&vec!["b-1".to_string()]));
//!
//! let approve = Mutation::new(
//!     |id: String| async move { Ok::<_, QueryError>(id) }.boxed(),
//!     Arc::clone(&client),
//! )
//! .invalidates("bookings");
//! approve.run("b-1".to_string()).await.unwrap();
//! # }
//! ```
//!
//! ## Design Inspiration
//!
//! The staleness, garbage collection and invalidation model follows
//! [TanStack Query](https://tanstack.com/query).

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
mod fetch;
pub mod key;
pub mod mutation;
pub mod prelude;
pub mod query;
pub mod session;
pub mod subscription;

pub use cache::{AnyData, EntrySnapshot, EntryStore, QueryStatus};
pub use client::QueryClient;
pub use config::{QueryConfig, RetryPolicy};
pub use error::QueryError;
pub use futures::future::BoxFuture;
pub use key::QueryKey;
pub use mutation::{Mutation, MutationOp, MutationState};
pub use query::{Query, QueryObserver, QueryResult};
pub use session::{BearerToken, NoSession, SessionProvider, SessionStore};
pub use subscription::{Notifier, Subscription};
pub use tokio_util::sync::CancellationToken;

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
