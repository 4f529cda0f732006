//! Prelude module for convenient imports.
//!
//! ```
//! use quarry::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The cache and its operations
//! - [`Query`], [`QueryObserver`], [`QueryResult`] - Bindings and their live views
//! - [`Mutation`], [`MutationOp`], [`MutationState`] - Writes that invalidate queries
//! - [`QueryKey`] and [`query_key!`](crate::query_key) - Structured keys
//! - [`QueryConfig`], [`RetryPolicy`] - Configuration
//! - [`QueryError`] - The error type

pub use crate::client::QueryClient;
pub use crate::config::{QueryConfig, RetryPolicy};
pub use crate::error::QueryError;
pub use crate::key::QueryKey;
pub use crate::mutation::{Mutation, MutationOp, MutationState};
pub use crate::query::{Query, QueryObserver, QueryResult};
pub use crate::query_key;
pub use crate::session::{BearerToken, SessionProvider, SessionStore};
pub use tokio_util::sync::CancellationToken;
