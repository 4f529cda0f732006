//! Error types shared by queries and mutations.

use std::fmt;

use thiserror::Error;

/// Error type for query and mutation operations.
///
/// Errors never cross the cache boundary as panics: queries record them on
/// their cache entry and mutations on their [`MutationOp`](crate::MutationOp).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The fetcher ran and failed. Retried according to the query's
    /// [`RetryPolicy`](crate::RetryPolicy).
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// The fetcher could not be constructed, typically because there is no
    /// session token. Terminal, never retried.
    #[error("Fetcher unavailable: {0}")]
    FetcherUnavailable(String),

    /// A mutation function failed.
    #[error("Mutation failed: {0}")]
    Mutation(String),

    /// The cache entry was removed or invalidated before the awaited fetch settled.
    #[error("Query was cancelled before it settled")]
    Cancelled,

    /// Cached data under this key was stored with a different type than requested.
    #[error("Cached data for {0} has an unexpected type")]
    TypeMismatch(String),
}

impl QueryError {
    /// Creates a [`QueryError::Fetch`] from any displayable error.
    pub fn fetch(err: impl fmt::Display) -> Self {
        Self::Fetch(err.to_string())
    }

    /// Creates a [`QueryError::Mutation`] from any displayable error.
    pub fn mutation(err: impl fmt::Display) -> Self {
        Self::Mutation(err.to_string())
    }

    pub(crate) fn no_session() -> Self {
        Self::FetcherUnavailable("no session token".to_string())
    }

    /// Returns `true` if a failed attempt with this error may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Mutation(_))
    }
}
