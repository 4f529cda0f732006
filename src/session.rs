//! Session capability injected into the [`QueryClient`](crate::QueryClient).
//!
//! Authenticated fetchers and mutators receive a [`BearerToken`] taken from the
//! client's [`SessionProvider`] at the moment they run. Without a token they are
//! never invoked; the query or mutation fails with
//! [`QueryError::FetcherUnavailable`](crate::QueryError::FetcherUnavailable).

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// An opaque bearer token. Its `Debug` output never contains the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(Arc<str>);

impl BearerToken {
    /// Wraps a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into().into())
    }

    /// The raw token.
    pub fn secret(&self) -> &str {
        &self.0
    }

    /// The value of an `Authorization` header carrying this token.
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

/// Source of the current session token.
pub trait SessionProvider: Send + Sync {
    /// Returns the current token, or `None` when signed out.
    fn bearer_token(&self) -> Option<BearerToken>;
}

impl<T: SessionProvider + ?Sized> SessionProvider for Arc<T> {
    fn bearer_token(&self) -> Option<BearerToken> {
        (**self).bearer_token()
    }
}

/// A provider that never has a token.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSession;

impl SessionProvider for NoSession {
    fn bearer_token(&self) -> Option<BearerToken> {
        None
    }
}

/// A provider whose token can be set on sign-in and cleared on sign-out.
#[derive(Debug, Default)]
pub struct SessionStore {
    token: RwLock<Option<BearerToken>>,
}

impl SessionStore {
    /// Creates a signed-out store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already signed in with `token`.
    #[must_use]
    pub fn signed_in(token: BearerToken) -> Self {
        Self {
            token: RwLock::new(Some(token)),
        }
    }

    /// Stores `token` as the current session.
    pub fn sign_in(&self, token: BearerToken) {
        *self.token.write() = Some(token);
    }

    /// Clears the current session.
    pub fn sign_out(&self) {
        *self.token.write() = None;
    }

    /// Returns `true` if a token is present.
    pub fn is_signed_in(&self) -> bool {
        self.token.read().is_some()
    }
}

impl SessionProvider for SessionStore {
    fn bearer_token(&self) -> Option<BearerToken> {
        self.token.read().clone()
    }
}
