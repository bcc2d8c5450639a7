//! Credential supply.
//!
//! The client asks a [`TokenProvider`] for a fresh credential before every
//! connection attempt. `None` means "not authenticated": the attempt stops with
//! [`GatewayError::CredentialUnavailable`](crate::GatewayError::CredentialUnavailable)
//! and is not retried automatically.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;

/// Supplies short-lived credentials on demand.
pub trait TokenProvider: Send + Sync + 'static {
    /// Fetch a credential. May be slow; the client applies its own timeout.
    fn token(&self) -> BoxFuture<'_, Option<String>>;
}

impl<F, Fut> TokenProvider for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    fn token(&self) -> BoxFuture<'_, Option<String>> {
        self().boxed()
    }
}

/// A fixed credential, e.g. from the command line.
#[derive(Clone)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Always supply `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// Never supply a credential.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = if self.0.is_some() { "<redacted>" } else { "<none>" };
        f.debug_tuple("StaticToken").field(&shown).finish()
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> BoxFuture<'_, Option<String>> {
        let token = self.0.clone();
        async move { token }.boxed()
    }
}
