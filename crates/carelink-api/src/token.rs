// Bearer credential access.
//
// The portal owns the auth lifecycle (login, refresh, logout); this
// crate only asks "what is the current token, if any". Every REST call
// and every WebSocket connect goes through a `TokenProvider`.

use secrecy::SecretString;

/// Supplies the current bearer credential.
///
/// Implementations are expected to be cheap to call -- the channel layer
/// consults the provider on every reconnect attempt.
pub trait TokenProvider: Send + Sync {
    /// The current bearer token, or `None` when the user is signed out.
    fn token(&self) -> Option<SecretString>;
}

/// A fixed token that never changes.
///
/// Useful for tests and for deployments that manage refresh externally.
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }
}
