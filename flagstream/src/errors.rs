//! Error types surfaced by the SDK.
//!
//! Construction-time validation is the only place the SDK returns errors to
//! the caller; steady-state operations degrade to default values and log.

use thiserror::Error;

/// Errors raised while constructing a client or a user.
#[derive(Debug, Error)]
pub enum Error {
    /// The environment secret is empty or contains non-ASCII bytes.
    #[error("env secret is invalid")]
    InvalidEnvSecret,

    /// The streaming or event URL is not an absolute URL with scheme and host.
    #[error("streaming or event url is invalid")]
    InvalidUrl,

    /// A user was built without a non-empty key or name.
    #[error("user is not valid: {0}")]
    InvalidUser(&'static str),

    /// The HTTP transport could not be constructed from the configuration
    /// (bad proxy URL, unreadable certificate, invalid TLS material).
    #[error("http transport is invalid: {0}")]
    InvalidHttpTransport(String),
}

/// Failure reported by a [`crate::store::DataStore`] implementation.
///
/// The built-in in-memory store never fails; custom stores surface their
/// backend errors through this type and the update-status provider converts
/// them into an INTERRUPTED state transition.
#[derive(Debug, Clone, Error)]
#[error("data store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
