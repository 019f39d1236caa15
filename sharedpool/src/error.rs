use std::error;

use crate::registry::PoolId;

/// A type-erased error coming from a driver or a pool provider.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// sharedpool's error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool configuration is missing a required key or holds an invalid value.
    #[error("invalid pool configuration: {0}")]
    Config(String),
    /// The pool provider failed to create or destroy a pool.
    #[error("pool provider failed: {0}")]
    Provider(#[source] BoxError),
    /// No connection became available before the checkout timeout elapsed.
    #[error("timed out waiting for a pooled connection")]
    TimedOut,
    /// The driver failed to open or validate a connection.
    #[error("driver error: {0}")]
    Driver(#[source] BoxError),
    /// No pool is registered under the given identifier.
    #[error("no pool registered under `{0}`")]
    NotFound(PoolId),
    /// The client or pool has already been closed.
    #[error("client has already been closed")]
    AlreadyClosed,
}

impl Error {
    /// Wraps a driver error.
    pub fn driver<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Driver(error.into())
    }

    /// Wraps a provider error.
    pub fn provider<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Provider(error.into())
    }

    /// Returns true for the errors that `Client::close` and friends treat as
    /// no-ops.
    pub fn is_idempotent_close(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::AlreadyClosed)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Config(error.to_string())
    }
}
