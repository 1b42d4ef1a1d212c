//! Crate-wide error taxonomy.
//!
//! Every public operation in the core either succeeds or returns exactly one
//! of these kinds with a human-readable message. The numeric codes are part
//! of the external ABI and must never change.

use thiserror::Error;

/// Closed set of failure kinds surfaced by the core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable numeric code for the FFI boundary. `0` is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 1,
            Error::Database(_) => 2,
            Error::Io(_) => 3,
            Error::NotFound(_) => 4,
            Error::AlreadyExists(_) => 5,
            Error::AuthFailed(_) => 6,
            Error::Network(_) => 7,
            Error::Busy(_) => 8,
            Error::Internal(_) => 99,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".into()),
            other => Error::Database(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::InvalidArgument("x".into()).code(), 1);
        assert_eq!(Error::Database("x".into()).code(), 2);
        assert_eq!(Error::Io("x".into()).code(), 3);
        assert_eq!(Error::NotFound("x".into()).code(), 4);
        assert_eq!(Error::AlreadyExists("x".into()).code(), 5);
        assert_eq!(Error::AuthFailed("x".into()).code(), 6);
        assert_eq!(Error::Network("x".into()).code(), 7);
        assert_eq!(Error::Busy("x".into()).code(), 8);
        assert_eq!(Error::Internal("x".into()).code(), 99);
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), 4);
    }
}
