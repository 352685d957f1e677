//! Layer Error Types
//!
//! This module defines the error taxonomy for the rowgate layer.
//!
//! ## Error Categories
//!
//! ### Caller-fault (terminal, never retried)
//! - `TenantNotFound`: unknown tenant id
//! - `TenantDisabled`: tenant exists but is switched off
//! - `Invalid`: malformed payload rejected by the remote store
//!
//! ### Admission (terminal for this call, caller retries later)
//! - `Throttled`: rate limiter rejected the call; carries a `retry_after` hint
//!
//! ### Internal-retry (retried inside the layer, surfaced only on exhaustion)
//! - `ConnectionFailed`: could not open the tenant's backing document
//! - `QuotaExceeded` / `Unavailable`: remote store transient failures
//!
//! Every operation returns `Result<T>` aliased to `Result<T, Error>` so `?`
//! propagation stays clean. `http_status()` gives route handlers a stable
//! status mapping without inspecting variants themselves.

use crate::remote::RemoteError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Tenant disabled: {0}")]
    TenantDisabled(String),

    #[error("Throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("Connection to backing document failed: {0}")]
    ConnectionFailed(String),

    #[error("Remote quota exceeded after retries: {0}")]
    QuotaExceeded(String),

    #[error("Remote store unavailable after retries: {0}")]
    Unavailable(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Service is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Stable HTTP status mapping for route handlers.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Invalid(_) => 400,
            Error::TenantDisabled(_) => 403,
            Error::TenantNotFound(_) => 404,
            Error::Throttled { .. } => 429,
            Error::ConnectionFailed(_)
            | Error::QuotaExceeded(_)
            | Error::Unavailable(_)
            | Error::ShuttingDown => 502,
        }
    }

    /// Convert a terminal remote error into the surfaced layer error.
    ///
    /// Used after internal retries are exhausted (or skipped, for
    /// non-transient errors).
    pub fn from_remote(err: RemoteError) -> Self {
        match err {
            RemoteError::QuotaExceeded(m) => Error::QuotaExceeded(m),
            RemoteError::Unavailable(m) => Error::Unavailable(m),
            RemoteError::Timeout(m) => Error::Unavailable(format!("timed out: {m}")),
            RemoteError::Invalid(m) => Error::Invalid(m),
            RemoteError::Auth(m) => Error::ConnectionFailed(format!("auth: {m}")),
            RemoteError::NotFound(m) => Error::ConnectionFailed(format!("not found: {m}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::Invalid("x".into()).http_status(), 400);
        assert_eq!(Error::TenantDisabled("t".into()).http_status(), 403);
        assert_eq!(Error::TenantNotFound("t".into()).http_status(), 404);
        assert_eq!(
            Error::Throttled {
                retry_after: Duration::from_secs(1)
            }
            .http_status(),
            429
        );
        assert_eq!(Error::Unavailable("x".into()).http_status(), 502);
        assert_eq!(Error::ConnectionFailed("x".into()).http_status(), 502);
    }

    #[test]
    fn test_from_remote_classification() {
        assert!(matches!(
            Error::from_remote(RemoteError::QuotaExceeded("q".into())),
            Error::QuotaExceeded(_)
        ));
        assert!(matches!(
            Error::from_remote(RemoteError::Timeout("t".into())),
            Error::Unavailable(_)
        ));
        assert!(matches!(
            Error::from_remote(RemoteError::Invalid("bad".into())),
            Error::Invalid(_)
        ));
        assert!(matches!(
            Error::from_remote(RemoteError::Auth("denied".into())),
            Error::ConnectionFailed(_)
        ));
    }
}
