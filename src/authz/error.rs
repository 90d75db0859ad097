//! Provider error taxonomy
//!
//! Every failure crossing the provider boundary is classified once into a
//! [`ProviderErrorKind`]. The sync engine branches on the kind only.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of provider failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// The code host returned 404 for the resource
    NotFound,
    /// Credential rejected or revoked
    Unauthorized,
    /// Credential valid but lacks access
    Forbidden,
    /// The account has been suspended on the code host
    AccountSuspended,
    /// The provider does not support this capability
    Unimplemented,
    /// Likely transient: deadline, network, rate limit, 5xx
    Temporary,
    /// Anything else
    Other,
}

/// Error returned by an [`AuthzProvider`](super::AuthzProvider) call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new<S: Into<String>>(kind: ProviderErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(ProviderErrorKind::NotFound, message)
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::new(ProviderErrorKind::Unauthorized, message)
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::new(ProviderErrorKind::Forbidden, message)
    }

    pub fn account_suspended<S: Into<String>>(message: S) -> Self {
        Self::new(ProviderErrorKind::AccountSuspended, message)
    }

    pub fn unimplemented<S: Into<String>>(message: S) -> Self {
        Self::new(ProviderErrorKind::Unimplemented, message)
    }

    pub fn temporary<S: Into<String>>(message: S) -> Self {
        Self::new(ProviderErrorKind::Temporary, message)
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::new(ProviderErrorKind::Other, message)
    }

    /// Deadline exceeded while waiting on the code host.
    pub fn deadline_exceeded() -> Self {
        Self::temporary("context deadline exceeded")
    }

    /// Classify an HTTP response status from a code host API.
    pub fn from_status<S: Into<String>>(status: u16, body: S) -> Self {
        let body = body.into();
        let message = if body.is_empty() {
            format!("HTTP error {}", status)
        } else {
            format!("HTTP error {}: {}", status, body)
        };

        let kind = match status {
            401 => ProviderErrorKind::Unauthorized,
            403 => ProviderErrorKind::Forbidden,
            404 => ProviderErrorKind::NotFound,
            408 | 429 => ProviderErrorKind::Temporary,
            500..=599 => ProviderErrorKind::Temporary,
            _ => ProviderErrorKind::Other,
        };

        Self::new(kind, message)
    }

    /// The account credential is no longer usable and should be expired.
    pub fn expires_account(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Unauthorized
                | ProviderErrorKind::Forbidden
                | ProviderErrorKind::AccountSuspended
        )
    }

    pub fn is_temporary(&self) -> bool {
        self.kind == ProviderErrorKind::Temporary
    }
}

impl From<tokio::time::error::Elapsed> for ProviderError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProviderError::deadline_exceeded()
    }
}

/// A provider failure that may carry whatever was fetched before it failed.
///
/// `partial` is only consumed when the job asked for partial results
/// (`no_perms`).
#[derive(Debug, Clone, PartialEq)]
pub struct FetchError<T> {
    pub error: ProviderError,
    pub partial: T,
}

impl<T> FetchError<T> {
    pub fn with_partial(error: ProviderError, partial: T) -> Self {
        Self { error, partial }
    }

    pub fn kind(&self) -> ProviderErrorKind {
        self.error.kind
    }
}

impl<T: Default> From<ProviderError> for FetchError<T> {
    fn from(error: ProviderError) -> Self {
        Self {
            error,
            partial: T::default(),
        }
    }
}

impl<T: Default> From<tokio::time::error::Elapsed> for FetchError<T> {
    fn from(elapsed: tokio::time::error::Elapsed) -> Self {
        ProviderError::from(elapsed).into()
    }
}

impl<T> fmt::Display for FetchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<T: fmt::Debug> std::error::Error for FetchError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
