//! # Error Handling
//!
//! Errors raised by the sync engine and the job worker. Provider and store
//! failures are wrapped with the repository or user they concerned, so a
//! job's failure message names what was being synced.

use thiserror::Error;

use crate::authz::{ProviderError, ProviderErrorKind};
use crate::repositories::StoreError;

#[derive(Debug, Error)]
pub enum PermsSyncError {
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },
    #[error("{context}: {source}")]
    Provider {
        context: String,
        #[source]
        source: ProviderError,
    },
    #[error("all providers failed to sync permissions")]
    AllProvidersFailed,
    /// The sync outcome could not be written back to the job row. `sync`
    /// keeps the error of the pass itself when there was one.
    #[error("{sync}; failed to save sync result: {persist}")]
    ResultPersistence {
        sync: Box<PermsSyncError>,
        #[source]
        persist: StoreError,
    },
    #[error("permission sync job {id} has neither a repository nor a user")]
    InvalidJob { id: i32 },
}

impl PermsSyncError {
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    pub fn provider(context: impl Into<String>, source: ProviderError) -> Self {
        Self::Provider {
            context: context.into(),
            source,
        }
    }

    /// Stable identifier used in logs and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store { .. } => "STORE_ERROR",
            Self::Provider { source, .. } => match source.kind {
                ProviderErrorKind::Temporary => "PROVIDER_TEMPORARY",
                _ => "PROVIDER_ERROR",
            },
            Self::AllProvidersFailed => "ALL_PROVIDERS_FAILED",
            Self::ResultPersistence { .. } => "RESULT_PERSISTENCE_FAILED",
            Self::InvalidJob { .. } => "INVALID_JOB",
        }
    }

    /// Kind of the underlying provider error, if this wraps one.
    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            Self::Provider { source, .. } => Some(source.kind),
            Self::ResultPersistence { sync, .. } => sync.provider_kind(),
            _ => None,
        }
    }
}
