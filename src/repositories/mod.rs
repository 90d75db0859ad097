//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! permission store and the permission sync job queue.

use sea_orm::DbErr;
use thiserror::Error;
use tracing::error;

pub mod permission_sync_job;
pub mod perms;

pub use permission_sync_job::{
    ListPermissionSyncJobOpts, PermissionSyncJobOpts, PermissionSyncJobRepository, ResetOutcome,
};
pub use perms::{
    ListExternalAccountsOptions, PermissionSource, PermsRepository, PermsTransaction,
    UserIdWithExternalAccountId,
};

/// Errors raised by the store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i32 },
    #[error("failed to encode {field}: {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub(crate) fn map_db_err(context: &'static str, err: DbErr) -> StoreError {
    error!(error = ?err, context, "Database operation failed");
    StoreError::Database {
        context,
        source: err,
    }
}
