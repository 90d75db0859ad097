//! Authorization provider trait definition
//!
//! Defines the capability set each code host integration exposes to the sync
//! engine. Concrete providers live outside this crate and are injected
//! through the [`ProviderRegistry`](super::ProviderRegistry).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::error::{FetchError, ProviderError};
use crate::models::{
    repo::Model as Repo, user::Model as User, user_external_account::Model as ExternalAccount,
};

/// Options forwarded to every permission fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchPermsOptions {
    /// Bypass any provider-side caches
    pub invalidate_caches: bool,
}

/// Identifies a repository on a code host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalRepoSpec {
    pub id: String,
    pub service_type: String,
    pub service_id: String,
}

/// Path-level include/exclude rules for one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRepoPermissions {
    pub path_includes: Vec<String>,
    pub path_excludes: Vec<String>,
}

/// Repositories an external account may read, as reported by the code host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalUserPermissions {
    /// Exact external repository IDs
    pub exacts: Vec<String>,
    /// External ID prefixes granting access (depot paths and the like)
    pub include_contains: Vec<String>,
    /// External ID prefixes carved out of `include_contains`
    pub exclude_contains: Vec<String>,
    /// Path-level rules keyed by external repository ID
    pub sub_repo_permissions: HashMap<String, SubRepoPermissions>,
}

/// An account discovered on a code host for a user with no linked account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSpec {
    pub service_type: String,
    pub service_id: String,
    pub account_id: String,
    pub auth_data: Option<JsonValue>,
    pub account_data: Option<JsonValue>,
}

#[async_trait]
pub trait AuthzProvider: Send + Sync {
    /// Code host kind, e.g. `github`.
    fn service_type(&self) -> &str;

    /// Canonical URL of the code host, e.g. `https://github.com/`.
    fn service_id(&self) -> &str;

    /// Unique identifier of this configured connection.
    fn urn(&self) -> &str;

    /// Look up the user's account on this code host. `Ok(None)` means no
    /// matching account exists.
    async fn fetch_account(
        &self,
        user: &User,
        current: &[ExternalAccount],
        verified_emails: &[String],
    ) -> Result<Option<AccountSpec>, ProviderError>;

    /// List what the external account may read.
    async fn fetch_user_perms(
        &self,
        account: &ExternalAccount,
        opts: FetchPermsOptions,
    ) -> Result<ExternalUserPermissions, FetchError<ExternalUserPermissions>>;

    /// List external account IDs with read access to the repository.
    async fn fetch_repo_perms(
        &self,
        repo: &Repo,
        opts: FetchPermsOptions,
    ) -> Result<Vec<String>, FetchError<Vec<String>>>;
}
