//! Permission store repository
//!
//! Encapsulates every read and write the sync engine performs against the
//! permission tables: repositories, users, external accounts, resolved
//! grants, pending grants and sub-repository permissions.
//!
//! Grant writes replace the whole set for their scope (one repo, or one
//! user external account) and report the row-level difference.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::debug;

use super::{StoreError, map_db_err};
use crate::authz::{AccountSpec, ExternalRepoSpec, SetPermissionsResult, SubRepoPermissions};
use crate::models::{
    repo::{self, Entity as Repo},
    repo_pending_permission::{self, Entity as RepoPendingPermission},
    sub_repo_permission::{self, Entity as SubRepoPermission},
    user::{self, Entity as User},
    user_email::{self, Entity as UserEmail},
    user_external_account::{self, Entity as UserExternalAccount},
    user_repo_permission::{self, Entity as UserRepoPermission},
};

/// Permission level recorded on pending grants.
pub const READ_PERMISSION: &str = "read";

/// Which sync direction wrote a grant row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionSource {
    RepoSync,
    UserSync,
}

impl PermissionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionSource::RepoSync => "repo_sync",
            PermissionSource::UserSync => "user_sync",
        }
    }
}

/// Internal user resolved from an external account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserIdWithExternalAccountId {
    pub user_id: i32,
    pub external_account_id: i32,
}

/// Filters for [`PermsRepository::list_external_accounts`].
#[derive(Debug, Clone, Default)]
pub struct ListExternalAccountsOptions {
    pub user_id: Option<i32>,
    pub service_type: Option<String>,
    pub service_id: Option<String>,
    pub only_expired: bool,
    pub exclude_expired: bool,
}

/// Repository for permission store operations
#[derive(Debug, Clone)]
pub struct PermsRepository {
    db: Arc<DatabaseConnection>,
}

impl PermsRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Begin a transaction for repo-centric grant writes.
    pub async fn transact(&self) -> Result<PermsTransaction, StoreError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("failed to begin permissions transaction", err))?;
        Ok(PermsTransaction { txn })
    }

    pub async fn get_repo(&self, repo_id: i32) -> Result<Option<repo::Model>, StoreError> {
        Repo::find_by_id(repo_id)
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load repository", err))
    }

    pub async fn get_user(&self, user_id: i32) -> Result<Option<user::Model>, StoreError> {
        User::find_by_id(user_id)
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load user", err))
    }

    pub async fn list_external_accounts(
        &self,
        opts: &ListExternalAccountsOptions,
    ) -> Result<Vec<user_external_account::Model>, StoreError> {
        let mut query = UserExternalAccount::find().order_by_asc(user_external_account::Column::Id);

        if let Some(user_id) = opts.user_id {
            query = query.filter(user_external_account::Column::UserId.eq(user_id));
        }
        if let Some(service_type) = &opts.service_type {
            query = query.filter(user_external_account::Column::ServiceType.eq(service_type.as_str()));
        }
        if let Some(service_id) = &opts.service_id {
            query = query.filter(user_external_account::Column::ServiceId.eq(service_id.as_str()));
        }
        if opts.only_expired {
            query = query.filter(user_external_account::Column::ExpiredAt.is_not_null());
        } else if opts.exclude_expired {
            query = query.filter(user_external_account::Column::ExpiredAt.is_null());
        }

        query
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to list external accounts", err))
    }

    pub async fn list_verified_emails(&self, user_id: i32) -> Result<Vec<String>, StoreError> {
        UserEmail::find()
            .select_only()
            .column(user_email::Column::Email)
            .filter(user_email::Column::UserId.eq(user_id))
            .filter(user_email::Column::VerifiedAt.is_not_null())
            .order_by_asc(user_email::Column::Email)
            .into_tuple::<String>()
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to list verified emails", err))
    }

    /// Link (or re-link) an external account to the user. A re-linked
    /// account is un-expired.
    pub async fn upsert_external_account(
        &self,
        user_id: i32,
        spec: &AccountSpec,
    ) -> Result<user_external_account::Model, StoreError> {
        let now = Utc::now().fixed_offset();

        let existing = UserExternalAccount::find()
            .filter(user_external_account::Column::ServiceType.eq(spec.service_type.as_str()))
            .filter(user_external_account::Column::ServiceId.eq(spec.service_id.as_str()))
            .filter(user_external_account::Column::AccountId.eq(spec.account_id.as_str()))
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to look up external account", err))?;

        match existing {
            Some(account) => {
                let mut active: user_external_account::ActiveModel = account.into();
                active.user_id = Set(user_id);
                active.auth_data = Set(spec.auth_data.clone());
                active.account_data = Set(spec.account_data.clone());
                active.expired_at = Set(None);
                active.updated_at = Set(now);
                active
                    .update(self.db.as_ref())
                    .await
                    .map_err(|err| map_db_err("failed to update external account", err))
            }
            None => user_external_account::ActiveModel {
                user_id: Set(user_id),
                service_type: Set(spec.service_type.clone()),
                service_id: Set(spec.service_id.clone()),
                account_id: Set(spec.account_id.clone()),
                auth_data: Set(spec.auth_data.clone()),
                account_data: Set(spec.account_data.clone()),
                created_at: Set(now),
                updated_at: Set(now),
                expired_at: Set(None),
                last_valid_at: Set(None),
                ..Default::default()
            }
            .insert(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to insert external account", err)),
        }
    }

    /// Mark the account's credential as rejected by the code host.
    pub async fn touch_expired(&self, account_id: i32) -> Result<(), StoreError> {
        let now = Utc::now().fixed_offset();
        UserExternalAccount::update_many()
            .col_expr(user_external_account::Column::ExpiredAt, Expr::value(now))
            .col_expr(user_external_account::Column::UpdatedAt, Expr::value(now))
            .filter(user_external_account::Column::Id.eq(account_id))
            .exec(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to mark external account expired", err))?;
        Ok(())
    }

    /// Record a successful use of the account's credential.
    pub async fn touch_last_valid(&self, account_id: i32) -> Result<(), StoreError> {
        let now = Utc::now().fixed_offset();
        UserExternalAccount::update_many()
            .col_expr(user_external_account::Column::LastValidAt, Expr::value(now))
            .col_expr(
                user_external_account::Column::ExpiredAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(user_external_account::Column::UpdatedAt, Expr::value(now))
            .filter(user_external_account::Column::Id.eq(account_id))
            .exec(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to mark external account valid", err))?;
        Ok(())
    }

    /// Map code host account IDs to linked internal users. Unlinked and
    /// expired accounts are absent from the result.
    pub async fn get_user_ids_by_external_accounts(
        &self,
        service_type: &str,
        service_id: &str,
        account_ids: &[String],
    ) -> Result<HashMap<String, UserIdWithExternalAccountId>, StoreError> {
        if account_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let accounts = UserExternalAccount::find()
            .filter(user_external_account::Column::ServiceType.eq(service_type))
            .filter(user_external_account::Column::ServiceId.eq(service_id))
            .filter(user_external_account::Column::AccountId.is_in(account_ids.to_vec()))
            .filter(user_external_account::Column::ExpiredAt.is_null())
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to resolve external accounts", err))?;

        Ok(accounts
            .into_iter()
            .map(|account| {
                (
                    account.account_id,
                    UserIdWithExternalAccountId {
                        user_id: account.user_id,
                        external_account_id: account.id,
                    },
                )
            })
            .collect())
    }

    /// Resolve external repository IDs to private repository IDs, querying
    /// at most `chunk_size` IDs per statement. Results are concatenated
    /// without deduplication.
    pub async fn resolve_repos_by_external_specs(
        &self,
        service_type: &str,
        service_id: &str,
        external_ids: &[String],
        chunk_size: usize,
    ) -> Result<Vec<i32>, StoreError> {
        let mut repo_ids = Vec::with_capacity(external_ids.len());
        for chunk in external_ids.chunks(chunk_size.max(1)) {
            let ids = Repo::find()
                .select_only()
                .column(repo::Column::Id)
                .filter(repo::Column::Private.eq(true))
                .filter(repo::Column::ExternalServiceType.eq(service_type))
                .filter(repo::Column::ExternalServiceId.eq(service_id))
                .filter(repo::Column::ExternalId.is_in(chunk.to_vec()))
                .order_by_asc(repo::Column::Id)
                .into_tuple::<i32>()
                .all(self.db.as_ref())
                .await
                .map_err(|err| map_db_err("failed to resolve repositories by external ID", err))?;
            repo_ids.extend(ids);
        }
        Ok(repo_ids)
    }

    /// Private repositories whose external ID matches any include pattern
    /// and no exclude pattern. Exclusions apply only when at least one
    /// include is given.
    pub async fn list_repos_by_contains(
        &self,
        service_type: &str,
        service_id: &str,
        include_contains: &[String],
        exclude_contains: &[String],
    ) -> Result<Vec<i32>, StoreError> {
        if include_contains.is_empty() {
            return Ok(Vec::new());
        }

        let mut includes = Condition::any();
        for prefix in include_contains {
            includes = includes.add(repo::Column::ExternalId.like(contains_pattern(prefix)));
        }

        let mut query = Repo::find()
            .select_only()
            .column(repo::Column::Id)
            .filter(repo::Column::Private.eq(true))
            .filter(repo::Column::ExternalServiceType.eq(service_type))
            .filter(repo::Column::ExternalServiceId.eq(service_id))
            .filter(includes);
        for prefix in exclude_contains {
            query = query.filter(repo::Column::ExternalId.not_like(contains_pattern(prefix)));
        }

        query
            .order_by_asc(repo::Column::Id)
            .into_tuple::<i32>()
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to list repositories by contains matching", err))
    }

    /// Repository IDs currently granted through the external account.
    pub async fn fetch_repos_by_external_account(
        &self,
        account_id: i32,
    ) -> Result<Vec<i32>, StoreError> {
        UserRepoPermission::find()
            .select_only()
            .column(user_repo_permission::Column::RepoId)
            .distinct()
            .filter(user_repo_permission::Column::UserExternalAccountId.eq(account_id))
            .order_by_asc(user_repo_permission::Column::RepoId)
            .into_tuple::<i32>()
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to fetch repositories by external account", err))
    }

    /// Replace the repository list granted to one user through one external
    /// account.
    pub async fn set_user_external_account_perms(
        &self,
        ids: UserIdWithExternalAccountId,
        repo_ids: &[i32],
        source: PermissionSource,
    ) -> Result<SetPermissionsResult, StoreError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("failed to begin user permissions transaction", err))?;

        let result = replace_user_account_perms(&txn, ids, repo_ids, source).await?;

        txn.commit()
            .await
            .map_err(|err| map_db_err("failed to commit user permissions", err))?;

        debug!(
            user_id = ids.user_id,
            external_account_id = ids.external_account_id,
            added = result.added,
            removed = result.removed,
            found = result.found,
            "Replaced user external account permissions"
        );
        Ok(result)
    }

    /// Promote pending grants bound to the account into resolved grants for
    /// the user. Returns the number of repositories granted.
    pub async fn grant_pending_permissions(
        &self,
        user_id: i32,
        account: &user_external_account::Model,
    ) -> Result<usize, StoreError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("failed to begin pending grant transaction", err))?;

        let pending = RepoPendingPermission::find()
            .filter(repo_pending_permission::Column::ServiceType.eq(account.service_type.as_str()))
            .filter(repo_pending_permission::Column::ServiceId.eq(account.service_id.as_str()))
            .filter(repo_pending_permission::Column::BindId.eq(account.account_id.as_str()))
            .all(&txn)
            .await
            .map_err(|err| map_db_err("failed to load pending permissions", err))?;

        if pending.is_empty() {
            txn.commit()
                .await
                .map_err(|err| map_db_err("failed to commit pending grant transaction", err))?;
            return Ok(0);
        }

        let repo_ids: BTreeSet<i32> = pending.iter().map(|row| row.repo_id).collect();
        let already: HashSet<i32> = UserRepoPermission::find()
            .select_only()
            .column(user_repo_permission::Column::RepoId)
            .filter(user_repo_permission::Column::UserId.eq(user_id))
            .filter(user_repo_permission::Column::UserExternalAccountId.eq(account.id))
            .filter(user_repo_permission::Column::Source.eq(PermissionSource::RepoSync.as_str()))
            .into_tuple::<i32>()
            .all(&txn)
            .await
            .map_err(|err| map_db_err("failed to load existing grants", err))?
            .into_iter()
            .collect();

        let now = Utc::now().fixed_offset();
        let rows: Vec<user_repo_permission::ActiveModel> = repo_ids
            .iter()
            .filter(|repo_id| !already.contains(repo_id))
            .map(|repo_id| grant_row(user_id, *repo_id, Some(account.id), PermissionSource::RepoSync, now))
            .collect();
        let granted = rows.len();
        if !rows.is_empty() {
            UserRepoPermission::insert_many(rows)
                .exec(&txn)
                .await
                .map_err(|err| map_db_err("failed to insert promoted grants", err))?;
        }

        RepoPendingPermission::delete_many()
            .filter(
                repo_pending_permission::Column::Id
                    .is_in(pending.iter().map(|row| row.id).collect::<Vec<_>>()),
            )
            .exec(&txn)
            .await
            .map_err(|err| map_db_err("failed to delete promoted pending permissions", err))?;

        txn.commit()
            .await
            .map_err(|err| map_db_err("failed to commit pending grant transaction", err))?;

        debug!(
            user_id,
            external_account_id = account.id,
            granted,
            "Promoted pending permissions"
        );
        Ok(granted)
    }

    /// Previously synced sub-repository permissions of the user on one code
    /// host, keyed by external repository spec.
    pub async fn sub_repo_perms_by_user_and_service(
        &self,
        user_id: i32,
        service_type: &str,
        service_id: &str,
    ) -> Result<HashMap<ExternalRepoSpec, SubRepoPermissions>, StoreError> {
        let rows = SubRepoPermission::find()
            .filter(sub_repo_permission::Column::UserId.eq(user_id))
            .find_also_related(Repo)
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load sub-repository permissions", err))?;

        let mut perms = HashMap::new();
        for (row, repo) in rows {
            let Some(repo) = repo else { continue };
            if repo.external_service_type != service_type || repo.external_service_id != service_id
            {
                continue;
            }
            perms.insert(
                ExternalRepoSpec {
                    id: repo.external_id,
                    service_type: repo.external_service_type,
                    service_id: repo.external_service_id,
                },
                SubRepoPermissions {
                    path_includes: json_strings(&row.path_includes),
                    path_excludes: json_strings(&row.path_excludes),
                },
            );
        }
        Ok(perms)
    }

    /// Insert or replace the sub-repository rules for the repository
    /// identified by `spec`. Returns false when no such repository exists.
    pub async fn upsert_sub_repo_perms(
        &self,
        user_id: i32,
        spec: &ExternalRepoSpec,
        perms: &SubRepoPermissions,
    ) -> Result<bool, StoreError> {
        let Some(repo) = Repo::find()
            .filter(repo::Column::ExternalId.eq(spec.id.as_str()))
            .filter(repo::Column::ExternalServiceType.eq(spec.service_type.as_str()))
            .filter(repo::Column::ExternalServiceId.eq(spec.service_id.as_str()))
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to resolve repository for sub-repo permissions", err))?
        else {
            return Ok(false);
        };

        let includes = serde_json::to_value(&perms.path_includes).map_err(|source| {
            StoreError::Encode {
                field: "path_includes",
                source,
            }
        })?;
        let excludes = serde_json::to_value(&perms.path_excludes).map_err(|source| {
            StoreError::Encode {
                field: "path_excludes",
                source,
            }
        })?;
        let now = Utc::now().fixed_offset();

        let existing = SubRepoPermission::find()
            .filter(sub_repo_permission::Column::UserId.eq(user_id))
            .filter(sub_repo_permission::Column::RepoId.eq(repo.id))
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load sub-repository permissions", err))?;

        match existing {
            Some(row) => {
                let mut active: sub_repo_permission::ActiveModel = row.into();
                active.path_includes = Set(includes);
                active.path_excludes = Set(excludes);
                active.updated_at = Set(now);
                active
                    .update(self.db.as_ref())
                    .await
                    .map_err(|err| map_db_err("failed to update sub-repository permissions", err))?;
            }
            None => {
                sub_repo_permission::ActiveModel {
                    user_id: Set(user_id),
                    repo_id: Set(repo.id),
                    path_includes: Set(includes),
                    path_excludes: Set(excludes),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(self.db.as_ref())
                .await
                .map_err(|err| map_db_err("failed to insert sub-repository permissions", err))?;
            }
        }
        Ok(true)
    }

    /// Distinct repository IDs the user may read, ascending.
    pub async fn load_user_permissions(&self, user_id: i32) -> Result<Vec<i32>, StoreError> {
        UserRepoPermission::find()
            .select_only()
            .column(user_repo_permission::Column::RepoId)
            .distinct()
            .filter(user_repo_permission::Column::UserId.eq(user_id))
            .order_by_asc(user_repo_permission::Column::RepoId)
            .into_tuple::<i32>()
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load user permissions", err))
    }

    /// Distinct user IDs that may read the repository, ascending.
    pub async fn load_repo_permissions(&self, repo_id: i32) -> Result<Vec<i32>, StoreError> {
        UserRepoPermission::find()
            .select_only()
            .column(user_repo_permission::Column::UserId)
            .distinct()
            .filter(user_repo_permission::Column::RepoId.eq(repo_id))
            .order_by_asc(user_repo_permission::Column::UserId)
            .into_tuple::<i32>()
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load repository permissions", err))
    }

    /// Pending external account IDs bound to the repository, ascending.
    pub async fn load_repo_pending_permissions(
        &self,
        repo_id: i32,
    ) -> Result<Vec<String>, StoreError> {
        RepoPendingPermission::find()
            .select_only()
            .column(repo_pending_permission::Column::BindId)
            .filter(repo_pending_permission::Column::RepoId.eq(repo_id))
            .order_by_asc(repo_pending_permission::Column::BindId)
            .into_tuple::<String>()
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load repository pending permissions", err))
    }
}

/// Open transaction over the repo-centric grant tables. Dropping it without
/// calling [`commit`](Self::commit) rolls back.
pub struct PermsTransaction {
    txn: DatabaseTransaction,
}

impl PermsTransaction {
    /// Replace the repository's resolved grants written by `source`.
    pub async fn set_repo_perms(
        &self,
        repo_id: i32,
        grants: &[UserIdWithExternalAccountId],
        source: PermissionSource,
    ) -> Result<SetPermissionsResult, StoreError> {
        let existing = UserRepoPermission::find()
            .filter(user_repo_permission::Column::RepoId.eq(repo_id))
            .filter(user_repo_permission::Column::Source.eq(source.as_str()))
            .all(&self.txn)
            .await
            .map_err(|err| map_db_err("failed to load repository grants", err))?;

        let wanted: BTreeSet<(i32, Option<i32>)> = grants
            .iter()
            .map(|grant| (grant.user_id, Some(grant.external_account_id)))
            .collect();

        let mut kept = HashSet::new();
        let mut stale = Vec::new();
        for row in existing {
            let key = (row.user_id, row.user_external_account_id);
            if wanted.contains(&key) && kept.insert(key) {
                continue;
            }
            stale.push(row.id);
        }

        let now = Utc::now().fixed_offset();
        let rows: Vec<user_repo_permission::ActiveModel> = wanted
            .iter()
            .filter(|key| !kept.contains(*key))
            .map(|(user_id, account_id)| grant_row(*user_id, repo_id, *account_id, source, now))
            .collect();

        let result = SetPermissionsResult {
            added: rows.len() as i32,
            removed: stale.len() as i32,
            found: wanted.len() as i32,
        };

        delete_grants(&self.txn, stale).await?;
        insert_grants(&self.txn, rows).await?;
        Ok(result)
    }

    /// Replace the repository's pending grants on one code host.
    pub async fn set_repo_pending_permissions(
        &self,
        repo_id: i32,
        service_type: &str,
        service_id: &str,
        bind_ids: &[String],
    ) -> Result<(), StoreError> {
        let existing = RepoPendingPermission::find()
            .filter(repo_pending_permission::Column::RepoId.eq(repo_id))
            .filter(repo_pending_permission::Column::ServiceType.eq(service_type))
            .filter(repo_pending_permission::Column::ServiceId.eq(service_id))
            .all(&self.txn)
            .await
            .map_err(|err| map_db_err("failed to load pending permissions", err))?;

        let wanted: BTreeSet<&str> = bind_ids.iter().map(String::as_str).collect();
        let mut kept = HashSet::new();
        let mut stale = Vec::new();
        for row in &existing {
            if wanted.contains(row.bind_id.as_str()) && kept.insert(row.bind_id.as_str()) {
                continue;
            }
            stale.push(row.id);
        }

        if !stale.is_empty() {
            RepoPendingPermission::delete_many()
                .filter(repo_pending_permission::Column::Id.is_in(stale))
                .exec(&self.txn)
                .await
                .map_err(|err| map_db_err("failed to delete stale pending permissions", err))?;
        }

        let now = Utc::now().fixed_offset();
        let rows: Vec<repo_pending_permission::ActiveModel> = wanted
            .iter()
            .filter(|bind_id| !kept.contains(*bind_id))
            .map(|bind_id| repo_pending_permission::ActiveModel {
                repo_id: Set(repo_id),
                service_type: Set(service_type.to_string()),
                service_id: Set(service_id.to_string()),
                bind_id: Set(bind_id.to_string()),
                permission: Set(READ_PERMISSION.to_string()),
                updated_at: Set(now),
                ..Default::default()
            })
            .collect();
        if !rows.is_empty() {
            RepoPendingPermission::insert_many(rows)
                .exec(&self.txn)
                .await
                .map_err(|err| map_db_err("failed to insert pending permissions", err))?;
        }
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.txn
            .commit()
            .await
            .map_err(|err| map_db_err("failed to commit permissions transaction", err))
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.txn
            .rollback()
            .await
            .map_err(|err| map_db_err("failed to roll back permissions transaction", err))
    }
}

async fn replace_user_account_perms<C: ConnectionTrait>(
    conn: &C,
    ids: UserIdWithExternalAccountId,
    repo_ids: &[i32],
    source: PermissionSource,
) -> Result<SetPermissionsResult, StoreError> {
    let existing = UserRepoPermission::find()
        .filter(user_repo_permission::Column::UserId.eq(ids.user_id))
        .filter(user_repo_permission::Column::UserExternalAccountId.eq(ids.external_account_id))
        .filter(user_repo_permission::Column::Source.eq(source.as_str()))
        .all(conn)
        .await
        .map_err(|err| map_db_err("failed to load user grants", err))?;

    let wanted: BTreeSet<i32> = repo_ids.iter().copied().collect();
    let mut kept = HashSet::new();
    let mut stale = Vec::new();
    for row in existing {
        if wanted.contains(&row.repo_id) && kept.insert(row.repo_id) {
            continue;
        }
        stale.push(row.id);
    }

    let now = Utc::now().fixed_offset();
    let rows: Vec<user_repo_permission::ActiveModel> = wanted
        .iter()
        .filter(|repo_id| !kept.contains(*repo_id))
        .map(|repo_id| {
            grant_row(
                ids.user_id,
                *repo_id,
                Some(ids.external_account_id),
                source,
                now,
            )
        })
        .collect();

    let result = SetPermissionsResult {
        added: rows.len() as i32,
        removed: stale.len() as i32,
        found: wanted.len() as i32,
    };

    delete_grants(conn, stale).await?;
    insert_grants(conn, rows).await?;
    Ok(result)
}

async fn delete_grants<C: ConnectionTrait>(conn: &C, ids: Vec<i32>) -> Result<(), StoreError> {
    if ids.is_empty() {
        return Ok(());
    }
    UserRepoPermission::delete_many()
        .filter(user_repo_permission::Column::Id.is_in(ids))
        .exec(conn)
        .await
        .map_err(|err| map_db_err("failed to delete stale grants", err))?;
    Ok(())
}

async fn insert_grants<C: ConnectionTrait>(
    conn: &C,
    rows: Vec<user_repo_permission::ActiveModel>,
) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    UserRepoPermission::insert_many(rows)
        .exec(conn)
        .await
        .map_err(|err| map_db_err("failed to insert grants", err))?;
    Ok(())
}

fn grant_row(
    user_id: i32,
    repo_id: i32,
    account_id: Option<i32>,
    source: PermissionSource,
    now: DateTimeWithTimeZone,
) -> user_repo_permission::ActiveModel {
    user_repo_permission::ActiveModel {
        user_id: Set(user_id),
        repo_id: Set(repo_id),
        user_external_account_id: Set(account_id),
        source: Set(source.as_str().to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
}

/// A bare prefix matches anything starting with it; explicit `%` wildcards
/// are kept as given.
fn contains_pattern(prefix: &str) -> String {
    if prefix.contains('%') {
        prefix.to_string()
    } else {
        format!("{}%", prefix)
    }
}

fn json_strings(value: &JsonValue) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
