//! # Permission Sync Engine
//!
//! Computes and persists repository access grants by asking code host
//! providers who may read what.
//!
//! Two passes exist:
//! - repo-centric ([`PermsSyncer::sync_repo_perms`]): which users may read one
//!   private repository;
//! - user-centric ([`PermsSyncer::sync_user_perms`]): which private
//!   repositories one user may read across all linked external accounts.
//!
//! Provider calls of concurrent passes run in parallel. Every write to the
//! permission tables is serialized behind a single process-wide lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use sea_orm::prelude::DateTimeWithTimeZone;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::authz::{
    AuthzProvider, CodeHostStatusesSet, ExternalRepoSpec, ExternalUserPermissions, FetchError,
    FetchPermsOptions, ProviderErrorKind, ProviderRegistry, SetPermissionsResult,
    SubRepoPermissions,
};
use crate::config::AppConfig;
use crate::error::PermsSyncError;
use crate::models::permission_sync_job::{Model as SyncJob, SyncJobKind};
use crate::models::{repo, user, user_external_account};
use crate::repositories::{
    ListExternalAccountsOptions, PermissionSource, PermissionSyncJobRepository, PermsRepository,
    UserIdWithExternalAccountId,
};

const FETCH_REPO_PERMS: &str = "FetchRepoPerms";
const FETCH_USER_PERMS: &str = "FetchUserPerms";
const FETCH_ACCOUNT: &str = "FetchAccount";

/// Service type whose expired accounts are still synced, since their tokens
/// can be refreshed.
const GITLAB_SERVICE_TYPE: &str = "gitlab";

/// Engine settings.
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Skip code host calls on user-centric passes.
    pub dotcom_mode: bool,
    pub provider_call_timeout: Duration,
    pub repo_resolve_chunk_size: usize,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            dotcom_mode: false,
            provider_call_timeout: Duration::from_secs(300),
            repo_resolve_chunk_size: 10_000,
        }
    }
}

impl From<&AppConfig> for SyncerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            dotcom_mode: config.dotcom_mode,
            provider_call_timeout: config.perms_sync.provider_call_timeout(),
            repo_resolve_chunk_size: config.perms_sync.repo_resolve_chunk_size,
        }
    }
}

/// What a successful pass wrote and which providers it consulted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    pub result: SetPermissionsResult,
    pub statuses: CodeHostStatusesSet,
}

/// A failed pass. Statuses and counts gathered before the failure are kept
/// so the job row still records them.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SyncFailure {
    pub error: PermsSyncError,
    pub result: SetPermissionsResult,
    pub statuses: CodeHostStatusesSet,
}

impl SyncFailure {
    fn new(error: PermsSyncError, statuses: CodeHostStatusesSet) -> Self {
        Self {
            error,
            result: SetPermissionsResult::default(),
            statuses,
        }
    }
}

/// Intermediate state of a user-centric pass.
#[derive(Debug, Default)]
struct UserPermsResults {
    /// Repository IDs per external account ID.
    repo_perms: BTreeMap<i32, Vec<i32>>,
    sub_repo_perms: HashMap<ExternalRepoSpec, SubRepoPermissions>,
    statuses: CodeHostStatusesSet,
}

pub struct PermsSyncer {
    perms: PermsRepository,
    jobs: PermissionSyncJobRepository,
    providers: Arc<ProviderRegistry>,
    /// Guards every write to the permission tables.
    write_lock: Mutex<()>,
    config: SyncerConfig,
}

impl PermsSyncer {
    pub fn new(
        perms: PermsRepository,
        jobs: PermissionSyncJobRepository,
        providers: Arc<ProviderRegistry>,
        config: SyncerConfig,
    ) -> Self {
        Self {
            perms,
            jobs,
            providers,
            write_lock: Mutex::new(()),
            config,
        }
    }

    /// Repo-centric pass. With `no_perms`, partial provider results are
    /// applied instead of failing.
    #[instrument(skip(self, opts))]
    pub async fn sync_repo_perms(
        &self,
        repo_id: i32,
        no_perms: bool,
        opts: FetchPermsOptions,
    ) -> Result<SyncOutcome, SyncFailure> {
        let started = Instant::now();
        let outcome = self.sync_repo_perms_inner(repo_id, no_perms, opts).await;
        record_sync(SyncJobKind::Repo, started, outcome.is_ok());
        outcome
    }

    async fn sync_repo_perms_inner(
        &self,
        repo_id: i32,
        no_perms: bool,
        opts: FetchPermsOptions,
    ) -> Result<SyncOutcome, SyncFailure> {
        let mut statuses = CodeHostStatusesSet::new();

        let repo = match self.perms.get_repo(repo_id).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                debug!(repo_id, "Repository not found, nothing to sync");
                return Ok(SyncOutcome::default());
            }
            Err(err) => {
                return Err(SyncFailure::new(
                    PermsSyncError::store("get repository", err),
                    statuses,
                ));
            }
        };

        if !repo.private {
            debug!(repo_id, "Public repository, skipping permission fetch");
            return Ok(SyncOutcome::default());
        }

        let providers = self.providers.snapshot();
        let urns = repo.source_urns();
        let Some(provider) = providers
            .first_matching_urn(urns.iter().map(String::as_str))
            .cloned()
        else {
            debug!(repo_id, "No authz provider for repository sources");
            return Ok(SyncOutcome::default());
        };

        let fetched = with_deadline(
            self.config.provider_call_timeout,
            provider.fetch_repo_perms(&repo, opts),
        )
        .await;

        let account_ids = match fetched {
            Ok(account_ids) => {
                statuses.push_success(provider.as_ref(), FETCH_REPO_PERMS);
                account_ids
            }
            Err(err) if err.kind() == ProviderErrorKind::NotFound => {
                warn!(
                    repo_id,
                    provider_urn = provider.urn(),
                    error = %err,
                    suggestion = "the token owner may only have read access to the repository, but needs admin access for permissions",
                    "Ignoring not found error from code host"
                );
                statuses.push_success(provider.as_ref(), FETCH_REPO_PERMS);
                return Ok(SyncOutcome {
                    statuses,
                    ..Default::default()
                });
            }
            Err(err) if err.kind() == ProviderErrorKind::Unimplemented => {
                debug!(repo_id, provider_urn = provider.urn(), "FetchRepoPerms unimplemented");
                statuses.push_success(provider.as_ref(), FETCH_REPO_PERMS);
                return Ok(SyncOutcome {
                    statuses,
                    ..Default::default()
                });
            }
            Err(FetchError { error, partial }) => {
                statuses.push_error(provider.as_ref(), FETCH_REPO_PERMS, &error);
                if !no_perms {
                    return Err(SyncFailure::new(
                        PermsSyncError::provider(
                            format!(
                                "fetch repository permissions for repository {:?} (id: {})",
                                repo.name, repo.id
                            ),
                            error,
                        ),
                        statuses,
                    ));
                }
                warn!(repo_id, error = %error, "Proceeding with partial results");
                partial
            }
        };

        let resolved = if account_ids.is_empty() {
            HashMap::new()
        } else {
            match self
                .perms
                .get_user_ids_by_external_accounts(
                    provider.service_type(),
                    provider.service_id(),
                    &account_ids,
                )
                .await
            {
                Ok(resolved) => resolved,
                Err(err) => {
                    return Err(SyncFailure::new(
                        PermsSyncError::store(
                            format!(
                                "get user IDs by external accounts for repository {:?} (id: {})",
                                repo.name, repo.id
                            ),
                            err,
                        ),
                        statuses,
                    ));
                }
            }
        };

        let pending: Vec<String> = account_ids
            .iter()
            .filter(|account_id| !resolved.contains_key(*account_id))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let grants: Vec<UserIdWithExternalAccountId> = resolved.values().copied().collect();

        let last_job = self.latest_finished_job(SyncJobKind::Repo, repo.id).await;

        let written = {
            let _guard = self.write_lock.lock().await;
            self.write_repo_perms(&repo, provider.as_ref(), &grants, &pending)
                .await
        };
        let result = match written {
            Ok(result) => result,
            Err(error) => return Err(SyncFailure::new(error, statuses)),
        };

        counter!("perms_syncer_success_syncs_total", "type" => "repo").increment(1);
        record_sync_delay(SyncJobKind::Repo, last_job.as_ref(), repo.created_at);

        let regular_count = grants
            .iter()
            .map(|grant| grant.user_id)
            .collect::<HashSet<_>>()
            .len();
        info!(
            repo_id,
            regular_count,
            pending_count = pending.len(),
            added = result.added,
            removed = result.removed,
            invalidate_caches = opts.invalidate_caches,
            "Synced repository permissions"
        );

        Ok(SyncOutcome { result, statuses })
    }

    /// Replaces resolved and pending grants of the repository in one
    /// transaction. Callers hold the write lock.
    async fn write_repo_perms(
        &self,
        repo: &repo::Model,
        provider: &dyn AuthzProvider,
        grants: &[UserIdWithExternalAccountId],
        pending: &[String],
    ) -> Result<SetPermissionsResult, PermsSyncError> {
        let txn = self.perms.transact().await.map_err(|err| {
            PermsSyncError::store(
                format!(
                    "start transaction for repository {:?} (id: {})",
                    repo.name, repo.id
                ),
                err,
            )
        })?;

        let result = match txn
            .set_repo_perms(repo.id, grants, PermissionSource::RepoSync)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                rollback_quietly(txn).await;
                return Err(PermsSyncError::store(
                    format!(
                        "set user repo permissions for repository {:?} (id: {})",
                        repo.name, repo.id
                    ),
                    err,
                ));
            }
        };

        if let Err(err) = txn
            .set_repo_pending_permissions(
                repo.id,
                provider.service_type(),
                provider.service_id(),
                pending,
            )
            .await
        {
            rollback_quietly(txn).await;
            return Err(PermsSyncError::store(
                format!(
                    "set repository pending permissions for repository {:?} (id: {})",
                    repo.name, repo.id
                ),
                err,
            ));
        }

        txn.commit().await.map_err(|err| {
            PermsSyncError::store(
                format!(
                    "commit permissions for repository {:?} (id: {})",
                    repo.name, repo.id
                ),
                err,
            )
        })?;
        Ok(result)
    }

    /// User-centric pass. With `no_perms`, partial provider results are
    /// applied instead of failing.
    #[instrument(skip(self, opts))]
    pub async fn sync_user_perms(
        &self,
        user_id: i32,
        no_perms: bool,
        opts: FetchPermsOptions,
    ) -> Result<SyncOutcome, SyncFailure> {
        let started = Instant::now();
        let outcome = self.sync_user_perms_inner(user_id, no_perms, opts).await;
        record_sync(SyncJobKind::User, started, outcome.is_ok());
        outcome
    }

    async fn sync_user_perms_inner(
        &self,
        user_id: i32,
        no_perms: bool,
        opts: FetchPermsOptions,
    ) -> Result<SyncOutcome, SyncFailure> {
        let user = match self.perms.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!(user_id, "User not found, nothing to sync");
                return Ok(SyncOutcome::default());
            }
            Err(err) => {
                return Err(SyncFailure::new(
                    PermsSyncError::store("get user", err),
                    CodeHostStatusesSet::new(),
                ));
            }
        };

        let mut results = UserPermsResults::default();
        if let Err(error) = self
            .fetch_user_perms_via_external_accounts(&user, no_perms, opts, &mut results)
            .await
        {
            return Err(SyncFailure::new(error, results.statuses));
        }

        let last_job = self.latest_finished_job(SyncJobKind::User, user.id).await;

        let UserPermsResults {
            repo_perms,
            sub_repo_perms,
            statuses,
        } = results;

        let mut result = SetPermissionsResult::default();
        let mut repo_ids = HashSet::new();
        {
            let _guard = self.write_lock.lock().await;

            for (account_id, ids) in &repo_perms {
                let ids_pair = UserIdWithExternalAccountId {
                    user_id: user.id,
                    external_account_id: *account_id,
                };
                match self
                    .perms
                    .set_user_external_account_perms(ids_pair, ids, PermissionSource::UserSync)
                    .await
                {
                    Ok(stats) => result.merge(stats),
                    Err(err) => {
                        warn!(user_id, external_account_id = account_id, error = %err, "Saving permissions failed");
                        return Err(SyncFailure {
                            error: PermsSyncError::store(
                                format!(
                                    "set user repo permissions for user {:?} (id: {}, external_account_id: {})",
                                    user.username, user.id, account_id
                                ),
                                err,
                            ),
                            result,
                            statuses,
                        });
                    }
                }
                repo_ids.extend(ids.iter().copied());
            }

            for (spec, perms) in &sub_repo_perms {
                match self.perms.upsert_sub_repo_perms(user.id, spec, perms).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(user_id, external_repo_id = %spec.id, "Repository for sub-repo permissions not found");
                    }
                    Err(err) => {
                        return Err(SyncFailure {
                            error: PermsSyncError::store(
                                format!(
                                    "upserting sub repo perms {:?} for user {:?} (id: {})",
                                    spec.id, user.username, user.id
                                ),
                                err,
                            ),
                            result,
                            statuses,
                        });
                    }
                }
            }
        }

        counter!("perms_syncer_success_syncs_total", "type" => "user").increment(1);
        record_sync_delay(SyncJobKind::User, last_job.as_ref(), user.created_at);

        info!(
            user_id,
            count = repo_ids.len(),
            sub_repo_count = sub_repo_perms.len(),
            added = result.added,
            removed = result.removed,
            invalidate_caches = opts.invalidate_caches,
            "Synced user permissions"
        );

        Ok(SyncOutcome { result, statuses })
    }

    /// Collects, per external account of the user, the private repositories
    /// the account may read. Statuses are recorded into `results` even when
    /// an error is returned.
    async fn fetch_user_perms_via_external_accounts(
        &self,
        user: &user::Model,
        no_perms: bool,
        opts: FetchPermsOptions,
        results: &mut UserPermsResults,
    ) -> Result<(), PermsSyncError> {
        if self.config.dotcom_mode {
            debug!(user_id = user.id, "Dotcom mode, skipping code host calls");
            return Ok(());
        }

        let mut accounts = self
            .perms
            .list_external_accounts(&ListExternalAccountsOptions {
                user_id: Some(user.id),
                exclude_expired: true,
                ..Default::default()
            })
            .await
            .map_err(|err| {
                PermsSyncError::store(
                    format!("list external accounts for user {:?} (id: {})", user.username, user.id),
                    err,
                )
            })?;

        let expired_gitlab = self
            .perms
            .list_external_accounts(&ListExternalAccountsOptions {
                user_id: Some(user.id),
                service_type: Some(GITLAB_SERVICE_TYPE.to_string()),
                only_expired: true,
                ..Default::default()
            })
            .await
            .map_err(|err| {
                PermsSyncError::store(
                    format!(
                        "list expired gitlab external accounts for user {:?} (id: {})",
                        user.username, user.id
                    ),
                    err,
                )
            })?;
        accounts.extend(expired_gitlab);

        let linked: HashSet<String> = accounts.iter().map(|acct| acct.service_key()).collect();

        let emails = self.perms.list_verified_emails(user.id).await.map_err(|err| {
            PermsSyncError::store(
                format!("list verified emails for user {:?} (id: {})", user.username, user.id),
                err,
            )
        })?;

        let providers = self.providers.snapshot();

        for provider in providers.distinct_by_service_id() {
            let key = format!("{}:{}", provider.service_type(), provider.service_id());
            if linked.contains(&key) {
                continue;
            }

            let fetched = with_deadline(
                self.config.provider_call_timeout,
                provider.fetch_account(user, &accounts, &emails),
            )
            .await;

            let spec = match fetched {
                Ok(Some(spec)) => spec,
                Ok(None) => {
                    debug!(
                        user_id = user.id,
                        provider_urn = provider.urn(),
                        "No user account found for provider"
                    );
                    continue;
                }
                Err(err) => {
                    results.statuses.push_error(provider.as_ref(), FETCH_ACCOUNT, &err);
                    error!(
                        user_id = user.id,
                        provider_urn = provider.urn(),
                        error = %err,
                        "Could not fetch account from authz provider"
                    );
                    continue;
                }
            };

            let account = match self.perms.upsert_external_account(user.id, &spec).await {
                Ok(account) => account,
                Err(err) => {
                    error!(
                        user_id = user.id,
                        provider_urn = provider.urn(),
                        error = %err,
                        "Could not associate external account to user"
                    );
                    continue;
                }
            };
            debug!(
                user_id = user.id,
                provider_urn = provider.urn(),
                external_account_id = account.id,
                "Account found for provider"
            );

            self.promote_pending_permissions(user.id, &account).await;
            accounts.push(account);
        }

        for account in &accounts {
            let Some(provider) = providers.by_service_id(&account.service_id) else {
                continue;
            };

            let fetched = with_deadline(
                self.config.provider_call_timeout,
                provider.fetch_user_perms(account, opts),
            )
            .await;

            let perms = match fetched {
                Ok(perms) => {
                    results.statuses.push_success(provider.as_ref(), FETCH_USER_PERMS);
                    self.perms.touch_last_valid(account.id).await.map_err(|err| {
                        PermsSyncError::store(
                            format!("set last valid for external account {}", account.id),
                            err,
                        )
                    })?;
                    perms
                }
                Err(FetchError { error, partial }) => {
                    results
                        .statuses
                        .push_error(provider.as_ref(), FETCH_USER_PERMS, &error);

                    if error.expires_account() {
                        self.perms.touch_expired(account.id).await.map_err(|err| {
                            PermsSyncError::store(
                                format!("set expired for external account ID {}", account.id),
                                err,
                            )
                        })?;
                        warn!(
                            user_id = user.id,
                            external_account_id = account.id,
                            kind = ?error.kind,
                            "External account expired, revoking its access"
                        );
                        results.repo_perms.insert(account.id, Vec::new());
                        continue;
                    }

                    if error.kind == ProviderErrorKind::Unimplemented {
                        continue;
                    }

                    let mut perms = partial;
                    if error.is_temporary() {
                        warn!(
                            user_id = user.id,
                            external_account_id = account.id,
                            error = %error,
                            "Temporary error, returning previously synced permissions"
                        );
                        perms = self
                            .previous_user_perms(user, account, provider.as_ref(), results)
                            .await?;
                    }

                    if !no_perms {
                        return Err(PermsSyncError::provider(
                            format!(
                                "fetch user permissions for external account {} of user {:?} (id: {})",
                                account.id, user.username, user.id
                            ),
                            error,
                        ));
                    }
                    warn!(
                        user_id = user.id,
                        external_account_id = account.id,
                        error = %error,
                        "Proceeding with partial results"
                    );
                    perms
                }
            };

            self.resolve_account_perms(user, account, provider.as_ref(), perms, results)
                .await?;
        }

        Ok(())
    }

    /// Last-known-good state for the account: its stored repository grants
    /// go straight into `results`, its stored sub-repo rules come back as
    /// the fetched permissions.
    async fn previous_user_perms(
        &self,
        user: &user::Model,
        account: &user_external_account::Model,
        provider: &dyn AuthzProvider,
        results: &mut UserPermsResults,
    ) -> Result<ExternalUserPermissions, PermsSyncError> {
        let previous_sub_repo = self
            .perms
            .sub_repo_perms_by_user_and_service(
                user.id,
                provider.service_type(),
                provider.service_id(),
            )
            .await
            .map_err(|err| {
                PermsSyncError::store("fetching existing sub-repo permissions", err)
            })?;

        let previous_repos = self
            .perms
            .fetch_repos_by_external_account(account.id)
            .await
            .map_err(|err| PermsSyncError::store("fetching existing repo permissions", err))?;
        results
            .repo_perms
            .entry(account.id)
            .or_default()
            .extend(previous_repos);

        Ok(ExternalUserPermissions {
            sub_repo_permissions: previous_sub_repo
                .into_iter()
                .map(|(spec, perms)| (spec.id, perms))
                .collect(),
            ..Default::default()
        })
    }

    async fn resolve_account_perms(
        &self,
        user: &user::Model,
        account: &user_external_account::Model,
        provider: &dyn AuthzProvider,
        perms: ExternalUserPermissions,
        results: &mut UserPermsResults,
    ) -> Result<(), PermsSyncError> {
        let service_type = provider.service_type();
        let service_id = provider.service_id();

        let mut repo_ids = self
            .perms
            .resolve_repos_by_external_specs(
                service_type,
                service_id,
                &perms.exacts,
                self.config.repo_resolve_chunk_size,
            )
            .await
            .map_err(|err| {
                PermsSyncError::store("list private repositories by exact matching", err)
            })?;

        for (external_id, sub_repo) in perms.sub_repo_permissions {
            results.sub_repo_perms.insert(
                ExternalRepoSpec {
                    id: external_id,
                    service_type: service_type.to_string(),
                    service_id: service_id.to_string(),
                },
                sub_repo,
            );
        }

        if !perms.include_contains.is_empty() {
            let matched = self
                .perms
                .list_repos_by_contains(
                    service_type,
                    service_id,
                    &perms.include_contains,
                    &perms.exclude_contains,
                )
                .await
                .map_err(|err| {
                    PermsSyncError::store("list external repositories by contains matching", err)
                })?;
            repo_ids.extend(matched);
        }

        debug!(
            user_id = user.id,
            external_account_id = account.id,
            resolved = repo_ids.len(),
            "Resolved account permissions"
        );
        results
            .repo_perms
            .entry(account.id)
            .or_default()
            .extend(repo_ids);
        Ok(())
    }

    /// Turns pending grants bound to a newly linked account into grants.
    /// Failures are logged; the following user pass writes the account's
    /// grants anyway.
    async fn promote_pending_permissions(
        &self,
        user_id: i32,
        account: &user_external_account::Model,
    ) {
        let _guard = self.write_lock.lock().await;
        match self.perms.grant_pending_permissions(user_id, account).await {
            Ok(0) => {}
            Ok(granted) => info!(
                user_id,
                external_account_id = account.id,
                granted,
                "Granted pending permissions to newly linked account"
            ),
            Err(err) => warn!(
                user_id,
                external_account_id = account.id,
                error = %err,
                "Could not grant pending permissions"
            ),
        }
    }

    async fn latest_finished_job(&self, kind: SyncJobKind, target_id: i32) -> Option<SyncJob> {
        match self.jobs.get_latest_finished_sync_job(kind, target_id).await {
            Ok(job) => job,
            Err(err) => {
                warn!(kind = %kind, target_id, error = %err, "Could not load latest finished sync job");
                None
            }
        }
    }
}

/// Runs a provider call under `deadline`; elapsing counts as a temporary
/// provider error.
async fn with_deadline<T, E, F>(deadline: Duration, call: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Elapsed>,
{
    timeout(deadline, call)
        .await
        .unwrap_or_else(|elapsed| Err(E::from(elapsed)))
}

async fn rollback_quietly(txn: crate::repositories::PermsTransaction) {
    if let Err(err) = txn.rollback().await {
        warn!(error = %err, "Rolling back permissions transaction failed");
    }
}

fn record_sync(kind: SyncJobKind, started: Instant, success: bool) {
    histogram!(
        "perms_syncer_sync_duration_seconds",
        "type" => kind.as_str(),
        "success" => if success { "true" } else { "false" }
    )
    .record(started.elapsed().as_secs_f64());
    if !success {
        counter!("perms_syncer_sync_errors_total", "type" => kind.as_str()).increment(1);
    }
}

fn record_sync_delay(kind: SyncJobKind, last_job: Option<&SyncJob>, created_at: DateTimeWithTimeZone) {
    let now = Utc::now().fixed_offset();
    match last_job.and_then(|job| job.finished_at) {
        Some(finished_at) => {
            let delay = (now - finished_at).num_milliseconds() as f64 / 1_000.0;
            gauge!("perms_syncer_consecutive_sync_delay_seconds", "type" => kind.as_str()).set(delay);
        }
        None => {
            counter!("perms_syncer_first_sync_total", "type" => kind.as_str()).increment(1);
            let delay = (now - created_at).num_milliseconds() as f64 / 1_000.0;
            gauge!("perms_syncer_first_sync_delay_seconds", "type" => kind.as_str()).set(delay);
        }
    }
}
