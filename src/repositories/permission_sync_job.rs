//! # PermissionSyncJob Repository
//!
//! Durable queue of permission sync requests. One table serves both the
//! repo-sync and user-sync workers; each dequeue call restricts itself to
//! rows of its own [`SyncJobKind`].
//!
//! Dequeue order is `priority DESC, process_after ASC NULLS FIRST, id ASC`
//! and rows whose `process_after` lies in the future are never eligible.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, NullOrdering, Order};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tracing::{debug, info, warn};

use super::{StoreError, map_db_err};
use crate::authz::{CodeHostStatusesSet, SetPermissionsResult};
use crate::models::permission_sync_job::{
    ActiveModel, Column, Entity, JobState, Model, PermissionSyncJobPriority,
    PermissionSyncJobReason, SyncJobKind,
};

/// Cancellation reason recorded when a higher priority request supersedes a
/// queued job.
pub const HIGHER_PRIORITY_CANCELLATION: &str = "A job with higher priority was added.";

/// Failure message recorded when a job exhausts its resets.
pub const TOO_MANY_RESETS_MESSAGE: &str = "job exceeded maximum number of resets";

/// Options for enqueueing a sync job.
#[derive(Debug, Clone, Default)]
pub struct PermissionSyncJobOpts {
    pub priority: PermissionSyncJobPriority,
    pub invalidate_caches: bool,
    /// Delay the job until this instant. Delayed jobs bypass de-duplication.
    pub process_after: Option<DateTime<Utc>>,
    pub reason: Option<PermissionSyncJobReason>,
    pub triggered_by_user_id: Option<i32>,
    /// Apply partial provider results even when a provider call fails.
    pub no_perms: bool,
}

/// Filters for [`PermissionSyncJobRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct ListPermissionSyncJobOpts {
    pub state: Option<JobState>,
    pub user_id: Option<i32>,
    pub repository_id: Option<i32>,
    pub reason: Option<PermissionSyncJobReason>,
    pub limit: Option<u64>,
}

/// Result of one stalled-job sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    /// Jobs returned to `queued`.
    pub reset: Vec<i32>,
    /// Jobs marked failed after exhausting their resets.
    pub failed: Vec<i32>,
}

/// Repository for permission sync job database operations
#[derive(Debug, Clone)]
pub struct PermissionSyncJobRepository {
    db: Arc<DatabaseConnection>,
}

impl PermissionSyncJobRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Enqueue a repo-centric sync. Returns `None` when an equivalent or
    /// higher priority job is already queued.
    pub async fn create_repo_sync_job(
        &self,
        repo_id: i32,
        opts: PermissionSyncJobOpts,
    ) -> Result<Option<Model>, StoreError> {
        self.create_job(SyncJobKind::Repo, repo_id, opts).await
    }

    /// Enqueue a user-centric sync. Returns `None` when an equivalent or
    /// higher priority job is already queued.
    pub async fn create_user_sync_job(
        &self,
        user_id: i32,
        opts: PermissionSyncJobOpts,
    ) -> Result<Option<Model>, StoreError> {
        self.create_job(SyncJobKind::User, user_id, opts).await
    }

    async fn create_job(
        &self,
        kind: SyncJobKind,
        target_id: i32,
        opts: PermissionSyncJobOpts,
    ) -> Result<Option<Model>, StoreError> {
        let now = Utc::now().fixed_offset();
        let job = new_job(kind, target_id, &opts, now);

        if opts.process_after.is_some() {
            let created = job
                .insert(self.db.as_ref())
                .await
                .map_err(|err| map_db_err("failed to create delayed sync job", err))?;
            info!(
                job_id = created.id,
                kind = %kind,
                target_id,
                "Delayed permission sync job enqueued"
            );
            return Ok(Some(created));
        }

        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("failed to begin enqueue transaction", err))?;

        let existing = Entity::find()
            .filter(Column::State.eq(JobState::Queued.as_str()))
            .filter(kind.id_column().eq(target_id))
            .filter(Column::ProcessAfter.is_null())
            .filter(Column::Cancel.eq(false))
            .order_by_desc(Column::Priority)
            .one(&txn)
            .await
            .map_err(|err| map_db_err("failed to look up queued sync job", err))?;

        if let Some(existing) = existing {
            if existing.priority >= opts.priority.value() {
                txn.commit()
                    .await
                    .map_err(|err| map_db_err("failed to commit enqueue transaction", err))?;
                debug!(
                    existing_job_id = existing.id,
                    kind = %kind,
                    target_id,
                    "Equivalent sync job already queued, skipping"
                );
                return Ok(None);
            }

            Entity::update_many()
                .col_expr(Column::State, Expr::value(JobState::Cancelled.as_str()))
                .col_expr(Column::Cancel, Expr::value(true))
                .col_expr(
                    Column::CancellationReason,
                    Expr::value(HIGHER_PRIORITY_CANCELLATION),
                )
                .col_expr(Column::FinishedAt, Expr::value(now))
                .filter(Column::Id.eq(existing.id))
                .filter(Column::State.eq(JobState::Queued.as_str()))
                .exec(&txn)
                .await
                .map_err(|err| map_db_err("failed to cancel superseded sync job", err))?;
        }

        let created = job
            .insert(&txn)
            .await
            .map_err(|err| map_db_err("failed to create sync job", err))?;
        txn.commit()
            .await
            .map_err(|err| map_db_err("failed to commit enqueue transaction", err))?;

        info!(
            job_id = created.id,
            kind = %kind,
            target_id,
            priority = created.priority,
            reason = created.reason.as_deref().unwrap_or(""),
            "Permission sync job enqueued"
        );
        Ok(Some(created))
    }

    pub async fn get(&self, id: i32) -> Result<Option<Model>, StoreError> {
        Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load sync job", err))
    }

    /// Cancel a job that has not started yet.
    pub async fn cancel_queued_job(&self, reason: &str, id: i32) -> Result<(), StoreError> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Cancelled.as_str()))
            .col_expr(Column::Cancel, Expr::value(true))
            .col_expr(Column::CancellationReason, Expr::value(reason))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::State.eq(JobState::Queued.as_str()))
            .exec(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to cancel sync job", err))?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotFound {
                entity: "queued permission sync job",
                id,
            });
        }
        Ok(())
    }

    /// Claim the next eligible job of the given kind, moving it to
    /// `processing`.
    pub async fn dequeue(
        &self,
        kind: SyncJobKind,
        hostname: &str,
    ) -> Result<Option<Model>, StoreError> {
        let now = Utc::now().fixed_offset();
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("failed to begin dequeue transaction", err))?;

        let candidate = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::State.eq(JobState::Queued.as_str()))
            .filter(Column::Cancel.eq(false))
            .filter(kind.id_column().is_not_null())
            .filter(
                Condition::any()
                    .add(Column::ProcessAfter.is_null())
                    .add(Column::ProcessAfter.lte(now)),
            )
            .order_by_desc(Column::Priority)
            .order_by_with_nulls(Column::ProcessAfter, Order::Asc, NullOrdering::First)
            .order_by_asc(Column::Id)
            .limit(1)
            .into_tuple::<i32>()
            .one(&txn)
            .await
            .map_err(|err| map_db_err("failed to select next sync job", err))?;

        let Some(id) = candidate else {
            txn.commit()
                .await
                .map_err(|err| map_db_err("failed to commit dequeue transaction", err))?;
            return Ok(None);
        };

        let claimed = Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Processing.as_str()))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(Column::WorkerHostname, Expr::value(hostname))
            .filter(Column::Id.eq(id))
            .filter(Column::State.eq(JobState::Queued.as_str()))
            .exec(&txn)
            .await
            .map_err(|err| map_db_err("failed to claim sync job", err))?;

        if claimed.rows_affected == 0 {
            txn.commit()
                .await
                .map_err(|err| map_db_err("failed to commit dequeue transaction", err))?;
            return Ok(None);
        }

        let job = Entity::find_by_id(id)
            .one(&txn)
            .await
            .map_err(|err| map_db_err("failed to load claimed sync job", err))?;
        txn.commit()
            .await
            .map_err(|err| map_db_err("failed to commit dequeue transaction", err))?;

        Ok(job)
    }

    /// Refresh the heartbeat of a running job. Returns false when the job is
    /// no longer processing.
    pub async fn heartbeat(&self, id: i32) -> Result<bool, StoreError> {
        let result = Entity::update_many()
            .col_expr(
                Column::LastHeartbeatAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(Column::Id.eq(id))
            .filter(Column::State.eq(JobState::Processing.as_str()))
            .exec(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to record sync job heartbeat", err))?;
        Ok(result.rows_affected > 0)
    }

    /// Returns false when the job was no longer processing.
    pub async fn mark_completed(&self, id: i32) -> Result<bool, StoreError> {
        let result = Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Completed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::State.eq(JobState::Processing.as_str()))
            .exec(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to mark sync job completed", err))?;
        Ok(result.rows_affected > 0)
    }

    /// Returns false when the job was no longer processing.
    pub async fn mark_failed(&self, id: i32, message: &str) -> Result<bool, StoreError> {
        let result = Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Failed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(Utc::now().fixed_offset()))
            .col_expr(Column::FailureMessage, Expr::value(message))
            .col_expr(
                Column::NumFailures,
                Expr::col(Column::NumFailures).add(1),
            )
            .filter(Column::Id.eq(id))
            .filter(Column::State.eq(JobState::Processing.as_str()))
            .exec(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to mark sync job failed", err))?;
        Ok(result.rows_affected > 0)
    }

    /// Persist the outcome of a sync pass onto the job row.
    pub async fn save_sync_result(
        &self,
        id: i32,
        finished_successfully: bool,
        result: Option<&SetPermissionsResult>,
        statuses: &CodeHostStatusesSet,
    ) -> Result<(), StoreError> {
        let job = Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load sync job for result", err))?
            .ok_or(StoreError::NotFound {
                entity: "permission sync job",
                id,
            })?;

        let states = serde_json::to_value(statuses).map_err(|source| StoreError::Encode {
            field: "code_host_states",
            source,
        })?;
        let counts = result.copied().unwrap_or_default();

        let mut active: ActiveModel = job.into();
        active.permissions_added = Set(counts.added);
        active.permissions_removed = Set(counts.removed);
        active.permissions_found = Set(counts.found);
        active.code_host_states = Set(Some(states));
        active.is_partial_success = Set(finished_successfully && statuses.is_partial());
        active
            .update(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to save sync job result", err))?;
        Ok(())
    }

    /// Requeue jobs of the given kind stuck in `processing` longer than
    /// `max_age`. Jobs already reset `max_num_resets` times are failed
    /// instead.
    pub async fn reset_stalled(
        &self,
        kind: SyncJobKind,
        max_age: std::time::Duration,
        max_num_resets: i32,
    ) -> Result<ResetOutcome, StoreError> {
        let now = Utc::now().fixed_offset();
        let max_age = Duration::from_std(max_age).unwrap_or(Duration::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(now);

        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("failed to begin reset transaction", err))?;

        let stalled = Entity::find()
            .select_only()
            .column(Column::Id)
            .column(Column::NumResets)
            .filter(Column::State.eq(JobState::Processing.as_str()))
            .filter(kind.id_column().is_not_null())
            .filter(
                Condition::any()
                    .add(Column::LastHeartbeatAt.lt(cutoff))
                    .add(
                        Condition::all()
                            .add(Column::LastHeartbeatAt.is_null())
                            .add(Column::StartedAt.lt(cutoff)),
                    ),
            )
            .order_by_asc(Column::Id)
            .into_tuple::<(i32, i32)>()
            .all(&txn)
            .await
            .map_err(|err| map_db_err("failed to find stalled sync jobs", err))?;

        let (exhausted, resettable): (Vec<_>, Vec<_>) = stalled
            .into_iter()
            .partition(|(_, num_resets)| *num_resets >= max_num_resets);
        let outcome = ResetOutcome {
            reset: resettable.into_iter().map(|(id, _)| id).collect(),
            failed: exhausted.into_iter().map(|(id, _)| id).collect(),
        };

        if !outcome.reset.is_empty() {
            Entity::update_many()
                .col_expr(Column::State, Expr::value(JobState::Queued.as_str()))
                .col_expr(Column::NumResets, Expr::col(Column::NumResets).add(1))
                .col_expr(
                    Column::StartedAt,
                    Expr::value(Option::<DateTimeWithTimeZone>::None),
                )
                .col_expr(
                    Column::LastHeartbeatAt,
                    Expr::value(Option::<DateTimeWithTimeZone>::None),
                )
                .col_expr(Column::WorkerHostname, Expr::value(""))
                .filter(Column::Id.is_in(outcome.reset.clone()))
                .filter(Column::State.eq(JobState::Processing.as_str()))
                .exec(&txn)
                .await
                .map_err(|err| map_db_err("failed to requeue stalled sync jobs", err))?;
        }

        if !outcome.failed.is_empty() {
            Entity::update_many()
                .col_expr(Column::State, Expr::value(JobState::Failed.as_str()))
                .col_expr(Column::FinishedAt, Expr::value(now))
                .col_expr(Column::FailureMessage, Expr::value(TOO_MANY_RESETS_MESSAGE))
                .col_expr(
                    Column::NumFailures,
                    Expr::col(Column::NumFailures).add(1),
                )
                .filter(Column::Id.is_in(outcome.failed.clone()))
                .filter(Column::State.eq(JobState::Processing.as_str()))
                .exec(&txn)
                .await
                .map_err(|err| map_db_err("failed to fail exhausted sync jobs", err))?;
            warn!(
                kind = %kind,
                job_ids = ?outcome.failed,
                "Sync jobs exceeded maximum number of resets"
            );
        }

        txn.commit()
            .await
            .map_err(|err| map_db_err("failed to commit reset transaction", err))?;
        Ok(outcome)
    }

    /// Most recent completed or failed job for the repo or user.
    pub async fn get_latest_finished_sync_job(
        &self,
        kind: SyncJobKind,
        target_id: i32,
    ) -> Result<Option<Model>, StoreError> {
        Entity::find()
            .filter(kind.id_column().eq(target_id))
            .filter(Column::FinishedAt.is_not_null())
            .filter(Column::Cancel.eq(false))
            .filter(Column::State.is_in([JobState::Completed.as_str(), JobState::Failed.as_str()]))
            .order_by_desc(Column::FinishedAt)
            .order_by_desc(Column::Id)
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to load latest finished sync job", err))
    }

    /// Jobs matching the filters, newest first.
    pub async fn list(&self, opts: &ListPermissionSyncJobOpts) -> Result<Vec<Model>, StoreError> {
        let mut query = Entity::find().order_by_desc(Column::Id);

        if let Some(state) = opts.state {
            query = query.filter(Column::State.eq(state.as_str()));
        }
        if let Some(user_id) = opts.user_id {
            query = query.filter(Column::UserId.eq(user_id));
        }
        if let Some(repository_id) = opts.repository_id {
            query = query.filter(Column::RepositoryId.eq(repository_id));
        }
        if let Some(reason) = opts.reason {
            query = query.filter(Column::Reason.eq(reason.as_str()));
        }
        if let Some(limit) = opts.limit {
            query = query.limit(limit);
        }

        query
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to list sync jobs", err))
    }

    /// Number of users whose most recent finished sync failed.
    pub async fn count_users_with_failing_sync_job(&self) -> Result<usize, StoreError> {
        self.count_targets_with_failing_sync_job(SyncJobKind::User)
            .await
    }

    /// Number of repositories whose most recent finished sync failed.
    pub async fn count_repos_with_failing_sync_job(&self) -> Result<usize, StoreError> {
        self.count_targets_with_failing_sync_job(SyncJobKind::Repo)
            .await
    }

    async fn count_targets_with_failing_sync_job(
        &self,
        kind: SyncJobKind,
    ) -> Result<usize, StoreError> {
        let id_column = kind.id_column();
        let rows = Entity::find()
            .select_only()
            .column(id_column)
            .column(Column::State)
            .filter(id_column.is_not_null())
            .filter(Column::FinishedAt.is_not_null())
            .filter(Column::Cancel.eq(false))
            .filter(Column::State.is_in([JobState::Completed.as_str(), JobState::Failed.as_str()]))
            .order_by_asc(id_column)
            .order_by_desc(Column::FinishedAt)
            .order_by_desc(Column::Id)
            .into_tuple::<(i32, String)>()
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("failed to count failing sync jobs", err))?;

        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .filter(|(target_id, _)| seen.insert(*target_id))
            .filter(|(_, state)| state == JobState::Failed.as_str())
            .count())
    }
}

fn new_job(
    kind: SyncJobKind,
    target_id: i32,
    opts: &PermissionSyncJobOpts,
    now: DateTimeWithTimeZone,
) -> ActiveModel {
    let (repository_id, user_id) = match kind {
        SyncJobKind::Repo => (Some(target_id), None),
        SyncJobKind::User => (None, Some(target_id)),
    };

    ActiveModel {
        state: Set(JobState::Queued.as_str().to_string()),
        reason: Set(opts.reason.map(|reason| reason.as_str().to_string())),
        cancellation_reason: Set(None),
        triggered_by_user_id: Set(opts.triggered_by_user_id),
        failure_message: Set(None),
        queued_at: Set(now),
        started_at: Set(None),
        finished_at: Set(None),
        process_after: Set(opts.process_after.map(|at| at.fixed_offset())),
        num_resets: Set(0),
        num_failures: Set(0),
        last_heartbeat_at: Set(None),
        worker_hostname: Set(String::new()),
        cancel: Set(false),
        repository_id: Set(repository_id),
        user_id: Set(user_id),
        priority: Set(opts.priority.value()),
        no_perms: Set(opts.no_perms),
        invalidate_caches: Set(opts.invalidate_caches),
        permissions_added: Set(0),
        permissions_removed: Set(0),
        permissions_found: Set(0),
        code_host_states: Set(None),
        is_partial_success: Set(false),
        ..Default::default()
    }
}
