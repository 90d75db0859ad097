//! Permission sync job queue tests.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use permsync::authz::{
    CodeHostStatus, CodeHostStatusKind, CodeHostStatusesSet, SetPermissionsResult,
};
use permsync::models::permission_sync_job::{
    self, JobState, PermissionSyncJobPriority, PermissionSyncJobReason, SyncJobKind,
};
use permsync::repositories::{
    ListPermissionSyncJobOpts, PermissionSyncJobOpts, PermissionSyncJobRepository, StoreError,
    permission_sync_job::{HIGHER_PRIORITY_CANCELLATION, TOO_MANY_RESETS_MESSAGE},
};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use test_utils::setup_test_db_arc;

const HOST: &str = "worker-1";

fn priority(priority: PermissionSyncJobPriority) -> PermissionSyncJobOpts {
    PermissionSyncJobOpts {
        priority,
        ..Default::default()
    }
}

fn delayed(priority: PermissionSyncJobPriority, offset: Duration) -> PermissionSyncJobOpts {
    PermissionSyncJobOpts {
        priority,
        process_after: Some(Utc::now() + offset),
        ..Default::default()
    }
}

async fn age_heartbeat(
    db: &DatabaseConnection,
    job: permission_sync_job::Model,
    age: Duration,
) -> Result<()> {
    let mut active: permission_sync_job::ActiveModel = job.into();
    active.last_heartbeat_at = Set(Some((Utc::now() - age).fixed_offset()));
    active.update(db).await?;
    Ok(())
}

fn status(kind: CodeHostStatusKind) -> CodeHostStatus {
    CodeHostStatus {
        provider_id: "https://github.com/".to_string(),
        provider_type: "github".to_string(),
        status: kind,
        message: "FetchUserPerms".to_string(),
    }
}

#[tokio::test]
async fn enqueue_deduplicates_by_priority() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db);

    let low = jobs
        .create_user_sync_job(7, priority(PermissionSyncJobPriority::Low))
        .await?
        .expect("first job is inserted");
    assert!(
        jobs.create_user_sync_job(7, priority(PermissionSyncJobPriority::Low))
            .await?
            .is_none()
    );

    let high = jobs
        .create_user_sync_job(
            7,
            PermissionSyncJobOpts {
                priority: PermissionSyncJobPriority::High,
                reason: Some(PermissionSyncJobReason::ManualUserSync),
                triggered_by_user_id: Some(1),
                ..Default::default()
            },
        )
        .await?
        .expect("higher priority job supersedes");
    assert_eq!(high.reason.as_deref(), Some("REASON_MANUAL_USER_SYNC"));
    assert_eq!(high.triggered_by_user_id, Some(1));

    let cancelled = jobs.get(low.id).await?.expect("job exists");
    assert_eq!(cancelled.state, JobState::Cancelled.as_str());
    assert!(cancelled.cancel);
    assert_eq!(
        cancelled.cancellation_reason.as_deref(),
        Some(HIGHER_PRIORITY_CANCELLATION)
    );
    assert!(cancelled.finished_at.is_some());

    assert!(
        jobs.create_user_sync_job(7, priority(PermissionSyncJobPriority::Medium))
            .await?
            .is_none()
    );

    // Another target is never deduplicated against this one.
    assert!(
        jobs.create_user_sync_job(8, priority(PermissionSyncJobPriority::Low))
            .await?
            .is_some()
    );
    assert!(
        jobs.create_repo_sync_job(7, priority(PermissionSyncJobPriority::Low))
            .await?
            .is_some()
    );
    Ok(())
}

#[tokio::test]
async fn delayed_jobs_bypass_deduplication() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db);

    jobs.create_repo_sync_job(3, priority(PermissionSyncJobPriority::High))
        .await?
        .expect("inserted");
    let delayed_job = jobs
        .create_repo_sync_job(
            3,
            delayed(PermissionSyncJobPriority::Low, Duration::minutes(30)),
        )
        .await?
        .expect("delayed jobs are always inserted");
    assert!(delayed_job.process_after.is_some());

    let queued = jobs
        .list(&ListPermissionSyncJobOpts {
            repository_id: Some(3),
            state: Some(JobState::Queued),
            ..Default::default()
        })
        .await?;
    assert_eq!(queued.len(), 2);
    Ok(())
}

#[tokio::test]
async fn dequeue_orders_by_priority_then_process_after_then_id() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db);

    let low = jobs
        .create_repo_sync_job(1, priority(PermissionSyncJobPriority::Low))
        .await?
        .expect("inserted");
    let high = jobs
        .create_repo_sync_job(2, priority(PermissionSyncJobPriority::High))
        .await?
        .expect("inserted");
    let high_older = jobs
        .create_repo_sync_job(
            3,
            delayed(PermissionSyncJobPriority::High, Duration::hours(-2)),
        )
        .await?
        .expect("inserted");
    let high_newer = jobs
        .create_repo_sync_job(
            4,
            delayed(PermissionSyncJobPriority::High, Duration::hours(-1)),
        )
        .await?
        .expect("inserted");
    let medium = jobs
        .create_repo_sync_job(5, priority(PermissionSyncJobPriority::Medium))
        .await?
        .expect("inserted");
    let high_second = jobs
        .create_repo_sync_job(6, priority(PermissionSyncJobPriority::High))
        .await?
        .expect("inserted");
    let future = jobs
        .create_repo_sync_job(
            7,
            delayed(PermissionSyncJobPriority::High, Duration::hours(1)),
        )
        .await?
        .expect("inserted");
    jobs.create_user_sync_job(1, priority(PermissionSyncJobPriority::High))
        .await?
        .expect("inserted");

    let mut order = Vec::new();
    while let Some(job) = jobs.dequeue(SyncJobKind::Repo, HOST).await? {
        assert_eq!(job.state, JobState::Processing.as_str());
        assert_eq!(job.worker_hostname, HOST);
        assert!(job.started_at.is_some());
        assert!(job.last_heartbeat_at.is_some());
        order.push(job.id);
    }

    assert_eq!(
        order,
        vec![
            high.id,
            high_second.id,
            high_older.id,
            high_newer.id,
            medium.id,
            low.id
        ]
    );

    let untouched = jobs.get(future.id).await?.expect("job exists");
    assert_eq!(untouched.state, JobState::Queued.as_str());
    Ok(())
}

#[tokio::test]
async fn cancelled_jobs_are_never_dequeued() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db);

    let job = jobs
        .create_user_sync_job(2, priority(PermissionSyncJobPriority::Low))
        .await?
        .expect("inserted");
    jobs.cancel_queued_job("user deleted", job.id).await?;

    assert!(jobs.dequeue(SyncJobKind::User, HOST).await?.is_none());
    let cancelled = jobs.get(job.id).await?.expect("job exists");
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("user deleted"));

    let err = jobs
        .cancel_queued_job("again", job.id)
        .await
        .expect_err("only queued jobs can be cancelled");
    assert!(matches!(err, StoreError::NotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn heartbeat_and_completion_require_processing_state() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db);

    let job = jobs
        .create_user_sync_job(5, priority(PermissionSyncJobPriority::Medium))
        .await?
        .expect("inserted");
    assert!(!jobs.heartbeat(job.id).await?);

    let claimed = jobs
        .dequeue(SyncJobKind::User, HOST)
        .await?
        .expect("job is eligible");
    assert!(jobs.heartbeat(claimed.id).await?);
    assert!(jobs.mark_completed(claimed.id).await?);

    assert!(!jobs.heartbeat(claimed.id).await?);
    assert!(!jobs.mark_failed(claimed.id, "too late").await?);

    let finished = jobs.get(claimed.id).await?.expect("job exists");
    assert_eq!(finished.state, JobState::Completed.as_str());
    assert_eq!(finished.num_failures, 0);
    assert!(finished.finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn mark_failed_records_message() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db);

    jobs.create_repo_sync_job(5, priority(PermissionSyncJobPriority::Low))
        .await?
        .expect("inserted");
    let claimed = jobs
        .dequeue(SyncJobKind::Repo, HOST)
        .await?
        .expect("job is eligible");

    assert!(jobs.mark_failed(claimed.id, "code host unavailable").await?);

    let failed = jobs.get(claimed.id).await?.expect("job exists");
    assert_eq!(failed.state, JobState::Failed.as_str());
    assert_eq!(failed.failure_message.as_deref(), Some("code host unavailable"));
    assert_eq!(failed.num_failures, 1);
    Ok(())
}

#[tokio::test]
async fn reset_stalled_requeues_then_fails_exhausted_jobs() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db.clone());
    let max_age = StdDuration::from_secs(300);

    jobs.create_repo_sync_job(1, priority(PermissionSyncJobPriority::Low))
        .await?
        .expect("inserted");
    jobs.create_repo_sync_job(2, priority(PermissionSyncJobPriority::Low))
        .await?
        .expect("inserted");
    let stalled = jobs.dequeue(SyncJobKind::Repo, HOST).await?.expect("claimed");
    let healthy = jobs.dequeue(SyncJobKind::Repo, HOST).await?.expect("claimed");

    age_heartbeat(&db, stalled.clone(), Duration::minutes(10)).await?;

    // User resetters leave repo jobs alone.
    let outcome = jobs.reset_stalled(SyncJobKind::User, max_age, 1).await?;
    assert!(outcome.reset.is_empty());

    let outcome = jobs.reset_stalled(SyncJobKind::Repo, max_age, 1).await?;
    assert_eq!(outcome.reset, vec![stalled.id]);
    assert!(outcome.failed.is_empty());

    let requeued = jobs.get(stalled.id).await?.expect("job exists");
    assert_eq!(requeued.state, JobState::Queued.as_str());
    assert_eq!(requeued.num_resets, 1);
    assert!(requeued.started_at.is_none());
    assert!(requeued.last_heartbeat_at.is_none());
    assert_eq!(requeued.worker_hostname, "");

    let untouched = jobs.get(healthy.id).await?.expect("job exists");
    assert_eq!(untouched.state, JobState::Processing.as_str());

    // Claimed and stalled again, now out of resets.
    let reclaimed = jobs.dequeue(SyncJobKind::Repo, HOST).await?.expect("claimed");
    assert_eq!(reclaimed.id, stalled.id);
    age_heartbeat(&db, reclaimed, Duration::minutes(10)).await?;

    let outcome = jobs.reset_stalled(SyncJobKind::Repo, max_age, 1).await?;
    assert!(outcome.reset.is_empty());
    assert_eq!(outcome.failed, vec![stalled.id]);

    let failed = jobs.get(stalled.id).await?.expect("job exists");
    assert_eq!(failed.state, JobState::Failed.as_str());
    assert_eq!(failed.failure_message.as_deref(), Some(TOO_MANY_RESETS_MESSAGE));
    assert!(failed.finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn save_sync_result_records_counts_and_partial_success() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db);

    jobs.create_user_sync_job(9, priority(PermissionSyncJobPriority::Low))
        .await?
        .expect("inserted");
    let job = jobs.dequeue(SyncJobKind::User, HOST).await?.expect("claimed");

    let statuses = CodeHostStatusesSet::from(vec![
        status(CodeHostStatusKind::Success),
        status(CodeHostStatusKind::Error),
    ]);
    let result = SetPermissionsResult {
        added: 3,
        removed: 1,
        found: 4,
    };

    jobs.save_sync_result(job.id, true, Some(&result), &statuses)
        .await?;

    let saved = jobs.get(job.id).await?.expect("job exists");
    assert_eq!(saved.permissions_added, 3);
    assert_eq!(saved.permissions_removed, 1);
    assert_eq!(saved.permissions_found, 4);
    assert!(saved.is_partial_success);
    let states = saved.code_host_states.expect("states saved");
    assert_eq!(states.as_array().map(Vec::len), Some(2));
    assert_eq!(states[1]["status"], "ERROR");

    jobs.save_sync_result(job.id, false, None, &statuses).await?;
    let saved = jobs.get(job.id).await?.expect("job exists");
    assert!(!saved.is_partial_success);
    assert_eq!(saved.permissions_added, 0);

    let err = jobs
        .save_sync_result(9_999, true, None, &CodeHostStatusesSet::new())
        .await
        .expect_err("missing job");
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn latest_finished_job_and_failing_counts() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db);

    async fn run_user_job(
        jobs: &PermissionSyncJobRepository,
        user_id: i32,
        succeed: bool,
    ) -> Result<i32> {
        jobs.create_user_sync_job(user_id, priority(PermissionSyncJobPriority::Low))
            .await?
            .expect("inserted");
        let job = jobs.dequeue(SyncJobKind::User, HOST).await?.expect("claimed");
        if succeed {
            jobs.mark_completed(job.id).await?;
        } else {
            jobs.mark_failed(job.id, "boom").await?;
        }
        Ok(job.id)
    }

    // User 1 recovered, user 2 regressed, user 3 never failed.
    run_user_job(&jobs, 1, false).await?;
    let recovered = run_user_job(&jobs, 1, true).await?;
    run_user_job(&jobs, 2, true).await?;
    let regressed = run_user_job(&jobs, 2, false).await?;
    run_user_job(&jobs, 3, true).await?;

    assert_eq!(jobs.count_users_with_failing_sync_job().await?, 1);
    assert_eq!(jobs.count_repos_with_failing_sync_job().await?, 0);

    let latest = jobs
        .get_latest_finished_sync_job(SyncJobKind::User, 1)
        .await?
        .expect("user 1 has finished jobs");
    assert_eq!(latest.id, recovered);
    let latest = jobs
        .get_latest_finished_sync_job(SyncJobKind::User, 2)
        .await?
        .expect("user 2 has finished jobs");
    assert_eq!(latest.id, regressed);
    assert!(
        jobs.get_latest_finished_sync_job(SyncJobKind::Repo, 1)
            .await?
            .is_none()
    );
    Ok(())
}

#[tokio::test]
async fn list_filters_and_limits() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db);

    for repo_id in 1..=3 {
        jobs.create_repo_sync_job(
            repo_id,
            PermissionSyncJobOpts {
                reason: Some(PermissionSyncJobReason::RepoNoPerms),
                ..Default::default()
            },
        )
        .await?
        .expect("inserted");
    }
    jobs.create_user_sync_job(
        1,
        PermissionSyncJobOpts {
            reason: Some(PermissionSyncJobReason::UserAdded),
            ..Default::default()
        },
    )
    .await?
    .expect("inserted");

    let by_reason = jobs
        .list(&ListPermissionSyncJobOpts {
            reason: Some(PermissionSyncJobReason::RepoNoPerms),
            ..Default::default()
        })
        .await?;
    assert_eq!(by_reason.len(), 3);
    assert!(by_reason.windows(2).all(|pair| pair[0].id > pair[1].id));

    let limited = jobs
        .list(&ListPermissionSyncJobOpts {
            limit: Some(2),
            ..Default::default()
        })
        .await?;
    assert_eq!(limited.len(), 2);

    let for_user = jobs
        .list(&ListPermissionSyncJobOpts {
            user_id: Some(1),
            ..Default::default()
        })
        .await?;
    assert_eq!(for_user.len(), 1);
    assert_eq!(for_user[0].kind(), Some(SyncJobKind::User));
    Ok(())
}

#[tokio::test]
async fn dequeue_skips_future_and_non_queued_rows_in_a_mixed_queue() -> Result<()> {
    use PermissionSyncJobPriority::{High, Low, Medium};

    let db = setup_test_db_arc().await?;
    let jobs = PermissionSyncJobRepository::new(db.clone());

    // (priority, process_after offset in hours, state the row ends up in)
    let fixture: [(PermissionSyncJobPriority, Option<i64>, JobState); 16] = [
        (Low, None, JobState::Queued),
        (High, None, JobState::Queued),
        (Medium, None, JobState::Processing),
        (High, Some(-3), JobState::Queued),
        (Medium, Some(-1), JobState::Queued),
        (High, None, JobState::Completed),
        (Low, Some(-2), JobState::Queued),
        (High, Some(1), JobState::Queued),
        (Medium, None, JobState::Queued),
        (High, None, JobState::Failed),
        (High, Some(-1), JobState::Queued),
        (Low, None, JobState::Cancelled),
        (Medium, None, JobState::Queued),
        (Low, Some(2), JobState::Queued),
        (High, Some(-5), JobState::Processing),
        (Medium, Some(-4), JobState::Queued),
    ];

    let mut ids = Vec::new();
    for (repo_id, (prio, offset, state)) in (1..).zip(fixture) {
        let opts = match offset {
            Some(hours) => delayed(prio, Duration::hours(hours)),
            None => priority(prio),
        };
        let job = jobs
            .create_repo_sync_job(repo_id, opts)
            .await?
            .expect("inserted");
        ids.push(job.id);

        match state {
            JobState::Queued => {}
            JobState::Cancelled => jobs.cancel_queued_job("repo deleted", job.id).await?,
            other => {
                let mut active: permission_sync_job::ActiveModel = job.into();
                active.state = Set(other.as_str().to_string());
                active.update(db.as_ref()).await?;
            }
        }
    }

    let mut order = Vec::new();
    while let Some(job) = jobs.dequeue(SyncJobKind::Repo, HOST).await? {
        order.push(job.id);
    }

    let expected: Vec<i32> = [2, 4, 11, 9, 13, 16, 5, 1, 7]
        .iter()
        .map(|row: &usize| ids[row - 1])
        .collect();
    assert_eq!(order, expected);

    for row in [3, 6, 10, 12, 15] {
        let job = jobs.get(ids[row - 1]).await?.expect("job exists");
        assert_ne!(job.worker_hostname, HOST, "row {row} must not be claimed");
    }
    for row in [8, 14] {
        let job = jobs.get(ids[row - 1]).await?.expect("job exists");
        assert_eq!(job.state, JobState::Queued.as_str());
    }
    Ok(())
}
