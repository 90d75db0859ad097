//! Worker and resetter tests.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use permsync::authz::{AuthzProvider, FetchError, ProviderError};
use permsync::config::{AppConfig, PermsSyncConfig};
use permsync::error::PermsSyncError;
use permsync::models::permission_sync_job::{self, JobState, SyncJobKind};
use permsync::repositories::PermissionSyncJobOpts;
use permsync::resetter::{PermsSyncResetter, REPO_RESETTER_NAME};
use permsync::worker::{PermsSyncWorker, REPO_WORKER_NAME, USER_WORKER_NAME, WorkerConfig};
use sea_orm::{ActiveModelTrait, Set};
use test_utils::*;
use tokio_util::sync::CancellationToken;

fn repo_worker(h: &TestHarness) -> PermsSyncWorker {
    PermsSyncWorker::new(
        Arc::clone(&h.syncer),
        h.jobs.clone(),
        WorkerConfig::repo(&AppConfig::default(), "test-host"),
    )
}

fn user_worker(h: &TestHarness) -> PermsSyncWorker {
    PermsSyncWorker::new(
        Arc::clone(&h.syncer),
        h.jobs.clone(),
        WorkerConfig::user(&AppConfig::default(), "test-host"),
    )
}

#[tokio::test]
async fn worker_configs_follow_pool_rules() {
    let mut config = AppConfig::default();
    config.perms_sync.user_worker_concurrency = 4;

    let repo = WorkerConfig::repo(&config, "host-a");
    assert_eq!(repo.name, REPO_WORKER_NAME);
    assert_eq!(repo.kind, SyncJobKind::Repo);
    assert_eq!(repo.concurrency, 1);

    let user = WorkerConfig::user(&config, "host-a");
    assert_eq!(user.name, USER_WORKER_NAME);
    assert_eq!(user.kind, SyncJobKind::User);
    assert_eq!(user.concurrency, 4);
    assert_eq!(user.hostname, "host-a");
}

#[tokio::test]
async fn empty_queue_processes_nothing() -> Result<()> {
    let h = TestHarness::new(Vec::new()).await?;
    assert!(!repo_worker(&h).process_next().await?);
    Ok(())
}

#[tokio::test]
async fn successful_repo_job_is_completed_with_counts() -> Result<()> {
    let github = Arc::new(MockProvider::github());
    let h = TestHarness::new(vec![github.clone() as Arc<dyn AuthzProvider>]).await?;

    let repo = insert_github_repo(&h.db, "github.com/acme/widgets", "R_widgets").await?;
    let alice = insert_user(&h.db, "alice").await?;
    insert_external_account(&h.db, alice.id, GITHUB_TYPE, GITHUB_ID, "alice-gh").await?;
    github.set_repo_perms("R_widgets", Ok(account_ids(&["alice-gh"])));

    let job = h
        .jobs
        .create_repo_sync_job(repo.id, PermissionSyncJobOpts::default())
        .await?
        .expect("inserted");

    assert!(repo_worker(&h).process_next().await?);

    let done = h.jobs.get(job.id).await?.expect("job exists");
    assert_eq!(done.state, JobState::Completed.as_str());
    assert_eq!(done.permissions_added, 1);
    assert_eq!(done.permissions_found, 1);
    assert!(!done.is_partial_success);
    assert_eq!(
        done.code_host_states
            .as_ref()
            .and_then(|states| states.as_array())
            .map(Vec::len),
        Some(1)
    );
    assert_eq!(h.perms.load_repo_permissions(repo.id).await?, vec![alice.id]);
    Ok(())
}

#[tokio::test]
async fn job_where_every_provider_failed_is_marked_failed() -> Result<()> {
    let github = Arc::new(MockProvider::github());
    let h = TestHarness::new(vec![github.clone() as Arc<dyn AuthzProvider>]).await?;

    let alice = insert_user(&h.db, "alice").await?;
    insert_external_account(&h.db, alice.id, GITHUB_TYPE, GITHUB_ID, "alice-gh").await?;
    github.set_user_perms(
        "alice-gh",
        Err(FetchError::from(ProviderError::forbidden("token revoked"))),
    );

    let job = h
        .jobs
        .create_user_sync_job(alice.id, PermissionSyncJobOpts::default())
        .await?
        .expect("inserted");

    let worker = user_worker(&h);
    let claimed = h
        .jobs
        .dequeue(SyncJobKind::User, "test-host")
        .await?
        .expect("claimed");
    let err = worker
        .handle(claimed)
        .await
        .expect_err("all providers failed");
    assert!(matches!(err, PermsSyncError::AllProvidersFailed));

    let failed = h.jobs.get(job.id).await?.expect("job exists");
    assert_eq!(failed.state, JobState::Failed.as_str());
    assert_eq!(
        failed.failure_message.as_deref(),
        Some("all providers failed to sync permissions")
    );
    assert!(failed.code_host_states.is_some());
    Ok(())
}

#[tokio::test]
async fn engine_error_is_recorded_on_the_job() -> Result<()> {
    let github = Arc::new(MockProvider::github());
    let h = TestHarness::new(vec![github.clone() as Arc<dyn AuthzProvider>]).await?;

    let repo = insert_github_repo(&h.db, "github.com/acme/widgets", "R_widgets").await?;
    github.set_repo_perms(
        "R_widgets",
        Err(FetchError::from(ProviderError::from_status(500, "boom"))),
    );

    let job = h
        .jobs
        .create_repo_sync_job(repo.id, PermissionSyncJobOpts::default())
        .await?
        .expect("inserted");

    assert!(repo_worker(&h).process_next().await?);

    let failed = h.jobs.get(job.id).await?.expect("job exists");
    assert_eq!(failed.state, JobState::Failed.as_str());
    assert_eq!(failed.num_failures, 1);
    let message = failed.failure_message.expect("failure message");
    assert!(message.contains("github.com/acme/widgets"));
    assert!(message.contains("HTTP error 500: boom"));
    let states = failed.code_host_states.expect("statuses saved");
    assert_eq!(states[0]["status"], "ERROR");
    Ok(())
}

#[tokio::test]
async fn job_without_target_is_rejected() -> Result<()> {
    let h = TestHarness::new(Vec::new()).await?;

    let job = h
        .jobs
        .create_repo_sync_job(1, PermissionSyncJobOpts::default())
        .await?
        .expect("inserted");
    let mut active: permission_sync_job::ActiveModel = job.into();
    active.repository_id = Set(None);
    let orphan = active.update(h.db.as_ref()).await?;

    let err = repo_worker(&h)
        .handle(orphan.clone())
        .await
        .expect_err("job without target");
    assert!(matches!(err, PermsSyncError::InvalidJob { id } if id == orphan.id));
    Ok(())
}

#[tokio::test]
async fn run_loop_drains_queue_until_shutdown() -> Result<()> {
    let github = Arc::new(MockProvider::github());
    let h = TestHarness::new(vec![github.clone() as Arc<dyn AuthzProvider>]).await?;

    let alice = insert_user(&h.db, "alice").await?;
    let bob = insert_user(&h.db, "bob").await?;
    let mut job_ids = Vec::new();
    for user in [&alice, &bob] {
        let job = h
            .jobs
            .create_user_sync_job(user.id, PermissionSyncJobOpts::default())
            .await?
            .expect("inserted");
        job_ids.push(job.id);
    }

    let mut config = WorkerConfig::user(&AppConfig::default(), "test-host");
    config.poll_interval = StdDuration::from_millis(10);
    let worker = Arc::new(PermsSyncWorker::new(
        Arc::clone(&h.syncer),
        h.jobs.clone(),
        config,
    ));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&worker).run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    loop {
        let mut finished = 0;
        for id in &job_ids {
            let job = h.jobs.get(*id).await?.expect("job exists");
            if job.state == JobState::Completed.as_str() {
                finished += 1;
            }
        }
        if finished == job_ids.len() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs were not processed in time"
        );
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), handle).await??;
    Ok(())
}

#[tokio::test]
async fn resetter_tick_requeues_stalled_jobs() -> Result<()> {
    let h = TestHarness::new(Vec::new()).await?;

    h.jobs
        .create_repo_sync_job(1, PermissionSyncJobOpts::default())
        .await?
        .expect("inserted");
    let claimed = h
        .jobs
        .dequeue(SyncJobKind::Repo, "test-host")
        .await?
        .expect("claimed");
    let mut active: permission_sync_job::ActiveModel = claimed.clone().into();
    active.last_heartbeat_at = Set(Some((Utc::now() - Duration::minutes(30)).fixed_offset()));
    active.update(h.db.as_ref()).await?;

    let resetter = PermsSyncResetter::repo(h.jobs.clone(), &PermsSyncConfig::default());
    assert_eq!(resetter.name(), REPO_RESETTER_NAME);

    let outcome = resetter.tick().await?;
    assert_eq!(outcome.reset, vec![claimed.id]);

    let requeued = h.jobs.get(claimed.id).await?.expect("job exists");
    assert_eq!(requeued.state, JobState::Queued.as_str());
    assert_eq!(requeued.num_resets, 1);

    let outcome = resetter.tick().await?;
    assert!(outcome.reset.is_empty());
    assert!(outcome.failed.is_empty());
    Ok(())
}

#[tokio::test]
async fn resetter_run_stops_on_shutdown() -> Result<()> {
    let h = TestHarness::new(Vec::new()).await?;
    let resetter = PermsSyncResetter::user(h.jobs.clone(), &PermsSyncConfig::default());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(resetter.run(shutdown.clone()));
    shutdown.cancel();

    tokio::time::timeout(StdDuration::from_secs(5), handle).await??;
    Ok(())
}

#[tokio::test]
async fn run_loop_survives_a_panicking_handler() -> Result<()> {
    let github = Arc::new(MockProvider::github());
    let h = TestHarness::new(vec![github.clone() as Arc<dyn AuthzProvider>]).await?;

    let alice = insert_user(&h.db, "alice").await?;
    insert_external_account(&h.db, alice.id, GITHUB_TYPE, GITHUB_ID, "alice-gh").await?;
    github.set_panic_for_account("alice-gh");
    let bob = insert_user(&h.db, "bob").await?;

    let crashed = h
        .jobs
        .create_user_sync_job(alice.id, PermissionSyncJobOpts::default())
        .await?
        .expect("inserted");
    let healthy = h
        .jobs
        .create_user_sync_job(bob.id, PermissionSyncJobOpts::default())
        .await?
        .expect("inserted");

    let mut config = WorkerConfig::user(&AppConfig::default(), "test-host");
    config.poll_interval = StdDuration::from_millis(10);
    let worker = Arc::new(PermsSyncWorker::new(
        Arc::clone(&h.syncer),
        h.jobs.clone(),
        config,
    ));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&worker).run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    loop {
        let job = h.jobs.get(healthy.id).await?.expect("job exists");
        let crashed_job_ran = github.fetch_user_perms_calls.load(Ordering::SeqCst) == 1;
        if job.state == JobState::Completed.as_str() && crashed_job_ran {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs were not picked up in time"
        );
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    assert!(!handle.is_finished());

    let stuck = h.jobs.get(crashed.id).await?.expect("job exists");
    assert_eq!(stuck.state, JobState::Processing.as_str());
    assert_eq!(github.fetch_user_perms_calls.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), handle).await??;
    Ok(())
}
