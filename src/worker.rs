//! # Permission Sync Worker
//!
//! Pulls jobs of one kind from the permission sync queue and runs them
//! through the [`PermsSyncer`]. The repo pool runs a single handler; the
//! user pool's concurrency is configurable.
//!
//! Every job ends `completed` or `failed`, and its counts and per-provider
//! statuses are written back onto the row either way.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::authz::FetchPermsOptions;
use crate::config::{AppConfig, REPO_WORKER_CONCURRENCY};
use crate::error::PermsSyncError;
use crate::models::permission_sync_job::{Model as SyncJob, SyncJobKind};
use crate::perms_syncer::{PermsSyncer, SyncFailure, SyncOutcome};
use crate::repositories::{PermissionSyncJobRepository, StoreError};
use crate::telemetry::{TraceContext, current_trace_id, with_trace_context};

pub const REPO_WORKER_NAME: &str = "repo_permissions_sync_job_worker";
pub const USER_WORKER_NAME: &str = "user_permissions_sync_job_worker";

/// Upper bound of the random extension applied to idle poll delays.
const POLL_JITTER_PCT: f64 = 0.1;

/// Configuration of one worker pool
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub kind: SyncJobKind,
    /// Maximum number of jobs handled at once
    pub concurrency: usize,
    /// Delay before polling again when the queue is empty
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Recorded on claimed rows
    pub hostname: String,
}

impl WorkerConfig {
    /// Repo-sync pool; always a single handler.
    pub fn repo(config: &AppConfig, hostname: impl Into<String>) -> Self {
        Self {
            name: REPO_WORKER_NAME.to_string(),
            kind: SyncJobKind::Repo,
            concurrency: REPO_WORKER_CONCURRENCY,
            poll_interval: config.perms_sync.poll_interval(),
            heartbeat_interval: config.perms_sync.heartbeat_interval(),
            hostname: hostname.into(),
        }
    }

    pub fn user(config: &AppConfig, hostname: impl Into<String>) -> Self {
        Self {
            name: USER_WORKER_NAME.to_string(),
            kind: SyncJobKind::User,
            concurrency: config.perms_sync.user_worker_concurrency.max(1),
            poll_interval: config.perms_sync.poll_interval(),
            heartbeat_interval: config.perms_sync.heartbeat_interval(),
            hostname: hostname.into(),
        }
    }
}

pub struct PermsSyncWorker {
    syncer: Arc<PermsSyncer>,
    jobs: PermissionSyncJobRepository,
    config: WorkerConfig,
}

impl PermsSyncWorker {
    pub fn new(
        syncer: Arc<PermsSyncer>,
        jobs: PermissionSyncJobRepository,
        config: WorkerConfig,
    ) -> Self {
        Self {
            syncer,
            jobs,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the dequeue loop until `shutdown` fires, then wait for in-flight
    /// jobs to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker = %self.config.name,
            concurrency = self.config.concurrency,
            "Starting permission sync worker"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                self.log_join_error(joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.jobs.dequeue(self.config.kind, &self.config.hostname).await {
                Ok(Some(job)) => {
                    let worker = Arc::clone(&self);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        let _ = worker.handle(job).await;
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(err) => {
                    drop(permit);
                    error!(worker = %self.config.name, error = %err, "Dequeue failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(jittered_poll_delay(self.config.poll_interval)) => {}
            }
        }

        info!(
            worker = %self.config.name,
            in_flight = in_flight.len(),
            "Permission sync worker shutdown requested"
        );
        while let Some(joined) = in_flight.join_next().await {
            self.log_join_error(joined);
        }
        info!(worker = %self.config.name, "Permission sync worker stopped");
    }

    /// A handler that panicked leaves its job `processing` until the
    /// resetter requeues it.
    fn log_join_error(&self, joined: Result<(), JoinError>) {
        if let Err(err) = joined {
            error!(
                worker = %self.config.name,
                error = %err,
                "Permission sync job handler terminated abnormally"
            );
        }
    }

    /// Claim and handle a single job. Returns false when the queue had
    /// nothing eligible.
    pub async fn process_next(&self) -> Result<bool, StoreError> {
        let Some(job) = self
            .jobs
            .dequeue(self.config.kind, &self.config.hostname)
            .await?
        else {
            return Ok(false);
        };
        let _ = self.handle(job).await;
        Ok(true)
    }

    /// Run one claimed job and record its outcome. The returned error is
    /// the one written to the job's failure message.
    #[instrument(skip_all, fields(worker = %self.config.name, job_id = job.id))]
    pub async fn handle(&self, job: SyncJob) -> Result<(), PermsSyncError> {
        let started = Instant::now();
        let _heartbeat = self.spawn_heartbeat(job.id).drop_guard();

        let outcome = with_trace_context(TraceContext::for_job(job.id), self.execute(&job)).await;

        let label = match &outcome {
            Ok(()) => {
                match self.jobs.mark_completed(job.id).await {
                    Ok(true) => {}
                    Ok(false) => warn!(job_id = job.id, "Job was no longer processing when completed"),
                    Err(err) => error!(job_id = job.id, error = %err, "Could not mark job completed"),
                }
                info!(
                    job_id = job.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Permission sync job completed"
                );
                "completed"
            }
            Err(sync_err) => {
                match self.jobs.mark_failed(job.id, &sync_err.to_string()).await {
                    Ok(true) => {}
                    Ok(false) => warn!(job_id = job.id, "Job was no longer processing when failed"),
                    Err(err) => error!(job_id = job.id, error = %err, "Could not mark job failed"),
                }
                warn!(
                    job_id = job.id,
                    code = sync_err.code(),
                    error = %sync_err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Permission sync job failed"
                );
                "failed"
            }
        };

        counter!(
            "perms_sync_worker_jobs_total",
            "name" => self.config.name.clone(),
            "outcome" => label
        )
        .increment(1);
        histogram!("perms_sync_worker_job_duration_seconds", "name" => self.config.name.clone())
            .record(started.elapsed().as_secs_f64());

        outcome
    }

    /// Sync the job's target and persist the result onto the row.
    async fn execute(&self, job: &SyncJob) -> Result<(), PermsSyncError> {
        let opts = FetchPermsOptions {
            invalidate_caches: job.invalidate_caches,
        };

        let synced = match (job.repository_id, job.user_id) {
            (Some(repo_id), None) => {
                self.syncer
                    .sync_repo_perms(repo_id, job.no_perms, opts)
                    .await
            }
            (None, Some(user_id)) => {
                self.syncer
                    .sync_user_perms(user_id, job.no_perms, opts)
                    .await
            }
            _ => return Err(PermsSyncError::InvalidJob { id: job.id }),
        };

        let (sync_err, result, statuses) = match synced {
            Ok(SyncOutcome { result, statuses }) => {
                // A pass in which every consulted provider failed is a failure
                // even though the engine returned no error.
                let err = statuses.all_failed().then_some(PermsSyncError::AllProvidersFailed);
                (err, result, statuses)
            }
            Err(SyncFailure {
                error,
                result,
                statuses,
            }) => (Some(error), result, statuses),
        };

        debug!(
            job_id = job.id,
            trace_id = current_trace_id().unwrap_or_default(),
            statuses = %statuses.summary(),
            "Saving sync result"
        );
        let saved = self
            .jobs
            .save_sync_result(job.id, sync_err.is_none(), Some(&result), &statuses)
            .await;

        match (sync_err, saved) {
            (None, Ok(())) => Ok(()),
            (Some(err), Ok(())) => Err(err),
            (None, Err(persist)) => Err(PermsSyncError::store(
                "save permission sync job result",
                persist,
            )),
            (Some(sync), Err(persist)) => Err(PermsSyncError::ResultPersistence {
                sync: Box::new(sync),
                persist,
            }),
        }
    }

    /// Periodically refresh the job's heartbeat until the returned token is
    /// cancelled.
    fn spawn_heartbeat(&self, job_id: i32) -> CancellationToken {
        let stop = CancellationToken::new();
        let jobs = self.jobs.clone();
        let interval = self.config.heartbeat_interval;
        let token = stop.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => match jobs.heartbeat(job_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(job_id, "Job no longer processing, stopping heartbeat");
                            break;
                        }
                        Err(err) => warn!(job_id, error = %err, "Heartbeat failed"),
                    },
                }
            }
        });

        stop
    }
}

fn jittered_poll_delay(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    compute_poll_delay(base, &mut rng)
}

fn compute_poll_delay<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    if base.is_zero() {
        return base;
    }
    base.mul_f64(1.0 + rng.gen_range(0.0..=POLL_JITTER_PCT))
}
