//! Periodic sweep that returns stalled permission sync jobs to the queue.
//!
//! A job counts as stalled when its worker stopped heartbeating for longer
//! than the configured max age. Jobs that have already been reset too many
//! times are failed instead of requeued.

use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::PermsSyncConfig;
use crate::models::permission_sync_job::SyncJobKind;
use crate::repositories::{PermissionSyncJobRepository, ResetOutcome, StoreError};

pub const REPO_RESETTER_NAME: &str = "repo_permissions_sync_job_worker_resetter";
pub const USER_RESETTER_NAME: &str = "user_permissions_sync_job_worker_resetter";

pub struct PermsSyncResetter {
    name: String,
    kind: SyncJobKind,
    jobs: PermissionSyncJobRepository,
    interval: Duration,
    max_age: Duration,
    max_num_resets: i32,
}

impl PermsSyncResetter {
    pub fn new(
        name: impl Into<String>,
        kind: SyncJobKind,
        jobs: PermissionSyncJobRepository,
        config: &PermsSyncConfig,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            jobs,
            interval: config.resetter_interval(),
            max_age: config.resetter_max_age(),
            max_num_resets: config.resetter_max_num_resets,
        }
    }

    /// Resetter for repo-sync jobs.
    pub fn repo(jobs: PermissionSyncJobRepository, config: &PermsSyncConfig) -> Self {
        Self::new(REPO_RESETTER_NAME, SyncJobKind::Repo, jobs, config)
    }

    pub fn user(jobs: PermissionSyncJobRepository, config: &PermsSyncConfig) -> Self {
        Self::new(USER_RESETTER_NAME, SyncJobKind::User, jobs, config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the reset loop until the provided shutdown token fires.
    #[instrument(skip_all, fields(resetter = %self.name))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting permission sync resetter");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Permission sync resetter shutdown requested");
                    break;
                }
                _ = sleep(self.interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Resetter tick failed");
                    }
                    histogram!("perms_sync_resetter_tick_duration_ms", "name" => self.name.clone())
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Permission sync resetter stopped");
    }

    /// One sweep over processing jobs of this resetter's kind.
    pub async fn tick(&self) -> Result<ResetOutcome, StoreError> {
        let outcome = self
            .jobs
            .reset_stalled(self.kind, self.max_age, self.max_num_resets)
            .await?;

        if !outcome.reset.is_empty() {
            info!(
                resetter = %self.name,
                count = outcome.reset.len(),
                job_ids = ?outcome.reset,
                "Requeued stalled permission sync jobs"
            );
            counter!("perms_sync_resetter_resets_total", "name" => self.name.clone())
                .increment(outcome.reset.len() as u64);
        }
        if !outcome.failed.is_empty() {
            warn!(
                resetter = %self.name,
                count = outcome.failed.len(),
                "Failed permission sync jobs that exceeded their resets"
            );
            counter!("perms_sync_resetter_failures_total", "name" => self.name.clone())
                .increment(outcome.failed.len() as u64);
        }

        Ok(outcome)
    }
}
