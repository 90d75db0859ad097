//! # Service Wiring
//!
//! Assembles the sync engine with its worker pools and resetters and runs
//! them until shutdown.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::authz::ProviderRegistry;
use crate::config::AppConfig;
use crate::perms_syncer::{PermsSyncer, SyncerConfig};
use crate::repositories::{PermissionSyncJobRepository, PermsRepository};
use crate::resetter::PermsSyncResetter;
use crate::worker::{PermsSyncWorker, WorkerConfig};

/// Shared resources of a running permission sync process
pub struct PermsSyncService {
    syncer: Arc<PermsSyncer>,
    jobs: PermissionSyncJobRepository,
    providers: Arc<ProviderRegistry>,
    config: AppConfig,
    hostname: String,
}

impl PermsSyncService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        providers: Arc<ProviderRegistry>,
        config: AppConfig,
        hostname: impl Into<String>,
    ) -> Self {
        let perms = PermsRepository::new(Arc::clone(&db));
        let jobs = PermissionSyncJobRepository::new(db);
        let syncer = Arc::new(PermsSyncer::new(
            perms,
            jobs.clone(),
            Arc::clone(&providers),
            SyncerConfig::from(&config),
        ));

        Self {
            syncer,
            jobs,
            providers,
            config,
            hostname: hostname.into(),
        }
    }

    pub fn syncer(&self) -> Arc<PermsSyncer> {
        Arc::clone(&self.syncer)
    }

    pub fn jobs(&self) -> &PermissionSyncJobRepository {
        &self.jobs
    }

    /// Registry the engine reads; replace its providers to reconfigure a
    /// running service.
    pub fn providers(&self) -> Arc<ProviderRegistry> {
        Arc::clone(&self.providers)
    }

    /// Run both worker pools and both resetters until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let repo_worker = Arc::new(PermsSyncWorker::new(
            self.syncer(),
            self.jobs.clone(),
            WorkerConfig::repo(&self.config, self.hostname.clone()),
        ));
        let user_worker = Arc::new(PermsSyncWorker::new(
            self.syncer(),
            self.jobs.clone(),
            WorkerConfig::user(&self.config, self.hostname.clone()),
        ));
        let repo_resetter = PermsSyncResetter::repo(self.jobs.clone(), &self.config.perms_sync);
        let user_resetter = PermsSyncResetter::user(self.jobs.clone(), &self.config.perms_sync);

        info!(
            hostname = %self.hostname,
            providers = self.providers.snapshot().len(),
            dotcom_mode = self.config.dotcom_mode,
            "Starting permission sync service"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(repo_worker.run(shutdown.child_token()));
        tasks.spawn(user_worker.run(shutdown.child_token()));
        tasks.spawn(repo_resetter.run(shutdown.child_token()));
        tasks.spawn(user_resetter.run(shutdown.child_token()));

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Permission sync task terminated abnormally");
                shutdown.cancel();
            }
        }

        info!("Permission sync service stopped");
    }
}
