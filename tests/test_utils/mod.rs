//! Test utilities for database testing.
//!
//! This module provides utilities for setting up in-memory SQLite databases
//! with migrations applied, fixture inserters, and a scriptable
//! authorization provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use permsync::authz::{
    AccountSpec, AuthzProvider, ExternalUserPermissions, FetchError, FetchPermsOptions,
    ProviderError, ProviderRegistry,
};
use permsync::models::{
    repo, repo_pending_permission, user, user_email, user_external_account, user_repo_permission,
};
use permsync::perms_syncer::{PermsSyncer, SyncerConfig};
use permsync::repositories::{PermissionSource, PermissionSyncJobRepository, PermsRepository};
use sea_orm::{ActiveModelTrait, ConnectionTrait, Database, DatabaseConnection, Set, Statement};
use serde_json::json;

pub const GITHUB_TYPE: &str = "github";
pub const GITHUB_ID: &str = "https://github.com/";
pub const GITHUB_URN: &str = "extsvc:github:1";
pub const GITLAB_TYPE: &str = "gitlab";
pub const GITLAB_ID: &str = "https://gitlab.com/";
pub const GITLAB_URN: &str = "extsvc:gitlab:1";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;

    Migrator::up(&db, None).await?;

    // Fixtures insert rows in whatever order a test needs.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Sets up an in-memory SQLite database with all migrations applied and returns an Arc.
#[allow(dead_code)]
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(db))
}

/// Everything a sync engine test needs, sharing one database.
#[allow(dead_code)]
pub struct TestHarness {
    pub db: Arc<DatabaseConnection>,
    pub perms: PermsRepository,
    pub jobs: PermissionSyncJobRepository,
    pub registry: Arc<ProviderRegistry>,
    pub syncer: Arc<PermsSyncer>,
}

#[allow(dead_code)]
impl TestHarness {
    pub async fn new(providers: Vec<Arc<dyn AuthzProvider>>) -> Result<Self> {
        Self::with_config(providers, SyncerConfig::default()).await
    }

    pub async fn with_config(
        providers: Vec<Arc<dyn AuthzProvider>>,
        config: SyncerConfig,
    ) -> Result<Self> {
        let db = setup_test_db_arc().await?;
        let perms = PermsRepository::new(Arc::clone(&db));
        let jobs = PermissionSyncJobRepository::new(Arc::clone(&db));
        let registry = Arc::new(ProviderRegistry::with_providers(providers)?);
        let syncer = Arc::new(PermsSyncer::new(
            perms.clone(),
            jobs.clone(),
            Arc::clone(&registry),
            config,
        ));
        Ok(Self {
            db,
            perms,
            jobs,
            registry,
            syncer,
        })
    }
}

/// Inserts a user.
#[allow(dead_code)]
pub async fn insert_user(db: &DatabaseConnection, username: &str) -> Result<user::Model> {
    let model = user::ActiveModel {
        username: Set(username.to_string()),
        display_name: Set(None),
        created_at: Set(Utc::now().fixed_offset()),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// Inserts a verified email address for the user.
#[allow(dead_code)]
pub async fn insert_verified_email(
    db: &DatabaseConnection,
    user_id: i32,
    email: &str,
) -> Result<user_email::Model> {
    let model = user_email::ActiveModel {
        user_id: Set(user_id),
        email: Set(email.to_string()),
        verified_at: Set(Some(Utc::now().fixed_offset())),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// Inserts a repository mirrored from the given code host.
#[allow(dead_code)]
pub async fn insert_repo(
    db: &DatabaseConnection,
    name: &str,
    private: bool,
    service_type: &str,
    service_id: &str,
    external_id: &str,
    sources: &[&str],
) -> Result<repo::Model> {
    let model = repo::ActiveModel {
        name: Set(name.to_string()),
        private: Set(private),
        external_id: Set(external_id.to_string()),
        external_service_type: Set(service_type.to_string()),
        external_service_id: Set(service_id.to_string()),
        sources: Set(json!(sources)),
        created_at: Set(Utc::now().fixed_offset()),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// Inserts a private GitHub repository discovered through [`GITHUB_URN`].
#[allow(dead_code)]
pub async fn insert_github_repo(
    db: &DatabaseConnection,
    name: &str,
    external_id: &str,
) -> Result<repo::Model> {
    insert_repo(
        db,
        name,
        true,
        GITHUB_TYPE,
        GITHUB_ID,
        external_id,
        &[GITHUB_URN],
    )
    .await
}

/// Inserts an external account linking the user to a code host identity.
#[allow(dead_code)]
pub async fn insert_external_account(
    db: &DatabaseConnection,
    user_id: i32,
    service_type: &str,
    service_id: &str,
    account_id: &str,
) -> Result<user_external_account::Model> {
    let now = Utc::now().fixed_offset();
    let model = user_external_account::ActiveModel {
        user_id: Set(user_id),
        service_type: Set(service_type.to_string()),
        service_id: Set(service_id.to_string()),
        account_id: Set(account_id.to_string()),
        auth_data: Set(None),
        account_data: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        expired_at: Set(None),
        last_valid_at: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// Inserts a grant row directly, bypassing the sync engine.
#[allow(dead_code)]
pub async fn insert_grant(
    db: &DatabaseConnection,
    user_id: i32,
    repo_id: i32,
    external_account_id: Option<i32>,
    source: PermissionSource,
) -> Result<user_repo_permission::Model> {
    let now = Utc::now().fixed_offset();
    let model = user_repo_permission::ActiveModel {
        user_id: Set(user_id),
        repo_id: Set(repo_id),
        user_external_account_id: Set(external_account_id),
        source: Set(source.as_str().to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// Inserts a pending grant for a code host account not yet linked to a user.
#[allow(dead_code)]
pub async fn insert_pending_grant(
    db: &DatabaseConnection,
    repo_id: i32,
    service_type: &str,
    service_id: &str,
    bind_id: &str,
) -> Result<repo_pending_permission::Model> {
    let model = repo_pending_permission::ActiveModel {
        repo_id: Set(repo_id),
        service_type: Set(service_type.to_string()),
        service_id: Set(service_id.to_string()),
        bind_id: Set(bind_id.to_string()),
        permission: Set("read".to_string()),
        updated_at: Set(Utc::now().fixed_offset()),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(model)
}

type UserPermsResponse = Result<ExternalUserPermissions, FetchError<ExternalUserPermissions>>;
type RepoPermsResponse = Result<Vec<String>, FetchError<Vec<String>>>;
type AccountResponse = Result<Option<AccountSpec>, ProviderError>;

/// Scriptable [`AuthzProvider`]. Unscripted calls succeed with empty
/// results.
#[allow(dead_code)]
pub struct MockProvider {
    service_type: String,
    service_id: String,
    urn: String,
    user_perms: Mutex<HashMap<String, UserPermsResponse>>,
    repo_perms: Mutex<HashMap<String, RepoPermsResponse>>,
    account: Mutex<Option<AccountResponse>>,
    delay: Mutex<Option<Duration>>,
    panic_for_account: Mutex<Option<String>>,
    pub fetch_account_calls: AtomicUsize,
    pub fetch_user_perms_calls: AtomicUsize,
    pub fetch_repo_perms_calls: AtomicUsize,
}

#[allow(dead_code)]
impl MockProvider {
    pub fn new(service_type: &str, service_id: &str, urn: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            service_id: service_id.to_string(),
            urn: urn.to_string(),
            user_perms: Mutex::new(HashMap::new()),
            repo_perms: Mutex::new(HashMap::new()),
            account: Mutex::new(None),
            delay: Mutex::new(None),
            panic_for_account: Mutex::new(None),
            fetch_account_calls: AtomicUsize::new(0),
            fetch_user_perms_calls: AtomicUsize::new(0),
            fetch_repo_perms_calls: AtomicUsize::new(0),
        }
    }

    pub fn github() -> Self {
        Self::new(GITHUB_TYPE, GITHUB_ID, GITHUB_URN)
    }

    pub fn gitlab() -> Self {
        Self::new(GITLAB_TYPE, GITLAB_ID, GITLAB_URN)
    }

    /// Script the response for the external account with this account ID.
    pub fn set_user_perms(&self, account_id: &str, response: UserPermsResponse) {
        self.user_perms
            .lock()
            .unwrap()
            .insert(account_id.to_string(), response);
    }

    /// Script the response for the repository with this external ID.
    pub fn set_repo_perms(&self, external_repo_id: &str, response: RepoPermsResponse) {
        self.repo_perms
            .lock()
            .unwrap()
            .insert(external_repo_id.to_string(), response);
    }

    pub fn set_account(&self, response: AccountResponse) {
        *self.account.lock().unwrap() = Some(response);
    }

    /// Delay every permission fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Make `fetch_user_perms` panic for the given account.
    pub fn set_panic_for_account(&self, account_id: &str) {
        *self.panic_for_account.lock().unwrap() = Some(account_id.to_string());
    }

    pub fn account_spec(&self, account_id: &str) -> AccountSpec {
        AccountSpec {
            service_type: self.service_type.clone(),
            service_id: self.service_id.clone(),
            account_id: account_id.to_string(),
            auth_data: None,
            account_data: None,
        }
    }

    fn current_delay(&self) -> Option<Duration> {
        *self.delay.lock().unwrap()
    }
}

#[async_trait]
impl AuthzProvider for MockProvider {
    fn service_type(&self) -> &str {
        &self.service_type
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    fn urn(&self) -> &str {
        &self.urn
    }

    async fn fetch_account(
        &self,
        _user: &user::Model,
        _current: &[user_external_account::Model],
        _verified_emails: &[String],
    ) -> Result<Option<AccountSpec>, ProviderError> {
        self.fetch_account_calls.fetch_add(1, Ordering::SeqCst);
        self.account.lock().unwrap().clone().unwrap_or(Ok(None))
    }

    async fn fetch_user_perms(
        &self,
        account: &user_external_account::Model,
        _opts: FetchPermsOptions,
    ) -> Result<ExternalUserPermissions, FetchError<ExternalUserPermissions>> {
        self.fetch_user_perms_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.current_delay() {
            tokio::time::sleep(delay).await;
        }
        let should_panic =
            self.panic_for_account.lock().unwrap().as_deref() == Some(account.account_id.as_str());
        if should_panic {
            panic!("provider crashed for account {}", account.account_id);
        }
        self.user_perms
            .lock()
            .unwrap()
            .get(&account.account_id)
            .cloned()
            .unwrap_or_else(|| Ok(ExternalUserPermissions::default()))
    }

    async fn fetch_repo_perms(
        &self,
        repo: &repo::Model,
        _opts: FetchPermsOptions,
    ) -> Result<Vec<String>, FetchError<Vec<String>>> {
        self.fetch_repo_perms_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.current_delay() {
            tokio::time::sleep(delay).await;
        }
        self.repo_perms
            .lock()
            .unwrap()
            .get(&repo.external_id)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Shorthand for an account's exact repository grants.
#[allow(dead_code)]
pub fn exact_perms(external_ids: &[&str]) -> ExternalUserPermissions {
    ExternalUserPermissions {
        exacts: external_ids.iter().map(|id| id.to_string()).collect(),
        ..Default::default()
    }
}

/// Shorthand for a list of code host account IDs.
#[allow(dead_code)]
pub fn account_ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
