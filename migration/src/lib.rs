//! Database migrations for the permission sync engine.
//!
//! Schema for users, repositories, external accounts, resolved and pending
//! permissions, sub-repository permissions and the permission sync job queue.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_000100_create_users;
mod m2025_11_10_000200_create_repos;
mod m2025_11_10_000300_create_user_external_accounts;
mod m2025_11_10_000400_create_permissions;
mod m2025_11_10_000500_create_sub_repo_permissions;
mod m2025_11_10_000600_create_permission_sync_jobs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_000100_create_users::Migration),
            Box::new(m2025_11_10_000200_create_repos::Migration),
            Box::new(m2025_11_10_000300_create_user_external_accounts::Migration),
            Box::new(m2025_11_10_000400_create_permissions::Migration),
            Box::new(m2025_11_10_000500_create_sub_repo_permissions::Migration),
            Box::new(m2025_11_10_000600_create_permission_sync_jobs::Migration),
        ]
    }
}
