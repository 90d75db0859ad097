//! # Data Models
//!
//! SeaORM entities for the permission store and the sync job queue.

pub mod permission_sync_job;
pub mod repo;
pub mod repo_pending_permission;
pub mod sub_repo_permission;
pub mod user;
pub mod user_email;
pub mod user_external_account;
pub mod user_repo_permission;

pub use permission_sync_job::Entity as PermissionSyncJob;
pub use repo::Entity as Repo;
pub use repo_pending_permission::Entity as RepoPendingPermission;
pub use sub_repo_permission::Entity as SubRepoPermission;
pub use user::Entity as User;
pub use user_email::Entity as UserEmail;
pub use user_external_account::Entity as UserExternalAccount;
pub use user_repo_permission::Entity as UserRepoPermission;
