//! Creates the permission_sync_jobs queue table.
//!
//! One row per requested sync. Exactly one of `repository_id` / `user_id` is
//! set; the repo and user worker pools share the table and split it by that
//! column at dequeue time.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PermissionSyncJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PermissionSyncJobs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::State)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(ColumnDef::new(PermissionSyncJobs::Reason).text().null())
                    .col(
                        ColumnDef::new(PermissionSyncJobs::CancellationReason)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::TriggeredByUserId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::FailureMessage)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::QueuedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::ProcessAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::NumResets)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::NumFailures)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::LastHeartbeatAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::WorkerHostname)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::Cancel)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::RepositoryId)
                            .integer()
                            .null(),
                    )
                    .col(ColumnDef::new(PermissionSyncJobs::UserId).integer().null())
                    .col(
                        ColumnDef::new(PermissionSyncJobs::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::NoPerms)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::InvalidateCaches)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::PermissionsAdded)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::PermissionsRemoved)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::PermissionsFound)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::CodeHostStates)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PermissionSyncJobs::IsPartialSuccess)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .to_owned(),
            )
            .await?;

        // Dequeue order: priority DESC, process_after ASC NULLS FIRST, id ASC.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_permission_sync_jobs_dequeue ON permission_sync_jobs (state, priority DESC, process_after, id)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_permission_sync_jobs_repository_id")
                    .table(PermissionSyncJobs::Table)
                    .col(PermissionSyncJobs::RepositoryId)
                    .col(PermissionSyncJobs::State)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_permission_sync_jobs_user_id")
                    .table(PermissionSyncJobs::Table)
                    .col(PermissionSyncJobs::UserId)
                    .col(PermissionSyncJobs::State)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_permission_sync_jobs_dequeue")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(PermissionSyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PermissionSyncJobs {
    Table,
    Id,
    State,
    Reason,
    CancellationReason,
    TriggeredByUserId,
    FailureMessage,
    QueuedAt,
    StartedAt,
    FinishedAt,
    ProcessAfter,
    NumResets,
    NumFailures,
    LastHeartbeatAt,
    WorkerHostname,
    Cancel,
    RepositoryId,
    UserId,
    Priority,
    NoPerms,
    InvalidateCaches,
    PermissionsAdded,
    PermissionsRemoved,
    PermissionsFound,
    CodeHostStates,
    IsPartialSuccess,
}
