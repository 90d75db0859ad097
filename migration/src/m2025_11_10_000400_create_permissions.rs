//! Creates the resolved and pending permission tables.
//!
//! `user_repo_permissions` stores one row per (user, repo, external account,
//! source) grant. `repo_pending_permissions` stores grants keyed by an external
//! account ID that has not been linked to a user yet.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserRepoPermissions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserRepoPermissions::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::UserId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::RepoId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::UserExternalAccountId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::Source)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(UserRepoPermissions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_repo_permissions_user_id")
                            .from(UserRepoPermissions::Table, UserRepoPermissions::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_repo_permissions_repo_id")
                            .from(UserRepoPermissions::Table, UserRepoPermissions::RepoId)
                            .to(Repos::Table, Repos::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_repo_permissions_repo_source")
                    .table(UserRepoPermissions::Table)
                    .col(UserRepoPermissions::RepoId)
                    .col(UserRepoPermissions::Source)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_repo_permissions_account_source")
                    .table(UserRepoPermissions::Table)
                    .col(UserRepoPermissions::UserExternalAccountId)
                    .col(UserRepoPermissions::Source)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RepoPendingPermissions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepoPendingPermissions::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RepoPendingPermissions::RepoId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepoPendingPermissions::ServiceType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepoPendingPermissions::ServiceId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepoPendingPermissions::BindId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepoPendingPermissions::Permission)
                            .text()
                            .not_null()
                            .default("read"),
                    )
                    .col(
                        ColumnDef::new(RepoPendingPermissions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repo_pending_permissions_repo_id")
                            .from(RepoPendingPermissions::Table, RepoPendingPermissions::RepoId)
                            .to(Repos::Table, Repos::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repo_pending_permissions_bind")
                    .table(RepoPendingPermissions::Table)
                    .col(RepoPendingPermissions::ServiceType)
                    .col(RepoPendingPermissions::ServiceId)
                    .col(RepoPendingPermissions::BindId)
                    .col(RepoPendingPermissions::RepoId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RepoPendingPermissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserRepoPermissions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum UserRepoPermissions {
    Table,
    Id,
    UserId,
    RepoId,
    UserExternalAccountId,
    Source,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum RepoPendingPermissions {
    Table,
    Id,
    RepoId,
    ServiceType,
    ServiceId,
    BindId,
    Permission,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
}
