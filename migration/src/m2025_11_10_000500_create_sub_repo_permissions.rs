//! Creates the sub_repo_permissions table holding path-level rules per
//! (user, repo).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SubRepoPermissions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SubRepoPermissions::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SubRepoPermissions::UserId).integer().not_null())
                    .col(ColumnDef::new(SubRepoPermissions::RepoId).integer().not_null())
                    .col(
                        ColumnDef::new(SubRepoPermissions::PathIncludes)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SubRepoPermissions::PathExcludes)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SubRepoPermissions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sub_repo_permissions_user_id")
                            .from(SubRepoPermissions::Table, SubRepoPermissions::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sub_repo_permissions_repo_id")
                            .from(SubRepoPermissions::Table, SubRepoPermissions::RepoId)
                            .to(Repos::Table, Repos::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sub_repo_permissions_user_repo")
                    .table(SubRepoPermissions::Table)
                    .col(SubRepoPermissions::UserId)
                    .col(SubRepoPermissions::RepoId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SubRepoPermissions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SubRepoPermissions {
    Table,
    Id,
    UserId,
    RepoId,
    PathIncludes,
    PathExcludes,
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
