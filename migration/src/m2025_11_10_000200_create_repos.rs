//! Creates the repos table.
//!
//! `sources` holds the URNs of every code host connection the repository was
//! discovered through; authorization providers are matched against it.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Repos::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Repos::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Repos::Name).text().not_null().unique_key())
                    .col(
                        ColumnDef::new(Repos::Private)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Repos::ExternalId).text().not_null())
                    .col(ColumnDef::new(Repos::ExternalServiceType).text().not_null())
                    .col(ColumnDef::new(Repos::ExternalServiceId).text().not_null())
                    .col(ColumnDef::new(Repos::Sources).json_binary().not_null())
                    .col(
                        ColumnDef::new(Repos::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repos_external_spec")
                    .table(Repos::Table)
                    .col(Repos::ExternalServiceType)
                    .col(Repos::ExternalServiceId)
                    .col(Repos::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_repos_external_spec").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Repos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
    Name,
    Private,
    ExternalId,
    ExternalServiceType,
    ExternalServiceId,
    Sources,
    CreatedAt,
}
