//! Creates the user_external_accounts table.
//!
//! Accounts are never deleted when a code host rejects their credentials;
//! `expired_at` is set instead so the account can be revived by a later
//! successful fetch.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserExternalAccounts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserExternalAccounts::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::UserId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::ServiceType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::ServiceId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::AccountId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::AuthData)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::AccountData)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::ExpiredAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserExternalAccounts::LastValidAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_external_accounts_user_id")
                            .from(UserExternalAccounts::Table, UserExternalAccounts::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_external_accounts_account")
                    .table(UserExternalAccounts::Table)
                    .col(UserExternalAccounts::ServiceType)
                    .col(UserExternalAccounts::ServiceId)
                    .col(UserExternalAccounts::AccountId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_external_accounts_user_id")
                    .table(UserExternalAccounts::Table)
                    .col(UserExternalAccounts::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserExternalAccounts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum UserExternalAccounts {
    Table,
    Id,
    UserId,
    ServiceType,
    ServiceId,
    AccountId,
    AuthData,
    AccountData,
    CreatedAt,
    UpdatedAt,
    ExpiredAt,
    LastValidAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}
