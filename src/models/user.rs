//! User entity model

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub username: String,
    pub display_name: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user_external_account::Entity")]
    UserExternalAccount,
    #[sea_orm(has_many = "super::user_email::Entity")]
    UserEmail,
}

impl Related<super::user_external_account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserExternalAccount.def()
    }
}

impl Related<super::user_email::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserEmail.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
