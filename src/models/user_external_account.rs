//! UserExternalAccount entity model
//!
//! A user's identity on one code host. Accounts are expired rather than
//! deleted when the code host rejects their credentials.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "user_external_accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub user_id: i32,

    /// Code host kind, e.g. `github`, `gitlab`, `perforce`
    pub service_type: String,

    /// Canonical URL of the code host
    pub service_id: String,

    /// Account identifier on the code host
    pub account_id: String,

    /// Opaque credential payload owned by the provider
    #[sea_orm(column_type = "JsonBinary")]
    pub auth_data: Option<JsonValue>,

    /// Opaque account metadata owned by the provider
    #[sea_orm(column_type = "JsonBinary")]
    pub account_data: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub expired_at: Option<DateTimeWithTimeZone>,

    pub last_valid_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    /// Key used to match an account against a provider: `service_type:service_id`.
    pub fn service_key(&self) -> String {
        format!("{}:{}", self.service_type, self.service_id)
    }

    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
