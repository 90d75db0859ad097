//! Repo entity model
//!
//! A repository mirrored from one or more code hosts. Only private
//! repositories carry access restrictions.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repos")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Fully qualified name, e.g. `github.com/acme/widgets`
    pub name: String,

    pub private: bool,

    /// Repository ID as known by the code host
    pub external_id: String,

    pub external_service_type: String,

    /// Canonical URL of the code host, e.g. `https://github.com/`
    pub external_service_id: String,

    /// JSON array of source URNs this repository was discovered through
    #[sea_orm(column_type = "JsonBinary")]
    pub sources: JsonValue,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    /// Returns the source URNs recorded for this repository.
    pub fn source_urns(&self) -> Vec<String> {
        match &self.sources {
            JsonValue::Array(values) => values
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect(),
            JsonValue::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user_repo_permission::Entity")]
    UserRepoPermission,
    #[sea_orm(has_many = "super::repo_pending_permission::Entity")]
    RepoPendingPermission,
}

impl Related<super::user_repo_permission::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserRepoPermission.def()
    }
}

impl Related<super::repo_pending_permission::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RepoPendingPermission.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
