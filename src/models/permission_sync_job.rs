//! PermissionSyncJob entity model
//!
//! This module contains the SeaORM entity model for the permission_sync_jobs
//! table together with the typed vocabularies stored in its text columns:
//! job state, priority and trigger reason.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A queued, running or finished permission sync request
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "permission_sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// One of [`JobState`]
    pub state: String,

    /// One of [`PermissionSyncJobReason`]
    pub reason: Option<String>,

    pub cancellation_reason: Option<String>,

    pub triggered_by_user_id: Option<i32>,

    pub failure_message: Option<String>,

    pub queued_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    /// The job is not eligible for dequeue before this instant
    pub process_after: Option<DateTimeWithTimeZone>,

    pub num_resets: i32,

    pub num_failures: i32,

    pub last_heartbeat_at: Option<DateTimeWithTimeZone>,

    pub worker_hostname: String,

    pub cancel: bool,

    pub repository_id: Option<i32>,

    pub user_id: Option<i32>,

    /// Higher values are dequeued first
    pub priority: i32,

    /// Apply partial provider results even when a provider call fails
    pub no_perms: bool,

    pub invalidate_caches: bool,

    pub permissions_added: i32,

    pub permissions_removed: i32,

    pub permissions_found: i32,

    /// Per-provider status summary of the last run
    #[sea_orm(column_type = "JsonBinary")]
    pub code_host_states: Option<JsonValue>,

    pub is_partial_success: bool,
}

impl Model {
    /// Which worker pool owns this row.
    pub fn kind(&self) -> Option<SyncJobKind> {
        match (self.repository_id, self.user_id) {
            (Some(_), None) => Some(SyncJobKind::Repo),
            (None, Some(_)) => Some(SyncJobKind::User),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobState::Queued),
            "processing" => Some(JobState::Processing),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the queue a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncJobKind {
    Repo,
    User,
}

impl SyncJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobKind::Repo => "repo",
            SyncJobKind::User => "user",
        }
    }

    /// Column that must be non-null for rows of this kind.
    pub fn id_column(&self) -> Column {
        match self {
            SyncJobKind::Repo => Column::RepositoryId,
            SyncJobKind::User => Column::UserId,
        }
    }
}

impl fmt::Display for SyncJobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dequeue priority. Stored as the integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PermissionSyncJobPriority {
    #[default]
    Low,
    Medium,
    High,
}

impl PermissionSyncJobPriority {
    pub fn value(&self) -> i32 {
        match self {
            PermissionSyncJobPriority::Low => 0,
            PermissionSyncJobPriority::Medium => 5,
            PermissionSyncJobPriority::High => 10,
        }
    }
}

/// Reason group used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonGroup {
    Manual,
    Webhook,
    Schedule,
    Sourcegraph,
    Unknown,
}

/// Why a sync job was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionSyncJobReason {
    #[serde(rename = "REASON_USER_OUTDATED_PERMS")]
    UserOutdatedPerms,
    #[serde(rename = "REASON_USER_NO_PERMS")]
    UserNoPerms,
    #[serde(rename = "REASON_USER_EMAIL_REMOVED")]
    UserEmailRemoved,
    #[serde(rename = "REASON_USER_EMAIL_VERIFIED")]
    UserEmailVerified,
    #[serde(rename = "REASON_USER_ADDED")]
    UserAdded,
    #[serde(rename = "REASON_USER_ACCEPTED_ORG_INVITE")]
    UserAcceptedOrgInvite,
    #[serde(rename = "REASON_EXTERNAL_ACCOUNT_ADDED")]
    ExternalAccountAdded,
    #[serde(rename = "REASON_EXTERNAL_ACCOUNT_DELETED")]
    ExternalAccountDeleted,
    #[serde(rename = "REASON_REPO_OUTDATED_PERMS")]
    RepoOutdatedPerms,
    #[serde(rename = "REASON_REPO_NO_PERMS")]
    RepoNoPerms,
    #[serde(rename = "REASON_REPO_UPDATED_FROM_CODE_HOST")]
    RepoUpdatedFromCodeHost,
    #[serde(rename = "REASON_GITHUB_USER_EVENT")]
    GitHubUserEvent,
    #[serde(rename = "REASON_GITHUB_REPO_EVENT")]
    GitHubRepoEvent,
    #[serde(rename = "REASON_MANUAL_REPO_SYNC")]
    ManualRepoSync,
    #[serde(rename = "REASON_MANUAL_USER_SYNC")]
    ManualUserSync,
}

impl PermissionSyncJobReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserOutdatedPerms => "REASON_USER_OUTDATED_PERMS",
            Self::UserNoPerms => "REASON_USER_NO_PERMS",
            Self::UserEmailRemoved => "REASON_USER_EMAIL_REMOVED",
            Self::UserEmailVerified => "REASON_USER_EMAIL_VERIFIED",
            Self::UserAdded => "REASON_USER_ADDED",
            Self::UserAcceptedOrgInvite => "REASON_USER_ACCEPTED_ORG_INVITE",
            Self::ExternalAccountAdded => "REASON_EXTERNAL_ACCOUNT_ADDED",
            Self::ExternalAccountDeleted => "REASON_EXTERNAL_ACCOUNT_DELETED",
            Self::RepoOutdatedPerms => "REASON_REPO_OUTDATED_PERMS",
            Self::RepoNoPerms => "REASON_REPO_NO_PERMS",
            Self::RepoUpdatedFromCodeHost => "REASON_REPO_UPDATED_FROM_CODE_HOST",
            Self::GitHubUserEvent => "REASON_GITHUB_USER_EVENT",
            Self::GitHubRepoEvent => "REASON_GITHUB_REPO_EVENT",
            Self::ManualRepoSync => "REASON_MANUAL_REPO_SYNC",
            Self::ManualUserSync => "REASON_MANUAL_USER_SYNC",
        }
    }

    pub fn group(&self) -> ReasonGroup {
        match self {
            Self::ManualRepoSync | Self::ManualUserSync => ReasonGroup::Manual,
            Self::GitHubUserEvent | Self::GitHubRepoEvent => ReasonGroup::Webhook,
            Self::UserOutdatedPerms
            | Self::UserNoPerms
            | Self::RepoOutdatedPerms
            | Self::RepoNoPerms => ReasonGroup::Schedule,
            Self::UserEmailRemoved
            | Self::UserEmailVerified
            | Self::UserAdded
            | Self::UserAcceptedOrgInvite
            | Self::ExternalAccountAdded
            | Self::ExternalAccountDeleted
            | Self::RepoUpdatedFromCodeHost => ReasonGroup::Sourcegraph,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(JsonValue::String(value.to_string())).ok()
    }
}

/// Reason group for a stored reason column value.
pub fn reason_group(reason: Option<&str>) -> ReasonGroup {
    reason
        .and_then(PermissionSyncJobReason::parse)
        .map(|reason| reason.group())
        .unwrap_or(ReasonGroup::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_round_trip_through_parse() {
        let reason = PermissionSyncJobReason::ManualRepoSync;
        assert_eq!(
            PermissionSyncJobReason::parse(reason.as_str()),
            Some(PermissionSyncJobReason::ManualRepoSync)
        );
        assert_eq!(PermissionSyncJobReason::parse("REASON_NOPE"), None);
    }

    #[test]
    fn reasons_map_to_groups() {
        assert_eq!(
            reason_group(Some("REASON_GITHUB_REPO_EVENT")),
            ReasonGroup::Webhook
        );
        assert_eq!(
            reason_group(Some("REASON_USER_OUTDATED_PERMS")),
            ReasonGroup::Schedule
        );
        assert_eq!(
            reason_group(Some("REASON_EXTERNAL_ACCOUNT_ADDED")),
            ReasonGroup::Sourcegraph
        );
        assert_eq!(reason_group(None), ReasonGroup::Unknown);
    }

    #[test]
    fn priority_values_are_spaced() {
        assert_eq!(PermissionSyncJobPriority::Low.value(), 0);
        assert_eq!(PermissionSyncJobPriority::Medium.value(), 5);
        assert_eq!(PermissionSyncJobPriority::High.value(), 10);
        assert!(PermissionSyncJobPriority::High > PermissionSyncJobPriority::Medium);
    }

    #[test]
    fn job_state_parse_matches_as_str() {
        for state in [
            JobState::Queued,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Processing.is_terminal());
    }
}
