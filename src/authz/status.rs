//! Per-provider sync outcomes and write statistics.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::AuthzProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CodeHostStatusKind {
    Success,
    Error,
}

/// Outcome of one provider call during a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeHostStatus {
    /// Provider ServiceID, e.g. `https://github.com/`
    pub provider_id: String,
    /// Provider ServiceType, e.g. `github`
    pub provider_type: String,
    pub status: CodeHostStatusKind,
    pub message: String,
}

/// Statuses for every provider consulted during one pass, in call order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeHostStatusesSet(Vec<CodeHostStatus>);

impl CodeHostStatusesSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful call labelled with the provider operation name.
    pub fn push_success(&mut self, provider: &dyn AuthzProvider, label: &str) {
        self.0.push(CodeHostStatus {
            provider_id: provider.service_id().to_string(),
            provider_type: provider.service_type().to_string(),
            status: CodeHostStatusKind::Success,
            message: label.to_string(),
        });
    }

    /// Records a failed call; the message reads `"<label>: <error>"`.
    pub fn push_error(&mut self, provider: &dyn AuthzProvider, label: &str, err: &dyn fmt::Display) {
        self.0.push(CodeHostStatus {
            provider_id: provider.service_id().to_string(),
            provider_type: provider.service_type().to_string(),
            status: CodeHostStatusKind::Error,
            message: format!("{}: {}", label, err),
        });
    }

    pub fn push(&mut self, status: CodeHostStatus) {
        self.0.push(status);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeHostStatus> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[CodeHostStatus] {
        &self.0
    }

    /// Returns `(total, succeeded, failed)`.
    pub fn count_statuses(&self) -> (usize, usize, usize) {
        let succeeded = self
            .0
            .iter()
            .filter(|s| s.status == CodeHostStatusKind::Success)
            .count();
        (self.0.len(), succeeded, self.0.len() - succeeded)
    }

    /// True when at least one status exists and none succeeded.
    pub fn all_failed(&self) -> bool {
        let (total, succeeded, _) = self.count_statuses();
        total > 0 && succeeded == 0
    }

    /// True when the set mixes successes and failures.
    pub fn is_partial(&self) -> bool {
        let (_, succeeded, failed) = self.count_statuses();
        succeeded > 0 && failed > 0
    }

    /// One-line digest for logs, e.g. `3 providers: 2 succeeded, 1 failed`.
    pub fn summary(&self) -> String {
        let (total, succeeded, failed) = self.count_statuses();
        format!(
            "{} providers: {} succeeded, {} failed",
            total, succeeded, failed
        )
    }
}

impl From<Vec<CodeHostStatus>> for CodeHostStatusesSet {
    fn from(statuses: Vec<CodeHostStatus>) -> Self {
        Self(statuses)
    }
}

impl IntoIterator for CodeHostStatusesSet {
    type Item = CodeHostStatus;
    type IntoIter = std::vec::IntoIter<CodeHostStatus>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Row-level effect of replacing a permission set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPermissionsResult {
    pub added: i32,
    pub removed: i32,
    pub found: i32,
}

impl SetPermissionsResult {
    pub fn merge(&mut self, other: SetPermissionsResult) {
        self.added += other.added;
        self.removed += other.removed;
        self.found += other.found;
    }
}
