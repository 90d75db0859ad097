//! Provider registry
//!
//! Holds the configured providers as an immutable [`ProviderSet`]. A reload
//! builds a new set and swaps it in whole, so a sync pass holding a snapshot
//! never observes a partially updated configuration.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use url::Url;

use super::AuthzProvider;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderRegistryError {
    #[error("duplicate provider URN '{urn}'")]
    DuplicateUrn { urn: String },
    #[error("provider '{urn}' has invalid service ID '{service_id}': {reason}")]
    InvalidServiceId {
        urn: String,
        service_id: String,
        reason: String,
    },
}

/// Validated, read-only collection of providers.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: Vec<Arc<dyn AuthzProvider>>,
    by_urn: HashMap<String, Arc<dyn AuthzProvider>>,
}

impl ProviderSet {
    pub fn new(providers: Vec<Arc<dyn AuthzProvider>>) -> Result<Self, ProviderRegistryError> {
        let mut by_urn = HashMap::with_capacity(providers.len());
        for provider in &providers {
            if let Err(err) = Url::parse(provider.service_id()) {
                return Err(ProviderRegistryError::InvalidServiceId {
                    urn: provider.urn().to_string(),
                    service_id: provider.service_id().to_string(),
                    reason: err.to_string(),
                });
            }
            if by_urn
                .insert(provider.urn().to_string(), provider.clone())
                .is_some()
            {
                return Err(ProviderRegistryError::DuplicateUrn {
                    urn: provider.urn().to_string(),
                });
            }
        }
        Ok(Self { providers, by_urn })
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn AuthzProvider>> {
        self.providers.iter()
    }

    pub fn by_urn(&self, urn: &str) -> Option<&Arc<dyn AuthzProvider>> {
        self.by_urn.get(urn)
    }

    /// First provider, in configuration order, whose URN is in `urns`.
    pub fn first_matching_urn<'a, I>(&self, urns: I) -> Option<&Arc<dyn AuthzProvider>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted: HashSet<&str> = urns.into_iter().collect();
        self.providers.iter().find(|p| wanted.contains(p.urn()))
    }

    /// Last configured provider for the given code host URL.
    pub fn by_service_id(&self, service_id: &str) -> Option<&Arc<dyn AuthzProvider>> {
        self.providers.iter().rev().find(|p| p.service_id() == service_id)
    }

    /// One provider per distinct ServiceID. Later providers shadow earlier
    /// ones sharing a ServiceID, matching [`ProviderSet::by_service_id`].
    pub fn distinct_by_service_id(&self) -> Vec<&Arc<dyn AuthzProvider>> {
        self.providers
            .iter()
            .enumerate()
            .filter(|(idx, p)| {
                !self.providers[idx + 1..]
                    .iter()
                    .any(|later| later.service_id() == p.service_id())
            })
            .map(|(_, p)| p)
            .collect()
    }
}

/// Copy-on-write holder for the active [`ProviderSet`].
#[derive(Default)]
pub struct ProviderRegistry {
    current: RwLock<Arc<ProviderSet>>,
}

impl ProviderRegistry {
    /// Create a registry with no providers
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_providers(
        providers: Vec<Arc<dyn AuthzProvider>>,
    ) -> Result<Self, ProviderRegistryError> {
        Ok(Self {
            current: RwLock::new(Arc::new(ProviderSet::new(providers)?)),
        })
    }

    /// Validate and install a new provider set. On error the current set is
    /// left untouched.
    pub fn set_providers(
        &self,
        providers: Vec<Arc<dyn AuthzProvider>>,
    ) -> Result<(), ProviderRegistryError> {
        let next = match ProviderSet::new(providers) {
            Ok(set) => Arc::new(set),
            Err(err) => {
                warn!(error = %err, "Rejected authorization provider configuration");
                return Err(err);
            }
        };
        let count = next.len();
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        *guard = next;
        info!(providers = count, "Authorization providers updated");
        Ok(())
    }

    /// Current provider set. The snapshot stays valid across later reloads.
    pub fn snapshot(&self) -> Arc<ProviderSet> {
        self.current
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}
