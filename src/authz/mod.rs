//! Authorization provider seam
//!
//! This module provides:
//! - The `AuthzProvider` trait every code host integration implements
//! - The provider error taxonomy the sync engine branches on
//! - Per-provider status reporting for sync passes
//! - The copy-on-write provider registry

pub mod error;
pub mod provider;
pub mod registry;
pub mod status;

pub use error::{FetchError, ProviderError, ProviderErrorKind};
pub use provider::{
    AccountSpec, AuthzProvider, ExternalRepoSpec, ExternalUserPermissions, FetchPermsOptions,
    SubRepoPermissions,
};
pub use registry::{ProviderRegistry, ProviderRegistryError, ProviderSet};
pub use status::{CodeHostStatus, CodeHostStatusKind, CodeHostStatusesSet, SetPermissionsResult};
