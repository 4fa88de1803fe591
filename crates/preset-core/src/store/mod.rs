//! Profile store contract.
//!
//! Readers always hand out owned clones, so callers may mutate what they get
//! back. Writers take [`SaveOptions`] carrying an optimistic-lock expectation:
//!
//! - `expected_version: None` writes unconditionally
//! - `Some(0)` requires that the entity does not exist yet
//! - `Some(n)` requires the stored version to equal `n`
//!
//! Every successful mutation bumps `metadata.version`, stamps
//! `updated_at_ms` and keeps `created_at_ms`.

pub mod memory;
pub mod overlay;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ProfileError, Result};
use crate::profile::{Profile, ProfileMetadata, ProfileRegistry};
use crate::slug::{ProfileSlug, RegistrySlug};

pub use memory::InMemoryProfileStore;
pub use overlay::OverlayStore;

/// Write context for store mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOptions {
    pub expected_version: Option<u64>,
    pub actor: String,
    pub source: String,
}

impl SaveOptions {
    pub fn expecting(version: u64) -> Self {
        Self {
            expected_version: Some(version),
            ..Default::default()
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Read side of a profile store.
#[async_trait]
pub trait ProfileStoreReader: Send + Sync {
    /// All registries, sorted by slug.
    async fn list_registries(&self) -> Result<Vec<ProfileRegistry>>;

    async fn get_registry(&self, registry: &RegistrySlug) -> Result<Option<ProfileRegistry>>;

    /// Profiles of one registry, sorted by slug. Fails if the registry is unknown.
    async fn list_profiles(&self, registry: &RegistrySlug) -> Result<Vec<Profile>>;

    async fn get_profile(
        &self,
        registry: &RegistrySlug,
        profile: &ProfileSlug,
    ) -> Result<Option<Profile>>;
}

/// Write side of a profile store.
#[async_trait]
pub trait ProfileStoreWriter: Send + Sync {
    async fn upsert_registry(&self, registry: &ProfileRegistry, opts: &SaveOptions) -> Result<()>;

    async fn delete_registry(&self, registry: &RegistrySlug, opts: &SaveOptions) -> Result<()>;

    async fn upsert_profile(
        &self,
        registry: &RegistrySlug,
        profile: &Profile,
        opts: &SaveOptions,
    ) -> Result<()>;

    async fn delete_profile(
        &self,
        registry: &RegistrySlug,
        profile: &ProfileSlug,
        opts: &SaveOptions,
    ) -> Result<()>;

    async fn set_default_profile(
        &self,
        registry: &RegistrySlug,
        profile: &ProfileSlug,
        opts: &SaveOptions,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A store that can both read and write.
pub trait ProfileStore: ProfileStoreReader + ProfileStoreWriter {}

impl<T: ProfileStoreReader + ProfileStoreWriter> ProfileStore for T {}

/// Check an optimistic-lock expectation. `actual` is `None` when the entity
/// does not exist.
pub fn assert_expected_version(
    resource: &str,
    slug: &str,
    expected: Option<u64>,
    actual: Option<u64>,
) -> Result<()> {
    let conflict = |expected: u64, actual: u64| ProfileError::VersionConflict {
        resource: resource.to_string(),
        slug: slug.to_string(),
        expected,
        actual,
    };
    match (expected, actual) {
        (None, _) => Ok(()),
        (Some(0), None) => Ok(()),
        (Some(0), Some(actual)) => Err(conflict(0, actual)),
        (Some(expected), None) => Err(conflict(expected, 0)),
        (Some(expected), Some(actual)) if expected == actual => Ok(()),
        (Some(expected), Some(actual)) => Err(conflict(expected, actual)),
    }
}

/// Record a mutation on `metadata`.
pub fn touch_metadata(metadata: &mut ProfileMetadata, opts: &SaveOptions) {
    let now = Utc::now().timestamp_millis();
    metadata.version += 1;
    if metadata.created_at_ms == 0 {
        metadata.created_at_ms = now;
    }
    metadata.updated_at_ms = now;
    let actor = opts.actor.trim();
    if !actor.is_empty() {
        if metadata.created_by.is_empty() {
            metadata.created_by = actor.to_string();
        }
        metadata.updated_by = actor.to_string();
    }
    let source = opts.source.trim();
    if !source.is_empty() {
        metadata.source = source.to_string();
    }
}
