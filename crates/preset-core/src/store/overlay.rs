//! Layered store: read-only registry sources over an optional writer.
//!
//! Reads consult the writer first and then each read-only source in order;
//! the first source holding a registry owns it. Writes go to the writer. With
//! no writer every write fails with [`ProfileError::ReadOnlyStore`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ProfileStore, ProfileStoreReader, ProfileStoreWriter, SaveOptions};
use crate::error::{ProfileError, Result};
use crate::profile::{Profile, ProfileRegistry};
use crate::slug::{ProfileSlug, RegistrySlug};

pub struct OverlayStore {
    writer: Option<Arc<dyn ProfileStore>>,
    /// Every read source, the writer first when present
    sources: Vec<Arc<dyn ProfileStoreReader>>,
    readers: usize,
}

impl OverlayStore {
    /// Store over read-only sources only.
    pub fn read_only(readers: Vec<Arc<dyn ProfileStoreReader>>) -> Self {
        let count = readers.len();
        Self {
            writer: None,
            sources: readers,
            readers: count,
        }
    }

    /// Route writes to `writer`, which also shadows every read-only source.
    pub fn with_writer<W: ProfileStore + 'static>(mut self, writer: Arc<W>) -> Self {
        if self.writer.is_some() {
            self.sources.remove(0);
        }
        self.sources.insert(0, writer.clone());
        self.writer = Some(writer);
        self
    }

    fn sources(&self) -> impl Iterator<Item = &dyn ProfileStoreReader> {
        self.sources.iter().map(|s| s.as_ref())
    }

    fn writer(&self) -> Result<&dyn ProfileStore> {
        self.writer.as_deref().ok_or(ProfileError::ReadOnlyStore)
    }

    async fn owner(&self, registry: &RegistrySlug) -> Result<Option<&dyn ProfileStoreReader>> {
        for source in self.sources() {
            if source.get_registry(registry).await?.is_some() {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for OverlayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayStore")
            .field("has_writer", &self.writer.is_some())
            .field("readers", &self.readers)
            .finish()
    }
}

#[async_trait]
impl ProfileStoreReader for OverlayStore {
    async fn list_registries(&self) -> Result<Vec<ProfileRegistry>> {
        let mut merged: BTreeMap<RegistrySlug, ProfileRegistry> = BTreeMap::new();
        for source in self.sources() {
            for registry in source.list_registries().await? {
                merged.entry(registry.slug.clone()).or_insert(registry);
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn get_registry(&self, registry: &RegistrySlug) -> Result<Option<ProfileRegistry>> {
        for source in self.sources() {
            if let Some(found) = source.get_registry(registry).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    async fn list_profiles(&self, registry: &RegistrySlug) -> Result<Vec<Profile>> {
        match self.owner(registry).await? {
            Some(source) => source.list_profiles(registry).await,
            None => Err(ProfileError::RegistryNotFound(registry.to_string())),
        }
    }

    async fn get_profile(
        &self,
        registry: &RegistrySlug,
        profile: &ProfileSlug,
    ) -> Result<Option<Profile>> {
        match self.owner(registry).await? {
            Some(source) => source.get_profile(registry, profile).await,
            None => Err(ProfileError::RegistryNotFound(registry.to_string())),
        }
    }
}

#[async_trait]
impl ProfileStoreWriter for OverlayStore {
    async fn upsert_registry(&self, registry: &ProfileRegistry, opts: &SaveOptions) -> Result<()> {
        self.writer()?.upsert_registry(registry, opts).await
    }

    async fn delete_registry(&self, registry: &RegistrySlug, opts: &SaveOptions) -> Result<()> {
        self.writer()?.delete_registry(registry, opts).await
    }

    async fn upsert_profile(
        &self,
        registry: &RegistrySlug,
        profile: &Profile,
        opts: &SaveOptions,
    ) -> Result<()> {
        self.writer()?.upsert_profile(registry, profile, opts).await
    }

    async fn delete_profile(
        &self,
        registry: &RegistrySlug,
        profile: &ProfileSlug,
        opts: &SaveOptions,
    ) -> Result<()> {
        self.writer()?.delete_profile(registry, profile, opts).await
    }

    async fn set_default_profile(
        &self,
        registry: &RegistrySlug,
        profile: &ProfileSlug,
        opts: &SaveOptions,
    ) -> Result<()> {
        self.writer()?.set_default_profile(registry, profile, opts).await
    }

    async fn close(&self) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.close().await,
            None => Ok(()),
        }
    }
}
