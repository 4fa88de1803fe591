//! In-memory profile store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{
    assert_expected_version, touch_metadata, ProfileStoreReader, ProfileStoreWriter, SaveOptions,
};
use crate::error::{ProfileError, Result};
use crate::profile::validation::{validate_profile, validate_registry};
use crate::profile::{Profile, ProfileRegistry};
use crate::slug::{ProfileSlug, RegistrySlug};

#[derive(Debug, Default)]
struct State {
    registries: BTreeMap<RegistrySlug, ProfileRegistry>,
    closed: bool,
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProfileError::validation("store", "store is closed"));
        }
        Ok(())
    }

    fn registry_mut(&mut self, slug: &RegistrySlug) -> Result<&mut ProfileRegistry> {
        self.registries
            .get_mut(slug)
            .ok_or_else(|| ProfileError::RegistryNotFound(slug.to_string()))
    }
}

/// Store keeping every registry in process memory.
///
/// Values are cloned on the way in and on the way out.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    state: RwLock<State>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `registries`, each validated.
    pub fn with_registries(registries: impl IntoIterator<Item = ProfileRegistry>) -> Result<Self> {
        let store = Self::new();
        {
            let mut state = store.state.write();
            for registry in registries {
                validate_registry(&registry)?;
                state.registries.insert(registry.slug.clone(), registry);
            }
        }
        Ok(store)
    }
}

#[async_trait]
impl ProfileStoreReader for InMemoryProfileStore {
    async fn list_registries(&self) -> Result<Vec<ProfileRegistry>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.registries.values().cloned().collect())
    }

    async fn get_registry(&self, registry: &RegistrySlug) -> Result<Option<ProfileRegistry>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.registries.get(registry).cloned())
    }

    async fn list_profiles(&self, registry: &RegistrySlug) -> Result<Vec<Profile>> {
        let state = self.state.read();
        state.ensure_open()?;
        let reg = state
            .registries
            .get(registry)
            .ok_or_else(|| ProfileError::RegistryNotFound(registry.to_string()))?;
        Ok(reg.profiles.values().cloned().collect())
    }

    async fn get_profile(
        &self,
        registry: &RegistrySlug,
        profile: &ProfileSlug,
    ) -> Result<Option<Profile>> {
        let state = self.state.read();
        state.ensure_open()?;
        let Some(reg) = state.registries.get(registry) else {
            return Err(ProfileError::RegistryNotFound(registry.to_string()));
        };
        Ok(reg.profiles.get(profile).cloned())
    }
}

#[async_trait]
impl ProfileStoreWriter for InMemoryProfileStore {
    async fn upsert_registry(&self, registry: &ProfileRegistry, opts: &SaveOptions) -> Result<()> {
        validate_registry(registry)?;

        let mut state = self.state.write();
        state.ensure_open()?;

        let mut next = registry.clone();
        let existing = state.registries.get(&next.slug);
        assert_expected_version(
            "registry",
            next.slug.as_str(),
            opts.expected_version,
            existing.map(|r| r.metadata.version),
        )?;
        if let Some(existing) = existing {
            next.metadata = existing.metadata.clone();
            if next.default_profile_slug.is_none() {
                next.default_profile_slug = existing
                    .default_profile_slug
                    .clone()
                    .filter(|slug| next.profiles.contains_key(slug));
            }
        }
        touch_metadata(&mut next.metadata, opts);
        state.registries.insert(next.slug.clone(), next);
        Ok(())
    }

    async fn delete_registry(&self, registry: &RegistrySlug, opts: &SaveOptions) -> Result<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        let Some(existing) = state.registries.get(registry) else {
            return Ok(());
        };
        assert_expected_version(
            "registry",
            registry.as_str(),
            opts.expected_version,
            Some(existing.metadata.version),
        )?;
        state.registries.remove(registry);
        Ok(())
    }

    async fn upsert_profile(
        &self,
        registry: &RegistrySlug,
        profile: &Profile,
        opts: &SaveOptions,
    ) -> Result<()> {
        validate_profile(profile)?;

        let mut state = self.state.write();
        state.ensure_open()?;
        let reg = state.registry_mut(registry)?;

        let mut next = profile.clone();
        let existing = reg.profiles.get(&next.slug);
        assert_expected_version(
            "profile",
            next.slug.as_str(),
            opts.expected_version,
            existing.map(|p| p.metadata.version),
        )?;
        // Version and creation stamps are store-owned; source and tags come from the caller.
        match existing {
            Some(existing) => {
                next.metadata.version = existing.metadata.version;
                next.metadata.created_at_ms = existing.metadata.created_at_ms;
                next.metadata.created_by = existing.metadata.created_by.clone();
            }
            None => next.metadata.version = 0,
        }
        touch_metadata(&mut next.metadata, opts);

        // Commit only if the registry stays valid with the new profile in place.
        let mut candidate = reg.clone();
        candidate.profiles.insert(next.slug.clone(), next);
        validate_registry(&candidate)?;
        touch_metadata(&mut candidate.metadata, opts);
        *reg = candidate;
        Ok(())
    }

    async fn delete_profile(
        &self,
        registry: &RegistrySlug,
        profile: &ProfileSlug,
        opts: &SaveOptions,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        let reg = state.registry_mut(registry)?;
        let Some(existing) = reg.profiles.get(profile) else {
            return Ok(());
        };
        assert_expected_version(
            "profile",
            profile.as_str(),
            opts.expected_version,
            Some(existing.metadata.version),
        )?;

        // Stacks in the same registry must not be left pointing at the removed profile.
        let mut candidate = reg.clone();
        candidate.profiles.remove(profile);
        if candidate.default_profile_slug.as_ref() == Some(profile) {
            candidate.default_profile_slug = None;
        }
        validate_registry(&candidate)?;
        touch_metadata(&mut candidate.metadata, opts);
        *reg = candidate;
        Ok(())
    }

    async fn set_default_profile(
        &self,
        registry: &RegistrySlug,
        profile: &ProfileSlug,
        opts: &SaveOptions,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        let reg = state.registry_mut(registry)?;
        if !reg.profiles.contains_key(profile) {
            return Err(ProfileError::profile_not_found(
                registry.as_str(),
                profile.as_str(),
            ));
        }
        assert_expected_version(
            "registry",
            registry.as_str(),
            opts.expected_version,
            Some(reg.metadata.version),
        )?;
        reg.default_profile_slug = Some(profile.clone());
        touch_metadata(&mut reg.metadata, opts);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.write().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileRef;

    fn rslug(s: &str) -> RegistrySlug {
        RegistrySlug::parse(s).unwrap()
    }

    fn pslug(s: &str) -> ProfileSlug {
        ProfileSlug::parse(s).unwrap()
    }

    async fn store_with_registry() -> InMemoryProfileStore {
        let store = InMemoryProfileStore::new();
        store
            .upsert_registry(&ProfileRegistry::new(rslug("default")), &SaveOptions::default())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_reads_are_clones() {
        let store = store_with_registry().await;
        store
            .upsert_profile(&rslug("default"), &Profile::new(pslug("a")), &SaveOptions::default())
            .await
            .unwrap();

        let mut fetched = store.get_profile(&rslug("default"), &pslug("a")).await.unwrap().unwrap();
        fetched.runtime.system_prompt = "mutated".into();

        let again = store.get_profile(&rslug("default"), &pslug("a")).await.unwrap().unwrap();
        assert!(again.runtime.system_prompt.is_empty());
    }

    #[tokio::test]
    async fn test_versions_increment_and_conflict() {
        let store = store_with_registry().await;
        let reg = rslug("default");
        let profile = Profile::new(pslug("a"));

        store.upsert_profile(&reg, &profile, &SaveOptions::expecting(0)).await.unwrap();
        let stored = store.get_profile(&reg, &pslug("a")).await.unwrap().unwrap();
        assert_eq!(stored.metadata.version, 1);

        // create-only write against an existing profile
        let err = store
            .upsert_profile(&reg, &profile, &SaveOptions::expecting(0))
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        store.upsert_profile(&reg, &profile, &SaveOptions::expecting(1)).await.unwrap();
        let stored = store.get_profile(&reg, &pslug("a")).await.unwrap().unwrap();
        assert_eq!(stored.metadata.version, 2);

        let err = store
            .delete_profile(&reg, &pslug("a"), &SaveOptions::expecting(1))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "profile \"a\" version conflict: expected=1 actual=2"
        );
        store.delete_profile(&reg, &pslug("a"), &SaveOptions::expecting(2)).await.unwrap();
        assert!(store.get_profile(&reg, &pslug("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleting_default_clears_selector() {
        let store = store_with_registry().await;
        let reg = rslug("default");
        store.upsert_profile(&reg, &Profile::new(pslug("a")), &SaveOptions::default()).await.unwrap();
        store.set_default_profile(&reg, &pslug("a"), &SaveOptions::default()).await.unwrap();
        assert_eq!(
            store.get_registry(&reg).await.unwrap().unwrap().default_profile_slug,
            Some(pslug("a"))
        );

        store.delete_profile(&reg, &pslug("a"), &SaveOptions::default()).await.unwrap();
        assert_eq!(store.get_registry(&reg).await.unwrap().unwrap().default_profile_slug, None);
    }

    #[tokio::test]
    async fn test_delete_rejected_while_stacked_upon() {
        let store = store_with_registry().await;
        let reg = rslug("default");
        let mut leaf = Profile::new(pslug("leaf"));
        leaf.stack.push(ProfileRef::local(pslug("base")));
        for profile in [Profile::new(pslug("base")), leaf, Profile::new(pslug("other"))] {
            store.upsert_profile(&reg, &profile, &SaveOptions::default()).await.unwrap();
        }

        let err = store
            .delete_profile(&reg, &pslug("base"), &SaveOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProfileError::validation(
                "registry.profiles[leaf].stack[0]",
                "referenced profile \"base\" not found in registry \"default\""
            )
        );
        assert!(store.get_profile(&reg, &pslug("base")).await.unwrap().is_some());

        // the registry stays writable for unrelated profiles
        store
            .upsert_profile(&reg, &Profile::new(pslug("other")), &SaveOptions::default())
            .await
            .unwrap();

        store.delete_profile(&reg, &pslug("leaf"), &SaveOptions::default()).await.unwrap();
        store.delete_profile(&reg, &pslug("base"), &SaveOptions::default()).await.unwrap();
        assert!(store.get_profile(&reg, &pslug("base")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_default_requires_existing_profile() {
        let store = store_with_registry().await;
        let err = store
            .set_default_profile(&rslug("default"), &pslug("ghost"), &SaveOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cycle_rejected_on_write() {
        let store = store_with_registry().await;
        let reg = rslug("default");
        let mut a = Profile::new(pslug("a"));
        a.stack.push(ProfileRef::local(pslug("b")));
        let mut b = Profile::new(pslug("b"));
        b.stack.push(ProfileRef::local(pslug("a")));

        // "a" alone points at a missing local profile
        assert!(store.upsert_profile(&reg, &a, &SaveOptions::default()).await.is_err());

        store.upsert_profile(&reg, &Profile::new(pslug("b")), &SaveOptions::default()).await.unwrap();
        store.upsert_profile(&reg, &a, &SaveOptions::default()).await.unwrap();
        let err = store.upsert_profile(&reg, &b, &SaveOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("stack cycle detected"));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = store_with_registry().await;
        store.close().await.unwrap();
        let err = store.list_registries().await.unwrap_err();
        assert_eq!(err.to_string(), "validation error (store): store is closed");
    }

    #[tokio::test]
    async fn test_unknown_registry() {
        let store = InMemoryProfileStore::new();
        let err = store
            .upsert_profile(&rslug("nope"), &Profile::new(pslug("a")), &SaveOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, ProfileError::RegistryNotFound("nope".into()));
    }
}
