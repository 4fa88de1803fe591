//! Registry service: profile CRUD plus effective-profile resolution on top of
//! any [`ProfileStore`].
//!
//! Resolution runs, in order:
//! 1. pick registry and profile (explicit, else registry default)
//! 2. expand the inheritance stack into base→leaf layers
//! 3. merge layers (with per-path trace)
//! 4. apply request overrides under the merged policy
//! 5. overlay the merged step-settings patch onto the caller's base settings
//! 6. compute metadata and the runtime fingerprint

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ProfileError, Result};
use crate::extension::{normalize_profile_extensions, ExtensionCodecRegistry};
use crate::fingerprint::{runtime_fingerprint, FingerprintInput, LineageEntry};
use crate::overrides::apply_request_overrides;
use crate::profile::{
    apply_step_settings_patch, validate_profile, PolicySpec, Profile, ProfileMetadata,
    ProfileRegistry, RegistrySummary, ResolvedProfile, RuntimeSpec, StepSettings,
};
use crate::slug::{ProfileSlug, RegistrySlug, RuntimeKey};
use crate::stack::{
    expand_profile_stack, merge_profile_stack_layers_with_trace, StackResolverOptions,
};
use crate::store::{ProfileStore, SaveOptions};

/// Registry used when a caller names none.
pub const DEFAULT_REGISTRY_SLUG: &str = "default";

/// Inputs to [`StoreRegistry::resolve_effective_profile`].
#[derive(Debug, Clone, Default)]
pub struct ResolveInput {
    pub registry_slug: Option<RegistrySlug>,
    pub profile_slug: Option<ProfileSlug>,
    pub runtime_key_fallback: Option<RuntimeKey>,
    pub base_step_settings: Option<StepSettings>,
    /// Raw override keys; canonicalized during resolution
    pub request_overrides: BTreeMap<String, Value>,
}

impl ResolveInput {
    pub fn profile(slug: ProfileSlug) -> Self {
        Self {
            profile_slug: Some(slug),
            ..Default::default()
        }
    }

    pub fn with_registry(mut self, slug: RegistrySlug) -> Self {
        self.registry_slug = Some(slug);
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: Value) -> Self {
        self.request_overrides.insert(key.into(), value);
        self
    }
}

/// Partial profile update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfilePatch {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub runtime: Option<RuntimeSpec>,
    pub policy: Option<PolicySpec>,
    pub metadata: Option<ProfileMetadata>,
    pub extensions: Option<BTreeMap<String, Value>>,
}

/// Write context for service mutations.
pub type WriteOptions = SaveOptions;

pub struct StoreRegistry<S: ProfileStore> {
    store: Arc<S>,
    default_registry: RegistrySlug,
    stack_options: StackResolverOptions,
    extension_codecs: Option<Arc<dyn ExtensionCodecRegistry>>,
}

impl<S: ProfileStore + 'static> StoreRegistry<S> {
    /// Service over `store` defaulting to the `default` registry.
    pub fn new(store: Arc<S>) -> Result<Self> {
        Ok(Self {
            store,
            default_registry: RegistrySlug::parse(DEFAULT_REGISTRY_SLUG)
                .map_err(|e| e.into_validation("registry.slug"))?,
            stack_options: StackResolverOptions::default(),
            extension_codecs: None,
        })
    }

    pub fn with_default_registry(mut self, slug: RegistrySlug) -> Self {
        self.default_registry = slug;
        self
    }

    pub fn with_stack_options(mut self, opts: StackResolverOptions) -> Self {
        self.stack_options = opts;
        self
    }

    /// Decode extension payloads through `codecs` on every profile write.
    pub fn with_extension_codecs(mut self, codecs: Arc<dyn ExtensionCodecRegistry>) -> Self {
        self.extension_codecs = Some(codecs);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn default_registry(&self) -> &RegistrySlug {
        &self.default_registry
    }

    fn registry_slug(&self, slug: Option<&RegistrySlug>) -> RegistrySlug {
        slug.cloned().unwrap_or_else(|| self.default_registry.clone())
    }

    pub async fn list_registries(&self) -> Result<Vec<RegistrySummary>> {
        let mut summaries: Vec<RegistrySummary> = self
            .store
            .list_registries()
            .await?
            .into_iter()
            .map(|r| RegistrySummary {
                profile_count: r.profiles.len(),
                default_profile_slug: r.default_profile_slug,
                display_name: r.display_name,
                slug: r.slug,
            })
            .collect();
        summaries.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(summaries)
    }

    pub async fn get_registry(&self, registry: Option<&RegistrySlug>) -> Result<ProfileRegistry> {
        let slug = self.registry_slug(registry);
        self.store
            .get_registry(&slug)
            .await?
            .ok_or_else(|| ProfileError::RegistryNotFound(slug.to_string()))
    }

    pub async fn list_profiles(&self, registry: Option<&RegistrySlug>) -> Result<Vec<Profile>> {
        let slug = self.registry_slug(registry);
        let mut profiles = self.store.list_profiles(&slug).await?;
        profiles.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(profiles)
    }

    pub async fn get_profile(
        &self,
        registry: Option<&RegistrySlug>,
        profile: &ProfileSlug,
    ) -> Result<Profile> {
        let slug = self.registry_slug(registry);
        self.store
            .get_profile(&slug, profile)
            .await?
            .ok_or_else(|| ProfileError::profile_not_found(slug.as_str(), profile.as_str()))
    }

    fn normalize_extensions(&self, profile: &mut Profile) -> Result<()> {
        profile.extensions =
            normalize_profile_extensions(&profile.extensions, self.extension_codecs.as_deref())?;
        Ok(())
    }

    /// Insert a new profile. Fails with a version conflict if it already exists.
    pub async fn create_profile(
        &self,
        registry: Option<&RegistrySlug>,
        profile: &Profile,
        opts: &WriteOptions,
    ) -> Result<Profile> {
        let slug = self.registry_slug(registry);
        self.get_registry(Some(&slug)).await?;

        let mut candidate = profile.clone();
        self.normalize_extensions(&mut candidate)?;
        validate_profile(&candidate)?;

        if let Some(existing) = self.store.get_profile(&slug, &candidate.slug).await? {
            return Err(ProfileError::VersionConflict {
                resource: "profile".into(),
                slug: candidate.slug.to_string(),
                expected: 0,
                actual: existing.metadata.version,
            });
        }

        self.store.upsert_profile(&slug, &candidate, opts).await?;
        tracing::info!(registry = %slug, profile = %candidate.slug, actor = %opts.actor, "Profile created");
        self.get_profile(Some(&slug), &candidate.slug).await
    }

    /// Apply `patch` to a stored profile. Read-only profiles refuse updates.
    pub async fn update_profile(
        &self,
        registry: Option<&RegistrySlug>,
        profile: &ProfileSlug,
        patch: ProfilePatch,
        opts: &WriteOptions,
    ) -> Result<Profile> {
        let slug = self.registry_slug(registry);
        let current = self.get_profile(Some(&slug), profile).await?;
        if current.policy.read_only {
            return Err(ProfileError::policy_for(profile.as_str(), "profile is read-only"));
        }

        let mut next = current;
        if let Some(display_name) = patch.display_name {
            next.display_name = display_name.trim().to_string();
        }
        if let Some(description) = patch.description {
            next.description = description.trim().to_string();
        }
        if let Some(runtime) = patch.runtime {
            next.runtime = runtime;
        }
        if let Some(policy) = patch.policy {
            next.policy = policy;
        }
        if let Some(metadata) = patch.metadata {
            next.metadata = next.metadata.merged_with(&metadata);
        }
        if let Some(extensions) = patch.extensions {
            next.extensions = extensions;
        }
        self.normalize_extensions(&mut next)?;
        validate_profile(&next)?;

        self.store.upsert_profile(&slug, &next, opts).await?;
        tracing::info!(registry = %slug, profile = %profile, actor = %opts.actor, "Profile updated");
        self.get_profile(Some(&slug), profile).await
    }

    pub async fn delete_profile(
        &self,
        registry: Option<&RegistrySlug>,
        profile: &ProfileSlug,
        opts: &WriteOptions,
    ) -> Result<()> {
        let slug = self.registry_slug(registry);
        let current = self.get_profile(Some(&slug), profile).await?;
        if current.policy.read_only {
            return Err(ProfileError::policy_for(profile.as_str(), "profile is read-only"));
        }
        self.store.delete_profile(&slug, profile, opts).await?;
        tracing::info!(registry = %slug, profile = %profile, actor = %opts.actor, "Profile deleted");
        Ok(())
    }

    pub async fn set_default_profile(
        &self,
        registry: Option<&RegistrySlug>,
        profile: &ProfileSlug,
        opts: &WriteOptions,
    ) -> Result<()> {
        let slug = self.registry_slug(registry);
        self.get_profile(Some(&slug), profile).await?;
        self.store.set_default_profile(&slug, profile, opts).await
    }

    /// Expand a profile's stack through this service's store.
    pub async fn expand_profile_stack(
        &self,
        registry: Option<&RegistrySlug>,
        profile: &ProfileSlug,
    ) -> Result<Vec<crate::stack::ProfileStackLayer>> {
        let slug = self.registry_slug(registry);
        expand_profile_stack(self.store.as_ref(), &slug, profile, self.stack_options).await
    }

    /// Resolve the effective runtime for one request.
    pub async fn resolve_effective_profile(&self, input: ResolveInput) -> Result<ResolvedProfile> {
        let registry_slug = self.registry_slug(input.registry_slug.as_ref());
        let registry = self.get_registry(Some(&registry_slug)).await?;

        let profile_slug = match input.profile_slug {
            Some(slug) => slug,
            None => registry.fallback_profile_slug().ok_or_else(|| {
                ProfileError::validation(
                    "profile.slug",
                    "profile slug is required and registry has no default",
                )
            })?,
        };

        let layers = expand_profile_stack(
            self.store.as_ref(),
            &registry_slug,
            &profile_slug,
            self.stack_options,
        )
        .await?;
        let (merged, trace) = merge_profile_stack_layers_with_trace(&layers);

        let effective_runtime =
            apply_request_overrides(&merged.runtime, &merged.policy, &input.request_overrides)
                .inspect_err(|e| {
                    tracing::warn!(
                        registry = %registry_slug,
                        profile = %profile_slug,
                        error = %e,
                        "Request overrides rejected"
                    );
                })?;
        let effective_step_settings = apply_step_settings_patch(
            input.base_step_settings.as_ref(),
            &effective_runtime.step_settings_patch,
        )?;

        let runtime_key = input
            .runtime_key_fallback
            .unwrap_or_else(|| RuntimeKey::from(profile_slug.clone()));

        // The root profile is always the last layer
        let (profile_version, profile_source) = layers
            .last()
            .map(|leaf| {
                let source = leaf.profile.metadata.source.trim();
                let source = if source.is_empty() {
                    registry.metadata.source.trim()
                } else {
                    source
                };
                (leaf.profile.metadata.version, source.to_string())
            })
            .unwrap_or_default();

        let lineage: Vec<LineageEntry> = layers.iter().map(LineageEntry::from_layer).collect();
        let fingerprint = runtime_fingerprint(&FingerprintInput {
            registry_slug: &registry_slug,
            profile_slug: &profile_slug,
            profile_version,
            lineage,
            runtime: &effective_runtime,
            step_settings: Some(&effective_step_settings),
        });

        let lineage_meta: Vec<Value> = layers
            .iter()
            .map(|layer| {
                json!({
                    "registry": layer.registry_slug.as_str(),
                    "profile": layer.profile_slug.as_str(),
                    "version": layer.profile.metadata.version,
                    "source": layer.profile.metadata.source.trim(),
                })
            })
            .collect();

        let mut metadata = BTreeMap::new();
        metadata.insert("profile.registry".to_string(), json!(registry_slug.as_str()));
        metadata.insert("profile.slug".to_string(), json!(profile_slug.as_str()));
        metadata.insert("profile.version".to_string(), json!(profile_version));
        metadata.insert("profile.source".to_string(), json!(profile_source));
        metadata.insert("profile.stack.lineage".to_string(), Value::Array(lineage_meta));
        metadata.insert("profile.stack.trace".to_string(), trace.debug_payload());
        metadata.insert("runtime_fingerprint".to_string(), json!(fingerprint));

        tracing::debug!(
            registry = %registry_slug,
            profile = %profile_slug,
            layers = layers.len(),
            fingerprint = %fingerprint,
            "Resolved effective profile"
        );

        Ok(ResolvedProfile {
            registry_slug,
            profile_slug,
            runtime_key,
            effective_step_settings,
            effective_runtime,
            runtime_fingerprint: fingerprint,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileRef;
    use crate::store::{InMemoryProfileStore, ProfileStoreWriter};

    fn slug(s: &str) -> ProfileSlug {
        ProfileSlug::parse(s).unwrap()
    }

    async fn service(registry: ProfileRegistry) -> StoreRegistry<InMemoryProfileStore> {
        let store = Arc::new(InMemoryProfileStore::new());
        store
            .upsert_registry(&registry, &SaveOptions::default())
            .await
            .unwrap();
        StoreRegistry::new(store).unwrap()
    }

    fn registry() -> ProfileRegistry {
        let mut provider = Profile::new(slug("provider"));
        provider.runtime.system_prompt = "P".into();
        provider.metadata.source = "seed".into();

        let mut agent = Profile::new(slug("agent"));
        agent.stack = vec![ProfileRef::local(slug("provider"))];
        agent.runtime.tools = Some(vec!["t".into()]);

        ProfileRegistry::new(RegistrySlug::parse("default").unwrap())
            .with_profile(provider)
            .with_profile(agent)
    }

    #[tokio::test]
    async fn test_resolve_requires_profile_without_default() {
        let svc = service(registry()).await;
        let err = svc.resolve_effective_profile(ResolveInput::default()).await.unwrap_err();
        assert_eq!(
            err,
            ProfileError::validation(
                "profile.slug",
                "profile slug is required and registry has no default"
            )
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_registry_and_profile() {
        let svc = service(registry()).await;
        let err = svc
            .resolve_effective_profile(
                ResolveInput::profile(slug("agent")).with_registry(RegistrySlug::parse("nope").unwrap()),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ProfileError::RegistryNotFound("nope".into()));

        let err = svc
            .resolve_effective_profile(ResolveInput::profile(slug("ghost")))
            .await
            .unwrap_err();
        assert_eq!(err, ProfileError::profile_not_found("default", "ghost"));
    }

    #[tokio::test]
    async fn test_resolve_metadata_and_fingerprint() {
        let svc = service(registry()).await;
        let mut base = StepSettings::default();
        base.set("chat", "engine", json!("m"));

        let resolved = svc
            .resolve_effective_profile(ResolveInput {
                profile_slug: Some(slug("agent")),
                base_step_settings: Some(base),
                runtime_key_fallback: Some(RuntimeKey::parse("custom").unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(resolved.runtime_key.as_str(), "custom");
        assert_eq!(resolved.effective_runtime.system_prompt, "P");
        assert_eq!(resolved.effective_step_settings.get("chat", "engine"), Some(&json!("m")));
        assert_eq!(resolved.metadata["profile.version"], json!(0));
        assert_eq!(resolved.metadata["profile.source"], json!(""));
        assert_eq!(resolved.metadata["profile.stack.lineage"][0]["source"], json!("seed"));
        assert_eq!(
            resolved.metadata["runtime_fingerprint"],
            json!(resolved.runtime_fingerprint)
        );
        assert!(resolved.metadata["profile.stack.trace"]["paths"].is_array());

        let again = svc
            .resolve_effective_profile(ResolveInput {
                profile_slug: Some(slug("agent")),
                base_step_settings: Some({
                    let mut s = StepSettings::default();
                    s.set("chat", "engine", json!("m"));
                    s
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(again.runtime_fingerprint, resolved.runtime_fingerprint);
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_upstream_version() {
        let svc = service(registry()).await;
        let before = svc
            .resolve_effective_profile(ResolveInput::profile(slug("agent")))
            .await
            .unwrap()
            .runtime_fingerprint;

        svc.update_profile(
            None,
            &slug("provider"),
            ProfilePatch {
                description: Some("bumped".into()),
                ..Default::default()
            },
            &WriteOptions::default(),
        )
        .await
        .unwrap();

        let after = svc
            .resolve_effective_profile(ResolveInput::profile(slug("agent")))
            .await
            .unwrap()
            .runtime_fingerprint;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let svc = service(registry()).await;

        let created = svc
            .create_profile(None, &Profile::new(slug("fresh")), &WriteOptions::default().with_actor("alice"))
            .await
            .unwrap();
        assert_eq!(created.metadata.version, 1);
        assert_eq!(created.metadata.created_by, "alice");

        let err = svc
            .create_profile(None, &Profile::new(slug("fresh")), &WriteOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        let updated = svc
            .update_profile(
                None,
                &slug("fresh"),
                ProfilePatch {
                    display_name: Some("  Fresh  ".into()),
                    policy: Some(PolicySpec {
                        read_only: true,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                &WriteOptions::expecting(1),
            )
            .await
            .unwrap();
        assert_eq!(updated.display_name, "Fresh");
        assert_eq!(updated.metadata.version, 2);

        let err = svc
            .update_profile(None, &slug("fresh"), ProfilePatch::default(), &WriteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "policy violation for profile \"fresh\": profile is read-only");

        let err = svc
            .delete_profile(None, &slug("fresh"), &WriteOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_policy_violation());

        svc.delete_profile(None, &slug("agent"), &WriteOptions::default())
            .await
            .unwrap();
        assert!(svc.get_profile(None, &slug("agent")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_and_default() {
        let svc = service(registry()).await;
        svc.set_default_profile(None, &slug("agent"), &WriteOptions::default())
            .await
            .unwrap();

        let summaries = svc.list_registries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].profile_count, 2);
        assert_eq!(summaries[0].default_profile_slug, Some(slug("agent")));

        let profiles = svc.list_profiles(None).await.unwrap();
        let slugs: Vec<&str> = profiles.iter().map(|p| p.slug.as_str()).collect();
        assert_eq!(slugs, vec!["agent", "provider"]);

        let err = svc
            .set_default_profile(None, &slug("ghost"), &WriteOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
