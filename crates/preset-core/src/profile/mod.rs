//! Profile data model.
//!
//! A [`Profile`] is a declarative preset of model settings, system prompt,
//! middlewares, tools and override policy. Profiles live in a
//! [`ProfileRegistry`] and may inherit from other profiles through an ordered
//! `stack` of [`ProfileRef`]s.
//!
//! Every type here owns its data outright, so `clone()` is a deep copy and a
//! caller mutating a clone can never reach back into a stored value.

pub mod codec;
pub mod schema;
pub mod validation;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::slug::{ProfileSlug, RegistrySlug, RuntimeKey};

pub use codec::{decode_registry_yaml, encode_registry_yaml};
pub use validation::{validate_profile, validate_registry};

/// Section slug → field → value overlay applied to step settings.
pub type StepSettingsPatch = BTreeMap<String, BTreeMap<String, Value>>;

/// One middleware instance within a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MiddlewareUse {
    /// Registered middleware definition name
    pub name: String,

    /// Stable instance id; positional index addresses the instance when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// `None` means enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Inline configuration payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl MiddlewareUse {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Trimmed id, or `None` when absent or blank.
    pub fn trimmed_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Diagnostic key: `name#id`, or `name[index]` when no id is set.
    pub fn instance_key(&self, index: usize) -> String {
        let name = self.name.trim();
        match self.trimmed_id() {
            Some(id) => format!("{}#{}", name, id),
            None => format!("{}[{}]", name, index),
        }
    }

    /// Key used in diagnostics that have no positional context: `name#id` or `name`.
    pub fn diagnostic_key(&self) -> String {
        let name = self.name.trim();
        match self.trimmed_id() {
            Some(id) => format!("{}#{}", name, id),
            None => name.to_string(),
        }
    }
}

/// Reference to another profile in a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRef {
    /// Omitted means the registry of the profile declaring the ref
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_slug: Option<RegistrySlug>,

    pub profile_slug: ProfileSlug,
}

impl ProfileRef {
    pub fn local(profile_slug: ProfileSlug) -> Self {
        Self {
            registry_slug: None,
            profile_slug,
        }
    }

    pub fn remote(registry_slug: RegistrySlug, profile_slug: ProfileSlug) -> Self {
        Self {
            registry_slug: Some(registry_slug),
            profile_slug,
        }
    }
}

/// Runtime settings contributed by a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub step_settings_patch: StepSettingsPatch,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_prompt: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<MiddlewareUse>,

    /// `None` leaves inherited tools untouched; `Some(vec![])` clears them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

impl RuntimeSpec {
    pub fn tools(&self) -> &[String] {
        self.tools.as_deref().unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.step_settings_patch.is_empty()
            && self.system_prompt.trim().is_empty()
            && self.middlewares.is_empty()
            && self.tools.is_none()
    }
}

/// Request-override policy for a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PolicySpec {
    #[serde(default)]
    pub allow_overrides: bool,

    /// Empty means every non-denied key is allowed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_override_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denied_override_keys: Vec<String>,

    #[serde(default)]
    pub read_only: bool,
}

/// Provenance and optimistic-lock counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfileMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    /// Incremented on every write
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub created_at_ms: i64,

    #[serde(default)]
    pub updated_at_ms: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_by: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ProfileMetadata {
    /// Overlay the non-empty fields of `patch`.
    pub fn merged_with(&self, patch: &ProfileMetadata) -> ProfileMetadata {
        let mut ret = self.clone();
        if !patch.source.is_empty() {
            ret.source = patch.source.clone();
        }
        if !patch.created_by.is_empty() {
            ret.created_by = patch.created_by.clone();
        }
        if !patch.updated_by.is_empty() {
            ret.updated_by = patch.updated_by.clone();
        }
        if patch.created_at_ms != 0 {
            ret.created_at_ms = patch.created_at_ms;
        }
        if patch.updated_at_ms != 0 {
            ret.updated_at_ms = patch.updated_at_ms;
        }
        if patch.version != 0 {
            ret.version = patch.version;
        }
        if !patch.tags.is_empty() {
            ret.tags = patch.tags.clone();
        }
        ret
    }
}

/// A named preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub slug: ProfileSlug,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Profiles inherited from, base first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<ProfileRef>,

    #[serde(default)]
    pub runtime: RuntimeSpec,

    #[serde(default)]
    pub policy: PolicySpec,

    #[serde(default)]
    pub metadata: ProfileMetadata,

    /// Canonical extension key → payload
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

impl Profile {
    pub fn new(slug: ProfileSlug) -> Self {
        Self {
            slug,
            display_name: String::new(),
            description: String::new(),
            stack: Vec::new(),
            runtime: RuntimeSpec::default(),
            policy: PolicySpec::default(),
            metadata: ProfileMetadata::default(),
            extensions: BTreeMap::new(),
        }
    }
}

/// A named set of profiles with a default selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRegistry {
    pub slug: RegistrySlug,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile_slug: Option<ProfileSlug>,

    #[serde(default)]
    pub profiles: BTreeMap<ProfileSlug, Profile>,

    #[serde(default)]
    pub metadata: ProfileMetadata,
}

impl ProfileRegistry {
    pub fn new(slug: RegistrySlug) -> Self {
        Self {
            slug,
            display_name: String::new(),
            description: String::new(),
            default_profile_slug: None,
            profiles: BTreeMap::new(),
            metadata: ProfileMetadata::default(),
        }
    }

    /// Insert a profile keyed by its own slug.
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profiles.insert(profile.slug.clone(), profile);
        self
    }

    pub fn with_default(mut self, slug: ProfileSlug) -> Self {
        self.default_profile_slug = Some(slug);
        self
    }

    /// Slug used when a caller names no profile: the explicit default,
    /// otherwise a profile literally called `default`.
    pub fn fallback_profile_slug(&self) -> Option<ProfileSlug> {
        if let Some(slug) = &self.default_profile_slug {
            return Some(slug.clone());
        }
        self.profiles
            .keys()
            .find(|slug| slug.as_str() == "default")
            .cloned()
    }
}

/// Effective model settings: section → field → value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepSettings {
    #[serde(default, flatten)]
    pub sections: BTreeMap<String, BTreeMap<String, Value>>,
}

impl StepSettings {
    pub fn get(&self, section: &str, field: &str) -> Option<&Value> {
        self.sections.get(section).and_then(|s| s.get(field))
    }

    pub fn set(&mut self, section: impl Into<String>, field: impl Into<String>, value: Value) {
        self.sections
            .entry(section.into())
            .or_default()
            .insert(field.into(), value);
    }

    /// Flat `section.field → value` view used for fingerprints and logging.
    pub fn metadata(&self) -> BTreeMap<String, Value> {
        self.sections
            .iter()
            .flat_map(|(section, fields)| {
                fields
                    .iter()
                    .map(move |(field, value)| (format!("{}.{}", section, field), value.clone()))
            })
            .collect()
    }
}

/// Clone `base` (or start empty) and overlay `patch` section by section.
pub fn apply_step_settings_patch(
    base: Option<&StepSettings>,
    patch: &StepSettingsPatch,
) -> crate::error::Result<StepSettings> {
    let mut resolved = base.cloned().unwrap_or_default();
    for (section, fields) in patch {
        let section = section.trim();
        if section.is_empty() {
            return Err(crate::error::ProfileError::validation(
                "step_settings_patch",
                "section slug must not be empty",
            ));
        }
        for (field, value) in fields {
            resolved.set(section, field.clone(), value.clone());
        }
    }
    Ok(resolved)
}

/// Output of effective-profile resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProfile {
    pub registry_slug: RegistrySlug,
    pub profile_slug: ProfileSlug,
    pub runtime_key: RuntimeKey,
    pub effective_step_settings: StepSettings,
    pub effective_runtime: RuntimeSpec,
    pub runtime_fingerprint: String,
    /// `profile.*` keys, stack lineage, stack trace and fingerprint
    pub metadata: BTreeMap<String, Value>,
}

/// Listing entry for a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub slug: RegistrySlug,
    pub display_name: String,
    pub default_profile_slug: Option<ProfileSlug>,
    pub profile_count: usize,
}
