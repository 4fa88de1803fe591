//! Structural validation for profiles and registries.
//!
//! Field paths in errors mirror the serialized layout (`runtime.middlewares[1].id`,
//! `profile.stack[0].profile_slug`) so a caller can point at the offending
//! input directly.

use std::collections::{BTreeSet, HashMap};

use crate::error::{ProfileError, Result};
use crate::extension::ExtensionKey;
use crate::overrides::canonical_override_key;
use crate::profile::{MiddlewareUse, PolicySpec, Profile, ProfileRef, ProfileRegistry, RuntimeSpec};
use crate::stack::validate_registry_stack_topology;

/// Validate a runtime's middlewares and tools.
pub fn validate_runtime_spec(spec: &RuntimeSpec) -> Result<()> {
    validate_middleware_uses(&spec.middlewares, "runtime.middlewares")?;
    for (i, tool) in spec.tools().iter().enumerate() {
        if tool.trim().is_empty() {
            return Err(ProfileError::validation(
                format!("runtime.tools[{}]", i),
                "must not be empty",
            ));
        }
    }
    Ok(())
}

/// Names must be set; non-empty ids must be unique within the sequence.
pub fn validate_middleware_uses(middlewares: &[MiddlewareUse], field_prefix: &str) -> Result<()> {
    let mut seen_ids: HashMap<&str, usize> = HashMap::new();
    for (i, mw) in middlewares.iter().enumerate() {
        if mw.name.trim().is_empty() {
            return Err(ProfileError::validation(
                format!("{}[{}].name", field_prefix, i),
                "must not be empty",
            ));
        }
        if matches!(mw.id.as_deref(), Some(raw) if raw.trim().is_empty() && !raw.is_empty()) {
            return Err(ProfileError::validation(
                format!("{}[{}].id", field_prefix, i),
                "must not be empty",
            ));
        }
        let Some(id) = mw.trimmed_id() else {
            continue;
        };
        if let Some(first) = seen_ids.get(id) {
            return Err(ProfileError::validation(
                format!("{}[{}].id", field_prefix, i),
                format!(
                    "duplicate middleware instance id \"{}\" (first seen at {}[{}].id)",
                    id, field_prefix, first
                ),
            ));
        }
        seen_ids.insert(id, i);
    }
    Ok(())
}

/// Keys must be non-empty and no key may be both allowed and denied.
pub fn validate_policy_spec(policy: &PolicySpec) -> Result<()> {
    let mut allowed = BTreeSet::new();
    for (i, key) in policy.allowed_override_keys.iter().enumerate() {
        let canonical = canonical_override_key(key);
        if canonical.is_empty() {
            return Err(ProfileError::validation(
                format!("policy.allowed_override_keys[{}]", i),
                "must not be empty",
            ));
        }
        allowed.insert(canonical);
    }
    for (i, key) in policy.denied_override_keys.iter().enumerate() {
        let canonical = canonical_override_key(key);
        if canonical.is_empty() {
            return Err(ProfileError::validation(
                format!("policy.denied_override_keys[{}]", i),
                "must not be empty",
            ));
        }
        if allowed.contains(&canonical) {
            return Err(ProfileError::validation(
                "policy.override_keys",
                format!("key \"{}\" appears in both allow and deny lists", canonical),
            ));
        }
    }
    Ok(())
}

pub fn validate_profile_ref(reference: &ProfileRef, field_prefix: &str) -> Result<()> {
    // Slug newtypes are valid by construction; only re-check canonical form.
    if reference.profile_slug.as_str().is_empty() {
        return Err(ProfileError::validation(
            format!("{}.profile_slug", field_prefix),
            "must not be empty",
        ));
    }
    if matches!(&reference.registry_slug, Some(slug) if slug.as_str().is_empty()) {
        return Err(ProfileError::validation(
            format!("{}.registry_slug", field_prefix),
            "must not be empty",
        ));
    }
    Ok(())
}

pub fn validate_profile_extensions(profile: &Profile) -> Result<()> {
    for raw_key in profile.extensions.keys() {
        let key = ExtensionKey::parse(raw_key).map_err(|e| {
            ProfileError::validation(
                format!("profile.extensions[{}]", raw_key.trim()),
                e.to_string(),
            )
        })?;
        if key.as_str() != raw_key {
            return Err(ProfileError::validation(
                format!("profile.extensions[{}]", raw_key),
                format!("extension key must be canonical (\"{}\")", key),
            ));
        }
    }
    Ok(())
}

pub fn validate_profile(profile: &Profile) -> Result<()> {
    validate_runtime_spec(&profile.runtime)?;
    validate_policy_spec(&profile.policy)?;
    validate_profile_extensions(profile)?;
    for (i, reference) in profile.stack.iter().enumerate() {
        validate_profile_ref(reference, &format!("profile.stack[{}]", i))?;
    }
    Ok(())
}

/// Validate every profile, key/slug agreement, the default selector and the
/// local stack topology. Refs into other registries are not followed.
pub fn validate_registry(registry: &ProfileRegistry) -> Result<()> {
    for (slug, profile) in &registry.profiles {
        validate_profile(profile)?;
        if &profile.slug != slug {
            return Err(ProfileError::validation(
                format!("registry.profiles[{}].slug", slug),
                "map key and profile slug must match",
            ));
        }
    }

    if let Some(default) = &registry.default_profile_slug {
        if !registry.profiles.is_empty() && !registry.profiles.contains_key(default) {
            return Err(ProfileError::validation(
                "registry.default_profile_slug",
                "default profile does not exist in registry",
            ));
        }
    }

    validate_registry_stack_topology(registry, crate::stack::DEFAULT_MAX_DEPTH)
}
