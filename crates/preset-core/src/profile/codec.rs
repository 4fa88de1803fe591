//! YAML codec for registry documents.
//!
//! One document holds exactly one registry:
//!
//! ```yaml
//! slug: default
//! profiles:
//!   agent:
//!     runtime:
//!       system_prompt: You are helpful.
//! ```
//!
//! Multi-registry bundles (`registries:`), an explicit `default_profile_slug`
//! and the legacy bare profile map are rejected. The default profile is
//! chosen on read: `default` if present, otherwise the first slug in sorted
//! order.

use serde_json::{Map, Value};

use crate::error::{ProfileError, Result};
use crate::profile::schema::validate_registry_document;
use crate::profile::validation::validate_registry;
use crate::profile::ProfileRegistry;
use crate::slug::ProfileSlug;

/// Decode one registry document. Blank input yields `Ok(None)`.
pub fn decode_registry_yaml(data: &str) -> Result<Option<ProfileRegistry>> {
    if data.trim().is_empty() {
        return Ok(None);
    }

    let raw: Value = serde_yaml::from_str(data)?;
    let mut document = match raw {
        Value::Null => return Ok(None),
        Value::Object(map) if map.is_empty() => return Ok(None),
        Value::Object(map) => map,
        _ => {
            return Err(ProfileError::validation(
                "registry",
                "registry YAML must be a mapping",
            ))
        }
    };

    if document.contains_key("registries") {
        return Err(ProfileError::validation(
            "registry",
            "runtime YAML must define a single registry document (top-level registries is not supported)",
        ));
    }
    if document.contains_key("default_profile_slug") {
        return Err(ProfileError::validation(
            "registry.default_profile_slug",
            "runtime YAML must not set default_profile_slug",
        ));
    }
    if !document.contains_key("slug") && !document.contains_key("profiles") {
        return Err(ProfileError::validation(
            "registry",
            "runtime YAML must be a single registry document (legacy profile-map format is not supported)",
        ));
    }
    if !document.contains_key("slug") {
        return Err(ProfileError::validation(
            "registry.slug",
            "must be set for runtime YAML sources",
        ));
    }

    fill_profile_slugs(&mut document);
    let document = Value::Object(document);

    if let Err(errors) = validate_registry_document(&document) {
        return Err(ProfileError::validation("registry", errors.join("; ")));
    }

    let mut registry: ProfileRegistry = serde_json::from_value(document)
        .map_err(|e| ProfileError::validation("registry", e.to_string()))?;

    registry.default_profile_slug = choose_default(&registry);

    validate_registry(&registry).map_err(|e| match e {
        ProfileError::Validation { field, reason } => ProfileError::Validation {
            field,
            reason: format!("runtime YAML registry validation failed: {}", reason),
        },
        other => other,
    })?;
    Ok(Some(registry))
}

/// Encode a registry as one document. `default_profile_slug` is never written.
pub fn encode_registry_yaml(registry: &ProfileRegistry) -> Result<String> {
    validate_registry(registry)?;
    let mut value = serde_json::to_value(registry)?;
    if let Value::Object(map) = &mut value {
        map.remove("default_profile_slug");
    }
    Ok(serde_yaml::to_string(&value)?)
}

fn fill_profile_slugs(document: &mut Map<String, Value>) {
    let Some(Value::Object(profiles)) = document.get_mut("profiles") else {
        return;
    };
    for (key, profile) in profiles.iter_mut() {
        if let Value::Object(fields) = profile {
            fields
                .entry("slug")
                .or_insert_with(|| Value::String(key.clone()));
        }
    }
}

fn choose_default(registry: &ProfileRegistry) -> Option<ProfileSlug> {
    registry
        .profiles
        .keys()
        .find(|slug| slug.as_str() == "default")
        .or_else(|| registry.profiles.keys().next())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
slug: team
display_name: Team presets
profiles:
  base:
    runtime:
      system_prompt: Be brief.
  agent:
    stack:
      - profile_slug: base
    runtime:
      tools: [search]
"#;

    #[test]
    fn test_decode_single_registry() {
        let registry = decode_registry_yaml(DOC).unwrap().unwrap();
        assert_eq!(registry.slug.as_str(), "team");
        assert_eq!(registry.profiles.len(), 2);
        // no "default" profile, so first sorted slug wins
        assert_eq!(
            registry.default_profile_slug.as_ref().map(|s| s.as_str()),
            Some("agent")
        );
        let agent = registry.profiles.values().find(|p| p.slug.as_str() == "agent").unwrap();
        assert_eq!(agent.stack[0].profile_slug.as_str(), "base");
        assert_eq!(agent.runtime.tools(), ["search".to_string()]);
    }

    #[test]
    fn test_default_profile_preferred() {
        let doc = "slug: r\nprofiles:\n  zed: {}\n  default: {}\n";
        let registry = decode_registry_yaml(doc).unwrap().unwrap();
        assert_eq!(
            registry.default_profile_slug.map(String::from),
            Some("default".to_string())
        );
    }

    #[test]
    fn test_blank_input_is_none() {
        assert!(decode_registry_yaml("  \n").unwrap().is_none());
        assert!(decode_registry_yaml("{}").unwrap().is_none());
    }

    #[test]
    fn test_rejects_bundle_default_and_legacy() {
        let err = decode_registry_yaml("registries:\n  a: {slug: a}\n").unwrap_err();
        assert!(err.to_string().contains("top-level registries is not supported"));

        let err = decode_registry_yaml("slug: a\ndefault_profile_slug: x\n").unwrap_err();
        assert_eq!(
            err,
            ProfileError::validation(
                "registry.default_profile_slug",
                "runtime YAML must not set default_profile_slug"
            )
        );

        let err =
            decode_registry_yaml("agent:\n  chat:\n    engine: gpt\n").unwrap_err();
        assert!(err.to_string().contains("legacy profile-map format is not supported"));

        let err = decode_registry_yaml("profiles:\n  a: {}\n").unwrap_err();
        assert!(err.to_string().contains("registry.slug"));
    }

    #[test]
    fn test_schema_violation_reported() {
        let err = decode_registry_yaml("slug: a\nprofiles:\n  p:\n    runtime:\n      tools: 3\n")
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("/profiles/p/runtime/tools"));
    }

    #[test]
    fn test_encode_omits_default_and_round_trips() {
        let registry = decode_registry_yaml(DOC).unwrap().unwrap();
        let encoded = encode_registry_yaml(&registry).unwrap();
        assert!(!encoded.contains("default_profile_slug"));
        let decoded = decode_registry_yaml(&encoded).unwrap().unwrap();
        assert_eq!(decoded.profiles, registry.profiles);
    }
}
