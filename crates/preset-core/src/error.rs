//! Error types shared by the profile engine.
//!
//! Every failure a caller can act on has its own variant. Stack cycles and
//! depth breaches are reported as [`ProfileError::Validation`] carrying the
//! full traversal chain.

use thiserror::Error;

/// Errors produced by profile parsing, storage, stacking and resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// Structural or semantic input problem.
    #[error("validation error ({field}): {reason}")]
    Validation { field: String, reason: String },

    #[error("registry not found: {0}")]
    RegistryNotFound(String),

    #[error("profile not found: {registry}/{profile}")]
    ProfileNotFound { registry: String, profile: String },

    /// Optimistic-lock mismatch on write.
    #[error("{resource} \"{slug}\" version conflict: expected={expected} actual={actual}")]
    VersionConflict {
        resource: String,
        slug: String,
        expected: u64,
        actual: u64,
    },

    #[error("{}", policy_message(.profile, .reason))]
    PolicyViolation {
        profile: Option<String>,
        reason: String,
    },

    #[error("store is read-only")]
    ReadOnlyStore,

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("JSON error: {0}")]
    Json(String),
}

fn policy_message(profile: &Option<String>, reason: &str) -> String {
    match profile {
        Some(slug) if !slug.is_empty() => {
            format!("policy violation for profile \"{}\": {}", slug, reason)
        }
        _ => format!("policy violation: {}", reason),
    }
}

impl ProfileError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ProfileError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn policy(reason: impl Into<String>) -> Self {
        ProfileError::PolicyViolation {
            profile: None,
            reason: reason.into(),
        }
    }

    pub fn policy_for(profile: impl Into<String>, reason: impl Into<String>) -> Self {
        ProfileError::PolicyViolation {
            profile: Some(profile.into()),
            reason: reason.into(),
        }
    }

    pub fn profile_not_found(registry: impl Into<String>, profile: impl Into<String>) -> Self {
        ProfileError::ProfileNotFound {
            registry: registry.into(),
            profile: profile.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ProfileError::Validation { .. })
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(self, ProfileError::PolicyViolation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProfileError::RegistryNotFound(_) | ProfileError::ProfileNotFound { .. }
        )
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, ProfileError::VersionConflict { .. })
    }
}

impl From<serde_yaml::Error> for ProfileError {
    fn from(e: serde_yaml::Error) -> Self {
        ProfileError::Yaml(e.to_string())
    }
}

impl From<serde_json::Error> for ProfileError {
    fn from(e: serde_json::Error) -> Self {
        ProfileError::Json(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProfileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let err = ProfileError::validation("profile.slug", "must not be empty");
        assert_eq!(err.to_string(), "validation error (profile.slug): must not be empty");

        let err = ProfileError::VersionConflict {
            resource: "profile".into(),
            slug: "agent".into(),
            expected: 2,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "profile \"agent\" version conflict: expected=2 actual=3"
        );
    }

    #[test]
    fn test_policy_violation_with_and_without_profile() {
        assert_eq!(
            ProfileError::policy("request overrides are disabled for this profile").to_string(),
            "policy violation: request overrides are disabled for this profile"
        );
        assert_eq!(
            ProfileError::policy_for("agent", "profile is read-only").to_string(),
            "policy violation for profile \"agent\": profile is read-only"
        );
    }

    #[test]
    fn test_kind_predicates() {
        assert!(ProfileError::RegistryNotFound("x".into()).is_not_found());
        assert!(ProfileError::profile_not_found("a", "b").is_not_found());
        assert!(!ProfileError::ReadOnlyStore.is_not_found());
        assert!(ProfileError::policy("no").is_policy_violation());
    }
}
