//! Canonical identifiers for registries, profiles and runtime keys.
//!
//! All three share one grammar: lower-case ASCII letters and digits, with
//! `.`, `_` and `-` allowed in the interior, at most 128 characters. Parsing
//! trims and lower-cases before validating, so `" Agent "` and `"agent"` name
//! the same profile.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProfileError;

lazy_static! {
    /// Shared slug grammar.
    pub static ref SLUG_PATTERN: Regex =
        Regex::new(r"^[a-z0-9](?:[a-z0-9._-]{0,126}[a-z0-9])?$").unwrap();
}

/// Error returned when a slug fails to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugError {
    message: String,
}

impl fmt::Display for SlugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for SlugError {}

impl SlugError {
    pub(crate) fn into_validation(self, field: impl Into<String>) -> ProfileError {
        ProfileError::validation(field, self.message)
    }
}

/// Trim, lower-case and validate `raw` against the slug grammar.
pub fn normalize_slug(raw: &str, label: &str) -> Result<String, SlugError> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(SlugError {
            message: format!("{} cannot be empty", label),
        });
    }
    if !SLUG_PATTERN.is_match(&normalized) {
        return Err(SlugError {
            message: format!("{} \"{}\" is invalid", label, raw),
        });
    }
    Ok(normalized)
}

macro_rules! slug_type {
    ($(#[$doc:meta])* $name:ident, $label:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub const LABEL: &'static str = $label;

            /// Parse and canonicalize a raw value.
            pub fn parse(raw: &str) -> Result<Self, SlugError> {
                normalize_slug(raw, $label).map($name)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = SlugError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = SlugError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                $name::parse(&value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = SlugError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                $name::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

slug_type!(
    /// Name of a profile registry.
    RegistrySlug,
    "registry slug"
);

slug_type!(
    /// Name of a profile within a registry.
    ProfileSlug,
    "profile slug"
);

slug_type!(
    /// Key under which a resolved runtime is cached by callers.
    RuntimeKey,
    "runtime key"
);

impl From<ProfileSlug> for RuntimeKey {
    fn from(value: ProfileSlug) -> Self {
        // Both types share one grammar, so a valid profile slug is a valid key.
        RuntimeKey(value.0)
    }
}
