//! Versioned profile extensions.
//!
//! Extensions are an open map from `namespace.feature@vN` keys to JSON
//! payloads. Typed access goes through [`ProfileExtensionKey`], which decodes
//! on read and re-encodes on write. Keys without a registered
//! [`ExtensionCodec`] are carried through untouched.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

use crate::error::ProfileError;
use crate::profile::Profile;

lazy_static! {
    static ref EXTENSION_KEY_PATTERN: Regex = Regex::new(
        r"^([a-z0-9](?:[a-z0-9_-]{0,62}[a-z0-9])?)\.([a-z0-9](?:[a-z0-9_-]{0,62}[a-z0-9])?)@v([1-9][0-9]{0,4})$"
    )
    .unwrap();
}

/// Errors from typed extension access.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("extension key cannot be empty")]
    EmptyKey,

    #[error("extension key \"{0}\" is invalid (expected namespace.feature@vN)")]
    InvalidKey(String),

    #[error("extension key version must be >= 1")]
    ZeroVersion,

    #[error("profile.extensions[\"{key}\"]: {reason}")]
    Payload { key: String, reason: String },
}

/// Canonical `namespace.feature@vN` identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtensionKey {
    raw: String,
    namespace: String,
    feature: String,
    version: u16,
}

impl ExtensionKey {
    pub fn parse(raw: &str) -> Result<Self, ExtensionError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(ExtensionError::EmptyKey);
        }
        let caps = EXTENSION_KEY_PATTERN
            .captures(&normalized)
            .ok_or_else(|| ExtensionError::InvalidKey(raw.to_string()))?;
        let version: u16 = caps[3]
            .parse()
            .map_err(|_| ExtensionError::InvalidKey(raw.to_string()))?;
        Ok(Self {
            namespace: caps[1].to_string(),
            feature: caps[2].to_string(),
            version,
            raw: normalized,
        })
    }

    pub fn new(namespace: &str, feature: &str, version: u16) -> Result<Self, ExtensionError> {
        if version == 0 {
            return Err(ExtensionError::ZeroVersion);
        }
        Self::parse(&format!("{}.{}@v{}", namespace, feature, version))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn version(&self) -> u16 {
        self.version
    }
}

impl fmt::Display for ExtensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for ExtensionKey {
    type Error = ExtensionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ExtensionKey::parse(&value)
    }
}

impl From<ExtensionKey> for String {
    fn from(value: ExtensionKey) -> Self {
        value.raw
    }
}

/// Typed handle for one extension key.
pub struct ProfileExtensionKey<T> {
    id: ExtensionKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ProfileExtensionKey<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ProfileExtensionKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProfileExtensionKey").field(&self.id.raw).finish()
    }
}

impl<T> ProfileExtensionKey<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(namespace: &str, feature: &str, version: u16) -> Result<Self, ExtensionError> {
        Ok(Self::from_id(ExtensionKey::new(namespace, feature, version)?))
    }

    pub fn from_id(id: ExtensionKey) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> &ExtensionKey {
        &self.id
    }

    fn payload_error(&self, reason: impl Into<String>) -> ExtensionError {
        ExtensionError::Payload {
            key: self.id.raw.clone(),
            reason: reason.into(),
        }
    }

    pub fn decode(&self, raw: &Value) -> Result<T, ExtensionError> {
        if raw.is_null() {
            return Err(self.payload_error("cannot decode null"));
        }
        serde_json::from_value(raw.clone()).map_err(|e| self.payload_error(e.to_string()))
    }

    /// `Ok(None)` when the key is absent.
    pub fn get(&self, profile: &Profile) -> Result<Option<T>, ExtensionError> {
        profile
            .extensions
            .get(self.id.as_str())
            .map(|raw| self.decode(raw))
            .transpose()
    }

    pub fn set(&self, profile: &mut Profile, value: &T) -> Result<(), ExtensionError> {
        let encoded = serde_json::to_value(value)
            .map_err(|e| self.payload_error(format!("value not serializable: {}", e)))?;
        profile.extensions.insert(self.id.raw.clone(), encoded);
        Ok(())
    }

    pub fn delete(&self, profile: &mut Profile) {
        profile.extensions.remove(self.id.as_str());
    }
}

/// Decodes and normalizes payloads for one extension key.
pub trait ExtensionCodec: Send + Sync {
    fn key(&self) -> ExtensionKey;

    /// Return the normalized payload or a reason for rejecting it.
    fn decode(&self, raw: &Value) -> anyhow::Result<Value>;
}

/// Lookup side of a codec registry.
pub trait ExtensionCodecRegistry: Send + Sync {
    fn lookup(&self, key: &ExtensionKey) -> Option<Arc<dyn ExtensionCodec>>;
}

/// Codec registry guarded by a read-write lock.
#[derive(Default)]
pub struct InMemoryExtensionCodecRegistry {
    codecs: RwLock<BTreeMap<ExtensionKey, Arc<dyn ExtensionCodec>>>,
}

impl InMemoryExtensionCodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, codec: Arc<dyn ExtensionCodec>) -> Result<(), ProfileError> {
        let key = codec.key();
        let mut codecs = self.codecs.write();
        if codecs.contains_key(&key) {
            return Err(ProfileError::validation(
                format!("extensions.codecs[{}]", key),
                format!("duplicate codec key \"{}\"", key),
            ));
        }
        codecs.insert(key, codec);
        Ok(())
    }

    pub fn keys(&self) -> Vec<ExtensionKey> {
        self.codecs.read().keys().cloned().collect()
    }
}

impl ExtensionCodecRegistry for InMemoryExtensionCodecRegistry {
    fn lookup(&self, key: &ExtensionKey) -> Option<Arc<dyn ExtensionCodec>> {
        self.codecs.read().get(key).cloned()
    }
}

impl fmt::Debug for InMemoryExtensionCodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryExtensionCodecRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

/// Canonicalize every key and run registered codecs. Unknown keys are kept.
pub fn normalize_profile_extensions(
    raw: &BTreeMap<String, Value>,
    registry: Option<&dyn ExtensionCodecRegistry>,
) -> Result<BTreeMap<String, Value>, ProfileError> {
    let mut out = BTreeMap::new();
    for (raw_key, value) in raw {
        let key = ExtensionKey::parse(raw_key).map_err(|e| {
            ProfileError::validation(
                format!("profile.extensions[{}]", raw_key.trim()),
                e.to_string(),
            )
        })?;
        if out.contains_key(key.as_str()) {
            return Err(ProfileError::validation(
                format!("profile.extensions[{}]", key),
                "duplicate extension key after canonicalization",
            ));
        }
        let normalized = match registry.and_then(|r| r.lookup(&key)) {
            Some(codec) => codec.decode(value).map_err(|e| {
                ProfileError::validation(format!("profile.extensions[{}]", key), e.to_string())
            })?,
            None => value.clone(),
        };
        out.insert(key.raw, normalized);
    }
    Ok(out)
}
