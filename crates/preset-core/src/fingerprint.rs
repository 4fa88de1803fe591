//! Runtime fingerprint: a content hash of everything that shapes a resolved
//! runtime, usable as a cache key.

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::profile::{MiddlewareUse, RuntimeSpec, StepSettings};
use crate::slug::{ProfileSlug, RegistrySlug};
use crate::stack::ProfileStackLayer;

/// One stack layer's identity as it enters the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineageEntry {
    pub registry: String,
    pub profile: String,
    pub version: u64,
}

impl LineageEntry {
    pub fn from_layer(layer: &ProfileStackLayer) -> Self {
        Self {
            registry: layer.registry_slug.to_string(),
            profile: layer.profile_slug.to_string(),
            version: layer.profile.metadata.version,
        }
    }
}

/// Inputs to [`runtime_fingerprint`].
#[derive(Debug, Clone)]
pub struct FingerprintInput<'a> {
    pub registry_slug: &'a RegistrySlug,
    pub profile_slug: &'a ProfileSlug,
    pub profile_version: u64,
    pub lineage: Vec<LineageEntry>,
    pub runtime: &'a RuntimeSpec,
    pub step_settings: Option<&'a StepSettings>,
}

fn normalized_middleware(mw: &MiddlewareUse) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("name".into(), json!(mw.name.trim()));
    if let Some(id) = mw.trimmed_id() {
        obj.insert("id".into(), json!(id));
    }
    if let Some(enabled) = mw.enabled {
        obj.insert("enabled".into(), json!(enabled));
    }
    if let Some(config) = &mw.config {
        obj.insert("config".into(), config.clone());
    }
    Value::Object(obj)
}

/// Build the payload that gets hashed. Exposed for debugging.
pub fn fingerprint_payload(input: &FingerprintInput<'_>) -> Value {
    let runtime = input.runtime;
    let mut payload = json!({
        "registry_slug": input.registry_slug.as_str(),
        "profile_slug": input.profile_slug.as_str(),
        "profile_version": input.profile_version,
        "lineage": input.lineage,
        "runtime": {
            "step_settings_patch": runtime.step_settings_patch,
            "system_prompt": runtime.system_prompt,
            "middlewares": runtime.middlewares.iter().map(normalized_middleware).collect::<Vec<_>>(),
            "tools": runtime.tools(),
        },
    });
    if let Some(settings) = input.step_settings {
        let metadata: BTreeMap<String, Value> = settings.metadata();
        payload["step_metadata"] = json!(metadata);
    }
    payload
}

/// `"sha256:" + hex(SHA-256(payload JSON))`.
///
/// serde_json's `Map` keeps keys sorted, so the encoding is canonical.
pub fn runtime_fingerprint(input: &FingerprintInput<'_>) -> String {
    let payload = fingerprint_payload(input).to_string();
    let digest = Sha256::digest(payload.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}
