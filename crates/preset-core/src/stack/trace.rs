//! Per-path provenance for stack merges.
//!
//! Every field a layer writes becomes a [`TraceStep`] under its JSON pointer.
//! After all layers are recorded, each path's final value is taken from the
//! merged result, so the trace always agrees with what the merge emitted.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::merge::{middleware_merge_key, StackMergeResult};
use super::ProfileStackLayer;
use crate::pointer::{child, escape_token, leaf_writes};
use crate::profile::{PolicySpec, RuntimeSpec};
use crate::slug::{ProfileSlug, RegistrySlug};

/// One layer's write to one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub registry_slug: RegistrySlug,
    pub profile_slug: ProfileSlug,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile_source: String,
    pub profile_version: u64,
    pub layer_index: usize,
    pub path: String,
    pub value: Value,
}

/// History and final value of one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathTrace {
    pub path: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<TraceStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileStackTrace {
    pub path_values: BTreeMap<String, Value>,
    pub ordered_paths: Vec<String>,
    pub trace: BTreeMap<String, PathTrace>,
}

impl ProfileStackTrace {
    /// Record every write of `layers` and set final values from `merged`.
    pub fn build(layers: &[ProfileStackLayer], merged: &StackMergeResult) -> Self {
        let mut trace = Self::default();
        for (index, layer) in layers.iter().enumerate() {
            let profile = &layer.profile;
            let mut record = |path: String, value: Value| {
                trace.record_step(path, value, layer, index);
            };
            for (path, value) in runtime_writes(&profile.runtime) {
                record(path, value);
            }
            for (path, value) in extension_writes(&profile.extensions) {
                record(path, value);
            }
            for (path, value) in policy_writes(&profile.policy) {
                record(path, value);
            }
        }

        for (path, value) in runtime_writes(&merged.runtime) {
            trace.set_final(path, value);
        }
        for (path, value) in extension_writes(&merged.extensions) {
            trace.set_final(path, value);
        }
        for (path, value) in policy_writes(&merged.policy) {
            trace.set_final(path, value);
        }

        trace.ordered_paths = trace
            .path_values
            .keys()
            .chain(trace.trace.keys())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        trace
    }

    fn record_step(&mut self, path: String, value: Value, layer: &ProfileStackLayer, layer_index: usize) {
        let entry = self.trace.entry(path.clone()).or_insert_with(|| PathTrace {
            path: path.clone(),
            value: Value::Null,
            steps: Vec::new(),
        });
        entry.value = value.clone();
        entry.steps.push(TraceStep {
            registry_slug: layer.registry_slug.clone(),
            profile_slug: layer.profile_slug.clone(),
            profile_source: layer.profile.metadata.source.trim().to_string(),
            profile_version: layer.profile.metadata.version,
            layer_index,
            path: path.clone(),
            value: value.clone(),
        });
        self.path_values.insert(path, value);
    }

    fn set_final(&mut self, path: String, value: Value) {
        let entry = self.trace.entry(path.clone()).or_insert_with(|| PathTrace {
            path: path.clone(),
            value: Value::Null,
            steps: Vec::new(),
        });
        entry.value = value.clone();
        self.path_values.insert(path, value);
    }

    pub fn latest_value(&self, path: &str) -> Option<Value> {
        self.path_values.get(path).cloned()
    }

    pub fn history(&self, path: &str) -> Vec<TraceStep> {
        self.trace
            .get(path)
            .map(|t| t.steps.clone())
            .unwrap_or_default()
    }

    pub fn ordered_paths(&self) -> &[String] {
        &self.ordered_paths
    }

    /// Stable debug form: `{"paths": [{"path", "value", "steps"}]}`.
    pub fn debug_payload(&self) -> Value {
        let paths: Vec<Value> = self
            .ordered_paths
            .iter()
            .map(|path| {
                let value = self.path_values.get(path).cloned().unwrap_or(Value::Null);
                let steps = serde_json::to_value(self.history(path)).unwrap_or(Value::Null);
                json!({"path": path, "value": value, "steps": steps})
            })
            .collect();
        json!({ "paths": paths })
    }
}

fn runtime_writes(runtime: &RuntimeSpec) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    let patch = serde_json::to_value(&runtime.step_settings_patch).unwrap_or(Value::Null);
    for write in leaf_writes("/runtime/step_settings_patch", &patch) {
        out.push((write.path, write.value));
    }
    if !runtime.system_prompt.trim().is_empty() {
        out.push((
            "/runtime/system_prompt".to_string(),
            Value::String(runtime.system_prompt.clone()),
        ));
    }
    if let Some(tools) = &runtime.tools {
        out.push(("/runtime/tools".to_string(), json!(tools)));
    }
    for (index, mw) in runtime.middlewares.iter().enumerate() {
        let key = middleware_merge_key(mw, index);
        let value = serde_json::to_value(mw).unwrap_or(Value::Null);
        out.push((format!("/runtime/middlewares/{}", escape_token(&key)), value));
    }
    out
}

fn extension_writes(extensions: &BTreeMap<String, Value>) -> Vec<(String, Value)> {
    extensions
        .iter()
        .flat_map(|(key, value)| leaf_writes(&child("/extensions", key), value))
        .map(|w| (w.path, w.value))
        .collect()
}

fn policy_writes(policy: &PolicySpec) -> Vec<(String, Value)> {
    vec![
        ("/policy/allow_overrides".to_string(), json!(policy.allow_overrides)),
        ("/policy/read_only".to_string(), json!(policy.read_only)),
        (
            "/policy/allowed_override_keys".to_string(),
            json!(policy.allowed_override_keys),
        ),
        (
            "/policy/denied_override_keys".to_string(),
            json!(policy.denied_override_keys),
        ),
    ]
}
