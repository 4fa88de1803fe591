//! Request overrides: per-call changes to a merged runtime.
//!
//! Keys are canonicalized (`systemPrompt`, `system-prompt` and
//! `system_prompt` are the same key), checked against the merged
//! [`PolicySpec`], then applied:
//!
//! | key                   | effect                                   |
//! |-----------------------|------------------------------------------|
//! | `system_prompt`       | replaces the prompt                      |
//! | `middlewares`         | replaces the middleware sequence         |
//! | `tools`               | replaces the tool list (`[]` clears it)  |
//! | `step_settings_patch` | overlays section/field values            |

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ProfileError, Result};
use crate::profile::{MiddlewareUse, PolicySpec, RuntimeSpec, StepSettingsPatch};
use crate::stack::merge::merge_step_settings_patches;

pub const KEY_SYSTEM_PROMPT: &str = "system_prompt";
pub const KEY_MIDDLEWARES: &str = "middlewares";
pub const KEY_TOOLS: &str = "tools";
pub const KEY_STEP_SETTINGS_PATCH: &str = "step_settings_patch";

const FIELD: &str = "request_overrides";

/// Canonical spelling of an override key. Blank input yields `""`.
pub fn canonical_override_key(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut out = String::with_capacity(trimmed.len() + 4);
    for (i, c) in trimmed.chars().enumerate() {
        if i > 0 && c.is_ascii_uppercase() {
            out.push('_');
        }
        out.push(c);
    }
    out.to_lowercase().replace('-', "_")
}

/// Canonicalize keys, rejecting blanks and spellings that collide.
pub fn normalize_override_map(overrides: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for (raw, value) in overrides {
        let key = canonical_override_key(raw);
        if key.is_empty() {
            return Err(ProfileError::validation(FIELD, "override keys must not be empty"));
        }
        if out.insert(key.clone(), value.clone()).is_some() {
            return Err(ProfileError::validation(
                FIELD,
                format!("duplicate override key \"{}\"", key),
            ));
        }
    }
    Ok(out)
}

/// Check canonical override keys against a merged policy.
pub fn enforce_override_policy(policy: &PolicySpec, keys: &BTreeSet<String>) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    if !policy.allow_overrides {
        return Err(ProfileError::policy(
            "request overrides are disabled for this profile",
        ));
    }

    let allowed: BTreeSet<String> = policy
        .allowed_override_keys
        .iter()
        .map(|k| canonical_override_key(k))
        .collect();
    let denied: BTreeSet<String> = policy
        .denied_override_keys
        .iter()
        .map(|k| canonical_override_key(k))
        .collect();

    for key in keys {
        if denied.contains(key) {
            return Err(ProfileError::policy(format!("override key \"{}\" is denied", key)));
        }
        if !allowed.is_empty() && !allowed.contains(key) {
            return Err(ProfileError::policy(format!(
                "override key \"{}\" is not allowed",
                key
            )));
        }
    }
    Ok(())
}

/// Apply `overrides` to a copy of `base` under `policy`.
///
/// With no overrides the result is an unchanged copy, whatever the policy.
pub fn apply_request_overrides(
    base: &RuntimeSpec,
    policy: &PolicySpec,
    overrides: &BTreeMap<String, Value>,
) -> Result<RuntimeSpec> {
    let mut ret = base.clone();
    if overrides.is_empty() {
        return Ok(ret);
    }

    let normalized = normalize_override_map(overrides)?;
    enforce_override_policy(policy, &normalized.keys().cloned().collect())?;

    for (key, value) in &normalized {
        match key.as_str() {
            KEY_SYSTEM_PROMPT => {
                let prompt = value.as_str().ok_or_else(|| {
                    ProfileError::validation(format!("{}.system_prompt", FIELD), "must be a string")
                })?;
                ret.system_prompt = prompt.to_string();
            }
            KEY_MIDDLEWARES => ret.middlewares = parse_middlewares(value)?,
            KEY_TOOLS => ret.tools = Some(parse_tools(value)?),
            KEY_STEP_SETTINGS_PATCH => {
                let overlay = parse_step_settings_patch(value)?;
                ret.step_settings_patch = merge_step_settings_patches(&ret.step_settings_patch, &overlay);
            }
            other => {
                return Err(ProfileError::validation(
                    format!("{}.{}", FIELD, other),
                    "unsupported override key",
                ))
            }
        }
    }
    Ok(ret)
}

fn parse_middlewares(value: &Value) -> Result<Vec<MiddlewareUse>> {
    let items = value.as_array().ok_or_else(|| {
        ProfileError::validation(format!("{}.middlewares", FIELD), "must be an array")
    })?;

    let mut seen_ids = BTreeSet::new();
    let mut ret = Vec::with_capacity(items.len());
    for (i, raw) in items.iter().enumerate() {
        let field = format!("{}.middlewares[{}]", FIELD, i);
        let obj = raw
            .as_object()
            .ok_or_else(|| ProfileError::validation(&field, "must be an object"))?;

        let name = obj.get("name").and_then(Value::as_str).map(str::trim).unwrap_or("");
        if name.is_empty() {
            return Err(ProfileError::validation(format!("{}.name", field), "must not be empty"));
        }

        let mut mw = MiddlewareUse::new(name);
        if let Some(id) = obj.get("id").and_then(Value::as_str).map(str::trim) {
            if !id.is_empty() {
                if !seen_ids.insert(id.to_string()) {
                    return Err(ProfileError::validation(
                        format!("{}.id", field),
                        format!("duplicate middleware id \"{}\"", id),
                    ));
                }
                mw.id = Some(id.to_string());
            }
        }
        mw.enabled = obj.get("enabled").and_then(Value::as_bool);
        mw.config = obj.get("config").filter(|c| !c.is_null()).cloned();
        ret.push(mw);
    }
    Ok(ret)
}

fn parse_tools(value: &Value) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| ProfileError::validation(format!("{}.tools", FIELD), "must be an array"))?;

    items
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let field = format!("{}.tools[{}]", FIELD, i);
            let tool = raw
                .as_str()
                .ok_or_else(|| ProfileError::validation(&field, "must be a string"))?
                .trim();
            if tool.is_empty() {
                return Err(ProfileError::validation(&field, "must not be empty"));
            }
            Ok(tool.to_string())
        })
        .collect()
}

fn parse_step_settings_patch(value: &Value) -> Result<StepSettingsPatch> {
    let sections: &Map<String, Value> = value.as_object().ok_or_else(|| {
        ProfileError::validation(format!("{}.step_settings_patch", FIELD), "must be an object")
    })?;

    let mut out = StepSettingsPatch::new();
    for (section, raw) in sections {
        let fields = raw.as_object().ok_or_else(|| {
            ProfileError::validation(
                format!("{}.step_settings_patch.{}", FIELD, section),
                "must be an object",
            )
        })?;
        out.insert(
            section.clone(),
            fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
    }
    Ok(out)
}
