//! Field-level merge of base→leaf stack layers.
//!
//! Runtime rules:
//! - `step_settings_patch`: per `<section, field>` overlay, last writer wins
//! - `system_prompt`: last non-blank value wins
//! - `tools`: any layer that sets a list replaces the previous one
//! - `middlewares`: keyed by `name#id` (or `name[i]` within the layer);
//!   colliding keys replace in place, new keys append
//!
//! Extensions deep-merge object into object and replace otherwise. Policy is
//! merged restrictively so a leaf can only tighten what it inherits.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::trace::ProfileStackTrace;
use super::ProfileStackLayer;
use crate::overrides::canonical_override_key;
use crate::profile::{MiddlewareUse, PolicySpec, RuntimeSpec, StepSettingsPatch};

/// Merged view of a stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackMergeResult {
    pub runtime: RuntimeSpec,
    pub policy: PolicySpec,
    pub extensions: BTreeMap<String, Value>,
}

/// Merge layers in order. An empty input yields an empty runtime and the
/// default policy.
pub fn merge_profile_stack_layers(layers: &[ProfileStackLayer]) -> StackMergeResult {
    let mut result = StackMergeResult::default();
    let mut policies = Vec::with_capacity(layers.len());

    for layer in layers {
        let runtime = &layer.profile.runtime;

        result.runtime.step_settings_patch =
            merge_step_settings_patches(&result.runtime.step_settings_patch, &runtime.step_settings_patch);

        if !runtime.system_prompt.trim().is_empty() {
            result.runtime.system_prompt = runtime.system_prompt.clone();
        }
        if let Some(tools) = &runtime.tools {
            result.runtime.tools = Some(tools.clone());
        }
        if !runtime.middlewares.is_empty() {
            result.runtime.middlewares =
                merge_middleware_layers(&result.runtime.middlewares, &runtime.middlewares);
        }

        for (key, value) in &layer.profile.extensions {
            let next = match result.extensions.remove(key) {
                Some(existing) => merge_extension_value(existing, value),
                None => value.clone(),
            };
            result.extensions.insert(key.clone(), next);
        }

        policies.push(&layer.profile.policy);
    }

    result.policy = merge_policy_layers_restrictive(&policies);
    result
}

/// Merge and also build the per-path trace.
pub fn merge_profile_stack_layers_with_trace(
    layers: &[ProfileStackLayer],
) -> (StackMergeResult, ProfileStackTrace) {
    let merged = merge_profile_stack_layers(layers);
    let trace = ProfileStackTrace::build(layers, &merged);
    (merged, trace)
}

/// Overlay `overlay` onto `base` one `<section, field>` at a time.
pub fn merge_step_settings_patches(
    base: &StepSettingsPatch,
    overlay: &StepSettingsPatch,
) -> StepSettingsPatch {
    let mut merged = base.clone();
    for (section, fields) in overlay {
        let target = merged.entry(section.clone()).or_default();
        for (field, value) in fields {
            target.insert(field.clone(), value.clone());
        }
    }
    merged
}

/// `name#id` when an id is set, else `name[index]`.
pub fn middleware_merge_key(mw: &MiddlewareUse, index: usize) -> String {
    mw.instance_key(index)
}

fn normalize_use(mw: &MiddlewareUse) -> MiddlewareUse {
    MiddlewareUse {
        name: mw.name.trim().to_string(),
        id: mw.trimmed_id().map(str::to_string),
        enabled: mw.enabled,
        config: mw.config.clone(),
    }
}

fn merge_middleware_layers(base: &[MiddlewareUse], overlay: &[MiddlewareUse]) -> Vec<MiddlewareUse> {
    let mut ret: Vec<MiddlewareUse> = base.iter().map(normalize_use).collect();
    let mut key_index: HashMap<String, usize> = ret
        .iter()
        .enumerate()
        .map(|(i, mw)| (middleware_merge_key(mw, i), i))
        .collect();

    for (i, mw) in overlay.iter().enumerate() {
        let next = normalize_use(mw);
        let key = middleware_merge_key(&next, i);
        match key_index.get(&key) {
            Some(&index) => ret[index] = next,
            None => {
                key_index.insert(key, ret.len());
                ret.push(next);
            }
        }
    }
    ret
}

/// Object into object merges recursively; anything else replaces.
pub fn merge_extension_value(base: Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let next = match base_map.remove(key) {
                    Some(existing) => merge_extension_value(existing, overlay_value),
                    None => overlay_value.clone(),
                };
                base_map.insert(key.clone(), next);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay.clone(),
    }
}

fn canonical_keys(keys: &[String]) -> BTreeSet<String> {
    keys.iter()
        .map(|k| canonical_override_key(k))
        .filter(|k| !k.is_empty())
        .collect()
}

/// Restrictive policy merge.
///
/// `allow_overrides` is AND-ed and `read_only` OR-ed across layers. Allow-lists
/// intersect across the layers that declare one; deny-lists union and are
/// removed from the allow-list. If every declared allow-list key ends up
/// removed, overrides are disabled outright: an empty allow-list would
/// otherwise read as "no restriction".
pub fn merge_policy_layers_restrictive(layers: &[&PolicySpec]) -> PolicySpec {
    if layers.is_empty() {
        return PolicySpec::default();
    }

    let mut result = PolicySpec {
        allow_overrides: true,
        ..Default::default()
    };
    let mut allowed: Option<BTreeSet<String>> = None;
    let mut denied: BTreeSet<String> = BTreeSet::new();

    for layer in layers {
        result.allow_overrides &= layer.allow_overrides;
        result.read_only |= layer.read_only;

        let layer_allowed = canonical_keys(&layer.allowed_override_keys);
        if !layer_allowed.is_empty() {
            allowed = Some(match allowed {
                None => layer_allowed,
                Some(current) => current.intersection(&layer_allowed).cloned().collect(),
            });
        }
        denied.extend(canonical_keys(&layer.denied_override_keys));
    }

    if let Some(mut allowed) = allowed {
        allowed.retain(|k| !denied.contains(k));
        if allowed.is_empty() {
            result.allow_overrides = false;
        }
        result.allowed_override_keys = allowed.into_iter().collect();
    }
    result.denied_override_keys = denied.into_iter().collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Profile;
    use crate::slug::{ProfileSlug, RegistrySlug};
    use proptest::prelude::*;
    use serde_json::json;

    fn layer(slug: &str, version: u64, edit: impl FnOnce(&mut Profile)) -> ProfileStackLayer {
        let mut profile = Profile::new(ProfileSlug::parse(slug).unwrap());
        profile.metadata.version = version;
        profile.metadata.source = "test".into();
        edit(&mut profile);
        ProfileStackLayer {
            registry_slug: RegistrySlug::parse("default").unwrap(),
            profile_slug: profile.slug.clone(),
            profile,
        }
    }

    fn patch(section: &str, field: &str, value: Value) -> StepSettingsPatch {
        BTreeMap::from([(section.to_string(), BTreeMap::from([(field.to_string(), value)]))])
    }

    #[test]
    fn test_empty_merge_is_default() {
        let merged = merge_profile_stack_layers(&[]);
        assert!(merged.runtime.is_empty());
        assert_eq!(merged.policy, PolicySpec::default());
        assert!(merged.extensions.is_empty());
    }

    #[test]
    fn test_single_layer_is_identity() {
        let l = layer("a", 1, |p| {
            p.runtime.step_settings_patch = patch("chat", "engine", json!("x"));
            p.runtime.system_prompt = "hello".into();
            p.runtime.tools = Some(vec!["t".into()]);
            p.runtime.middlewares = vec![MiddlewareUse::new("m").with_id("1")];
        });
        let merged = merge_profile_stack_layers(std::slice::from_ref(&l));
        assert_eq!(merged.runtime, l.profile.runtime);
    }

    #[test]
    fn test_runtime_rules() {
        let base = layer("base", 1, |p| {
            p.runtime.step_settings_patch = patch("chat", "engine", json!("a"));
            p.runtime.step_settings_patch.get_mut("chat").unwrap().insert("temperature".into(), json!(0.1));
            p.runtime.system_prompt = "base prompt".into();
            p.runtime.tools = Some(vec!["search".into(), "calc".into()]);
            p.runtime.middlewares = vec![
                MiddlewareUse::new("log"),
                MiddlewareUse::new("retry").with_id("r").with_config(json!({"n": 1})),
            ];
        });
        let leaf = layer("leaf", 2, |p| {
            p.runtime.step_settings_patch = patch("chat", "engine", json!("b"));
            p.runtime.system_prompt = "   ".into();
            p.runtime.tools = Some(vec![]);
            p.runtime.middlewares = vec![
                MiddlewareUse::new("retry").with_id("r").with_config(json!({"n": 5})),
                MiddlewareUse::new("cache"),
            ];
        });

        let merged = merge_profile_stack_layers(&[base, leaf]);
        let chat = &merged.runtime.step_settings_patch["chat"];
        assert_eq!(chat["engine"], json!("b"));
        assert_eq!(chat["temperature"], json!(0.1));
        assert_eq!(merged.runtime.system_prompt, "base prompt");
        assert_eq!(merged.runtime.tools, Some(vec![]));

        let keys: Vec<String> = merged
            .runtime
            .middlewares
            .iter()
            .enumerate()
            .map(|(i, m)| m.instance_key(i))
            .collect();
        // "cache[1]" in the leaf does not collide with "log[0]"
        assert_eq!(keys, vec!["log[0]", "retry#r", "cache[2]"]);
        assert_eq!(merged.runtime.middlewares[1].config, Some(json!({"n": 5})));
    }

    #[test]
    fn test_extension_merge() {
        let base = layer("base", 1, |p| {
            p.extensions.insert("app.cfg@v1".into(), json!({"a": {"x": 1, "y": 2}, "list": [1]}));
            p.extensions.insert("app.flag@v1".into(), json!(true));
        });
        let leaf = layer("leaf", 1, |p| {
            p.extensions.insert("app.cfg@v1".into(), json!({"a": {"y": 3}, "list": [2]}));
            p.extensions.insert("app.flag@v1".into(), json!({"on": true}));
        });
        let merged = merge_profile_stack_layers(&[base, leaf]);
        assert_eq!(
            merged.extensions["app.cfg@v1"],
            json!({"a": {"x": 1, "y": 3}, "list": [2]})
        );
        assert_eq!(merged.extensions["app.flag@v1"], json!({"on": true}));
    }

    #[test]
    fn test_policy_restrictive() {
        let a = PolicySpec {
            allow_overrides: true,
            allowed_override_keys: vec!["systemPrompt".into(), "tools".into(), "middlewares".into()],
            denied_override_keys: vec![],
            read_only: false,
        };
        let b = PolicySpec {
            allow_overrides: true,
            allowed_override_keys: vec!["system_prompt".into(), "tools".into()],
            denied_override_keys: vec!["tools".into()],
            read_only: true,
        };
        let c = PolicySpec {
            allow_overrides: true,
            ..Default::default()
        };
        let merged = merge_policy_layers_restrictive(&[&a, &b, &c]);
        assert!(merged.allow_overrides);
        assert!(merged.read_only);
        assert_eq!(merged.allowed_override_keys, vec!["system_prompt".to_string()]);
        assert_eq!(merged.denied_override_keys, vec!["tools".to_string()]);
    }

    #[test]
    fn test_policy_emptied_allow_list_disables_overrides() {
        let a = PolicySpec {
            allow_overrides: true,
            allowed_override_keys: vec!["tools".into()],
            ..Default::default()
        };
        let b = PolicySpec {
            allow_overrides: true,
            allowed_override_keys: vec!["system_prompt".into()],
            ..Default::default()
        };
        let merged = merge_policy_layers_restrictive(&[&a, &b]);
        assert!(!merged.allow_overrides);
        assert!(merged.allowed_override_keys.is_empty());

        // every layer allows overrides, yet a denied key empties the allow-list
        let c = PolicySpec {
            allow_overrides: true,
            denied_override_keys: vec!["tools".into()],
            ..Default::default()
        };
        let merged = merge_policy_layers_restrictive(&[&a, &c]);
        assert!(!merged.allow_overrides);
        assert!(merged.allowed_override_keys.is_empty());
        assert_eq!(merged.denied_override_keys, vec!["tools".to_string()]);

        // without allow-lists an all-true stack stays open
        let merged = merge_policy_layers_restrictive(&[&c, &c]);
        assert!(merged.allow_overrides);
    }

    #[test]
    fn test_trace_records_steps_and_final_values() {
        let base = layer("base", 3, |p| {
            p.runtime.system_prompt = "P".into();
            p.runtime.step_settings_patch = patch("chat", "engine", json!("a"));
            p.extensions.insert("app.cfg@v1".into(), json!({"k": 1}));
        });
        let leaf = layer("leaf", 7, |p| {
            p.runtime.system_prompt = "L".into();
            p.runtime.middlewares = vec![MiddlewareUse::new("a/b").with_id("x")];
        });
        let (merged, trace) = merge_profile_stack_layers_with_trace(&[base, leaf]);

        let history = trace.history("/runtime/system_prompt");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].profile_slug.as_str(), "base");
        assert_eq!(history[0].profile_version, 3);
        assert_eq!(history[1].layer_index, 1);
        assert_eq!(history[1].profile_source, "test");
        assert_eq!(trace.latest_value("/runtime/system_prompt"), Some(json!("L")));
        assert_eq!(merged.runtime.system_prompt, "L");

        assert!(trace
            .ordered_paths()
            .contains(&"/runtime/middlewares/a~1b#x".to_string()));
        assert_eq!(
            trace.latest_value("/runtime/step_settings_patch/chat/engine"),
            Some(json!("a"))
        );
        assert_eq!(trace.latest_value("/extensions/app.cfg@v1/k"), Some(json!(1)));
        assert_eq!(trace.latest_value("/policy/allow_overrides"), Some(json!(false)));

        let mut sorted = trace.ordered_paths().to_vec();
        sorted.sort();
        assert_eq!(sorted, trace.ordered_paths());

        let payload = trace.debug_payload();
        let paths = payload["paths"].as_array().unwrap();
        assert_eq!(paths.len(), trace.ordered_paths().len());
        assert!(paths.iter().all(|p| p.get("steps").is_some()));
    }

    fn arb_policy() -> impl Strategy<Value = PolicySpec> {
        let keys = prop::sample::subsequence(vec!["system_prompt", "tools", "middlewares"], 0..=3);
        (any::<bool>(), any::<bool>(), keys.clone(), keys).prop_map(
            |(allow, read_only, allowed, denied)| PolicySpec {
                allow_overrides: allow,
                read_only,
                allowed_override_keys: allowed.into_iter().map(String::from).collect(),
                denied_override_keys: denied.into_iter().map(String::from).collect(),
            },
        )
    }

    proptest! {
        #[test]
        fn prop_policy_merge_is_restrictive(policies in prop::collection::vec(arb_policy(), 1..5)) {
            let refs: Vec<&PolicySpec> = policies.iter().collect();
            let merged = merge_policy_layers_restrictive(&refs);

            if policies.iter().any(|p| !p.allow_overrides) {
                prop_assert!(!merged.allow_overrides);
            }
            prop_assert_eq!(merged.read_only, policies.iter().any(|p| p.read_only));
            for p in &policies {
                for key in &p.denied_override_keys {
                    prop_assert!(merged.denied_override_keys.contains(key));
                    prop_assert!(!merged.allowed_override_keys.contains(key));
                }
                if !p.allowed_override_keys.is_empty() {
                    for key in &merged.allowed_override_keys {
                        prop_assert!(p.allowed_override_keys.contains(key));
                    }
                }
            }
        }
    }
}
