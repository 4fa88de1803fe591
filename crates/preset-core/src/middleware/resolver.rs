//! Layered config resolution for one middleware use.
//!
//! Sources are applied in canonical order (layer, then name, then input
//! position), after the schema's own defaults. Each payload is projected
//! onto the schema as sorted path writes; each write is coerced and stored,
//! and leaves a [`ParseStep`] in the path's trace. The assembled object is
//! coerced once more against the root schema, which catches root-level
//! `required` fields.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::definition::Definition;
use super::schema::{coerce_and_validate, project_writes, schema_defaults_object, schema_type};
use super::source::{canonical_order, Source, SourceLayer};
use super::MiddlewareConfigError;
use crate::pointer;
use crate::profile::MiddlewareUse;

const COMPONENT: &str = "middlewarecfg.resolver";

/// A source that contributed to a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSourceRef {
    pub name: String,
    pub layer: SourceLayer,
}

/// One write applied at one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseStep {
    pub source: String,
    pub layer: SourceLayer,
    pub path: String,
    pub raw: Value,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Write history of one path; `value` is the latest write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPathTrace {
    pub path: String,
    pub value: Value,
    pub steps: Vec<ParseStep>,
}

/// Validated config plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMiddlewareConfig {
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub path_values: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ordered_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ResolvedSourceRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace: BTreeMap<String, ConfigPathTrace>,
}

impl ResolvedMiddlewareConfig {
    /// Winning value at `path`.
    pub fn latest_value(&self, path: &str) -> Option<Value> {
        self.trace
            .get(path)
            .map(|t| t.value.clone())
            .or_else(|| self.path_values.get(path).cloned())
    }

    pub fn history(&self, path: &str) -> Vec<ParseStep> {
        self.trace.get(path).map(|t| t.steps.clone()).unwrap_or_default()
    }

    /// Stable debug form: `{config, sources, paths: [{path, value, steps}]}`.
    pub fn debug_payload(&self) -> Value {
        let paths: Vec<Value> = self
            .ordered_paths
            .iter()
            .map(|path| {
                json!({
                    "path": path,
                    "value": self.latest_value(path).unwrap_or(Value::Null),
                    "steps": self.history(path),
                })
            })
            .collect();
        json!({
            "config": self.config,
            "sources": self.sources,
            "paths": paths,
        })
    }
}

/// Resolves middleware config from an ordered set of sources.
#[derive(Clone, Default)]
pub struct Resolver {
    sources: Vec<Arc<dyn Source>>,
}

impl Resolver {
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self { sources }
    }

    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    /// Resolve the config of `middleware_use` against `definition`'s schema.
    pub fn resolve(
        &self,
        definition: &dyn Definition,
        middleware_use: &MiddlewareUse,
    ) -> Result<ResolvedMiddlewareConfig, MiddlewareConfigError> {
        let definition_name = definition.name().trim();
        if definition_name.is_empty() {
            return Err(MiddlewareConfigError::EmptyDefinitionName);
        }
        let use_name = middleware_use.name.trim();
        if use_name.is_empty() {
            return Err(MiddlewareConfigError::EmptyUseName);
        }
        if use_name != definition_name {
            return Err(MiddlewareConfigError::NameMismatch {
                use_name: use_name.to_string(),
                definition: definition_name.to_string(),
            });
        }
        let use_key = middleware_use.diagnostic_key();

        let mut schema = definition.config_json_schema();
        if schema.as_object().map_or(true, Map::is_empty) {
            schema = json!({"type": "object"});
        }

        let ordered = canonical_order(&self.sources)?;
        let mut acc = Accumulator::default();

        if let Some(defaults) = schema_defaults_object(&schema) {
            let layer = SourceLayer::SchemaDefaults;
            acc.apply(&use_key, &schema, &defaults, layer.as_str(), layer)?;
        }

        for source in &ordered {
            let name = source.name().trim();
            let layer = source.layer();
            let payload = source.payload(definition, middleware_use).map_err(|e| {
                log_reject(&use_key, name, layer, None, &format!("{:#}", e));
                MiddlewareConfigError::Source {
                    use_key: use_key.clone(),
                    source_name: name.to_string(),
                    layer,
                    reason: format!("{:#}", e),
                }
            })?;
            match payload {
                Some(payload) if !payload.is_empty() => {
                    acc.apply(&use_key, &schema, &payload, name, layer)?;
                }
                _ => continue,
            }
        }

        let config = match coerce_and_validate(&schema, &acc.state) {
            Ok(Value::Object(config)) => config,
            Ok(_) => {
                return Err(MiddlewareConfigError::Final {
                    use_key,
                    reason: "config must resolve to an object".into(),
                })
            }
            Err(e) => {
                tracing::warn!(component = COMPONENT, middleware_use = %use_key, error = %e, "Middleware config rejected");
                return Err(MiddlewareConfigError::Final {
                    use_key,
                    reason: e.to_string(),
                });
            }
        };

        let ordered_paths = acc.path_values.keys().cloned().collect();
        tracing::debug!(
            component = COMPONENT,
            middleware_use = %use_key,
            sources = acc.sources.len(),
            "Resolved middleware config"
        );

        Ok(ResolvedMiddlewareConfig {
            config,
            path_values: acc.path_values,
            ordered_paths,
            sources: acc.sources,
            trace: acc.trace,
        })
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .sources
            .iter()
            .map(|s| format!("{}[{}]", s.name(), s.layer()))
            .collect();
        f.debug_struct("Resolver").field("sources", &names).finish()
    }
}

struct Accumulator {
    state: Value,
    path_values: BTreeMap<String, Value>,
    trace: BTreeMap<String, ConfigPathTrace>,
    sources: Vec<ResolvedSourceRef>,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            state: Value::Object(Map::new()),
            path_values: BTreeMap::new(),
            trace: BTreeMap::new(),
            sources: Vec::new(),
        }
    }
}

impl Accumulator {
    fn apply(
        &mut self,
        use_key: &str,
        schema: &Value,
        payload: &Map<String, Value>,
        source_name: &str,
        layer: SourceLayer,
    ) -> Result<(), MiddlewareConfigError> {
        let writes = project_writes(schema, payload).map_err(|e| {
            log_reject(use_key, source_name, layer, None, &e.to_string());
            MiddlewareConfigError::Projection {
                use_key: use_key.to_string(),
                source_name: source_name.to_string(),
                layer,
                reason: e.to_string(),
            }
        })?;

        for write in writes {
            let value = coerce_and_validate(&write.schema, &write.raw).map_err(|e| {
                log_reject(use_key, source_name, layer, Some(&write.path), &e.to_string());
                MiddlewareConfigError::Coercion {
                    use_key: use_key.to_string(),
                    path: write.path.clone(),
                    source_name: source_name.to_string(),
                    layer,
                    reason: e.to_string(),
                }
            })?;

            pointer::set(&mut self.state, &write.path, value.clone());
            self.forget_overwritten(&write.path);
            self.path_values.insert(write.path.clone(), value.clone());

            let mut metadata = Map::new();
            metadata.insert("schema_type".into(), json!(schema_type(&write.schema)));
            let entry = self
                .trace
                .entry(write.path.clone())
                .or_insert_with(|| ConfigPathTrace {
                    path: write.path.clone(),
                    value: Value::Null,
                    steps: Vec::new(),
                });
            entry.value = value.clone();
            entry.steps.push(ParseStep {
                source: source_name.to_string(),
                layer,
                path: write.path,
                raw: write.raw,
                value,
                metadata,
            });
        }

        self.sources.push(ResolvedSourceRef {
            name: source_name.to_string(),
            layer,
        });
        Ok(())
    }

    /// Drop recorded paths that a write at `path` replaced: everything below
    /// it, and any ancestor recorded as a whole value.
    fn forget_overwritten(&mut self, path: &str) {
        let below = format!("{}/", path);
        let stale = |recorded: &String| {
            recorded.starts_with(&below) || path.starts_with(&format!("{}/", recorded))
        };
        self.path_values.retain(|recorded, _| !stale(recorded));
        self.trace.retain(|recorded, _| !stale(recorded));
    }
}

fn log_reject(use_key: &str, source: &str, layer: SourceLayer, path: Option<&str>, error: &str) {
    tracing::warn!(
        component = COMPONENT,
        middleware_use = %use_key,
        source = %source,
        layer = %layer,
        path = path.unwrap_or(""),
        error = %error,
        "Middleware source payload rejected"
    );
}
