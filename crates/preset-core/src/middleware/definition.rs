//! Middleware definitions and the registry that holds them.

use parking_lot::RwLock;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Middleware, MiddlewareConfigError};

/// Context handed to [`Definition::build`].
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Runtime key of the resolved profile, when building for one
    pub runtime_key: Option<String>,
    /// Free-form values, e.g. resolved profile metadata
    pub metadata: BTreeMap<String, Value>,
}

/// Shared dependencies made available to builders.
///
/// Cloning copies the map and shares the values.
#[derive(Clone, Default)]
pub struct BuildDeps {
    values: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
}

impl BuildDeps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    /// Typed lookup; `None` when absent or of another type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for BuildDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildDeps").field("keys", &self.keys()).finish()
    }
}

/// A named middleware kind with a config schema and a builder.
pub trait Definition: Send + Sync {
    fn name(&self) -> &str;

    /// JSON Schema for the config payload. An empty object means "any object".
    fn config_json_schema(&self) -> Value;

    /// Build an instance from resolved config. `Ok(None)` is reported as an
    /// error by the chain builder.
    fn build(
        &self,
        ctx: &BuildContext,
        deps: BuildDeps,
        config: Value,
    ) -> anyhow::Result<Option<Arc<dyn Middleware>>>;
}

/// Registration and lookup of definitions.
pub trait DefinitionRegistry: Send + Sync {
    fn register(&self, definition: Arc<dyn Definition>) -> Result<(), MiddlewareConfigError>;

    fn get(&self, name: &str) -> Option<Arc<dyn Definition>>;

    /// All definitions, sorted by name.
    fn list(&self) -> Vec<Arc<dyn Definition>>;
}

/// Definitions keyed by trimmed name, guarded by a read-write lock.
#[derive(Default)]
pub struct InMemoryDefinitionRegistry {
    definitions: RwLock<BTreeMap<String, Arc<dyn Definition>>>,
}

impl InMemoryDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions.read().keys().cloned().collect()
    }
}

impl DefinitionRegistry for InMemoryDefinitionRegistry {
    fn register(&self, definition: Arc<dyn Definition>) -> Result<(), MiddlewareConfigError> {
        let name = definition.name().trim().to_string();
        if name.is_empty() {
            return Err(MiddlewareConfigError::EmptyDefinitionName);
        }

        let schema = definition.config_json_schema();
        let is_empty = schema.as_object().map_or(schema.is_null(), |o| o.is_empty());
        if !is_empty {
            jsonschema::validator_for(&schema).map_err(|e| MiddlewareConfigError::InvalidSchema {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        }

        let mut definitions = self.definitions.write();
        if definitions.contains_key(&name) {
            return Err(MiddlewareConfigError::AlreadyRegistered(name));
        }
        definitions.insert(name, definition);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Definition>> {
        let key = name.trim();
        if key.is_empty() {
            return None;
        }
        self.definitions.read().get(key).cloned()
    }

    fn list(&self) -> Vec<Arc<dyn Definition>> {
        self.definitions.read().values().cloned().collect()
    }
}

impl std::fmt::Debug for InMemoryDefinitionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDefinitionRegistry")
            .field("definitions", &self.names())
            .finish()
    }
}
