//! Config sources and their precedence layers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::definition::Definition;
use super::MiddlewareConfigError;
use crate::profile::MiddlewareUse;

/// Precedence bucket for a source; later layers override earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceLayer {
    SchemaDefaults,
    Profile,
    ConfigFile,
    Environment,
    Flags,
    Request,
}

impl SourceLayer {
    pub const ALL: [SourceLayer; 6] = [
        SourceLayer::SchemaDefaults,
        SourceLayer::Profile,
        SourceLayer::ConfigFile,
        SourceLayer::Environment,
        SourceLayer::Flags,
        SourceLayer::Request,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceLayer::SchemaDefaults => "schema-defaults",
            SourceLayer::Profile => "profile",
            SourceLayer::ConfigFile => "config-file",
            SourceLayer::Environment => "environment",
            SourceLayer::Flags => "flags",
            SourceLayer::Request => "request",
        }
    }

    /// Position in the precedence order, lowest first.
    pub fn precedence(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for SourceLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceLayer {
    type Err = MiddlewareConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceLayer::ALL
            .into_iter()
            .find(|layer| layer.as_str() == s.trim())
            .ok_or_else(|| MiddlewareConfigError::UnsupportedLayer(s.to_string()))
    }
}

/// Supplies one layer of config for a middleware use. `Ok(None)` means the
/// source has nothing to say and is skipped.
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    fn layer(&self) -> SourceLayer;

    fn payload(
        &self,
        definition: &dyn Definition,
        middleware_use: &MiddlewareUse,
    ) -> anyhow::Result<Option<Map<String, Value>>>;
}

/// A fixed payload.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    layer: SourceLayer,
    payload: Map<String, Value>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, layer: SourceLayer, payload: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            layer,
            payload,
        }
    }

    /// Build from a JSON value; anything but an object yields an empty payload.
    pub fn from_value(name: impl Into<String>, layer: SourceLayer, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(name, layer, payload)
    }
}

impl Source for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer(&self) -> SourceLayer {
        self.layer
    }

    fn payload(&self, _: &dyn Definition, _: &MiddlewareUse) -> anyhow::Result<Option<Map<String, Value>>> {
        Ok(Some(self.payload.clone()))
    }
}

/// Reads the inline `config` of the use itself, at the profile layer.
#[derive(Debug, Clone)]
pub struct UseConfigSource {
    name: String,
}

impl UseConfigSource {
    pub fn new() -> Self {
        Self {
            name: "profile".to_string(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for UseConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for UseConfigSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer(&self) -> SourceLayer {
        SourceLayer::Profile
    }

    fn payload(
        &self,
        _: &dyn Definition,
        middleware_use: &MiddlewareUse,
    ) -> anyhow::Result<Option<Map<String, Value>>> {
        match &middleware_use.config {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map.clone())),
            Some(_) => anyhow::bail!("middleware config must be an object"),
        }
    }
}

type PayloadFn =
    dyn Fn(&dyn Definition, &MiddlewareUse) -> anyhow::Result<Option<Map<String, Value>>> + Send + Sync;

/// Closure-backed source.
#[derive(Clone)]
pub struct FnSource {
    name: String,
    layer: SourceLayer,
    f: Arc<PayloadFn>,
}

impl FnSource {
    pub fn new<F>(name: impl Into<String>, layer: SourceLayer, f: F) -> Self
    where
        F: Fn(&dyn Definition, &MiddlewareUse) -> anyhow::Result<Option<Map<String, Value>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            layer,
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for FnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSource")
            .field("name", &self.name)
            .field("layer", &self.layer)
            .finish()
    }
}

impl Source for FnSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer(&self) -> SourceLayer {
        self.layer
    }

    fn payload(
        &self,
        definition: &dyn Definition,
        middleware_use: &MiddlewareUse,
    ) -> anyhow::Result<Option<Map<String, Value>>> {
        (self.f)(definition, middleware_use)
    }
}

/// Sort sources by `(layer, trimmed name, input index)`, rejecting blank names.
pub(crate) fn canonical_order(
    sources: &[Arc<dyn Source>],
) -> Result<Vec<Arc<dyn Source>>, MiddlewareConfigError> {
    let mut indexed = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
        if source.name().trim().is_empty() {
            return Err(MiddlewareConfigError::EmptySourceName);
        }
        indexed.push((index, source.clone()));
    }
    indexed.sort_by(|(ia, a), (ib, b)| {
        a.layer()
            .cmp(&b.layer())
            .then_with(|| a.name().trim().cmp(b.name().trim()))
            .then_with(|| ia.cmp(ib))
    });
    Ok(indexed.into_iter().map(|(_, source)| source).collect())
}
