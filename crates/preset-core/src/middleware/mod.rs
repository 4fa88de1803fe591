//! Middleware configuration and chain assembly.
//!
//! A [`Definition`] names a middleware, declares a JSON Schema for its
//! configuration and builds [`Middleware`] instances. Configuration for one
//! [`MiddlewareUse`](crate::profile::MiddlewareUse) is assembled from layered
//! [`Source`]s by the [`Resolver`], which projects each payload onto the
//! schema, coerces values and records where every path came from.
//! [`build_chain`] then turns resolved instances into an ordered [`Chain`].

pub mod chain;
pub mod definition;
pub mod resolver;
pub mod schema;
pub mod source;

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub use chain::{build_chain, resolve_instances, ChainError, ResolvedInstance};
pub use definition::{BuildContext, BuildDeps, Definition, DefinitionRegistry, InMemoryDefinitionRegistry};
pub use resolver::{ConfigPathTrace, ParseStep, ResolvedMiddlewareConfig, ResolvedSourceRef, Resolver};
pub use schema::CoercionError;
pub use source::{FnSource, Source, SourceLayer, StaticSource, UseConfigSource};

/// Errors from definition registration and config resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MiddlewareConfigError {
    #[error("middleware definition name is empty")]
    EmptyDefinitionName,

    #[error("middleware definition already registered: {0}")]
    AlreadyRegistered(String),

    #[error("middleware definition {name} has an invalid config schema: {reason}")]
    InvalidSchema { name: String, reason: String },

    #[error("unknown middleware definition: {0}")]
    UnknownDefinition(String),

    #[error("middleware use name is empty")]
    EmptyUseName,

    #[error("middleware use name \"{use_name}\" does not match definition \"{definition}\"")]
    NameMismatch { use_name: String, definition: String },

    #[error("unsupported middleware config source layer \"{0}\"")]
    UnsupportedLayer(String),

    #[error("middleware config source name is empty")]
    EmptySourceName,

    #[error("resolve middleware {use_key} source {source_name}[{layer}]: {reason}")]
    Source {
        use_key: String,
        source_name: String,
        layer: SourceLayer,
        reason: String,
    },

    #[error("project middleware {use_key} payload from source {source_name}[{layer}]: {reason}")]
    Projection {
        use_key: String,
        source_name: String,
        layer: SourceLayer,
        reason: String,
    },

    #[error("coerce middleware {use_key} payload at {path} from source {source_name}[{layer}]: {reason}")]
    Coercion {
        use_key: String,
        path: String,
        source_name: String,
        layer: SourceLayer,
        reason: String,
    },

    #[error("final middleware {use_key} config validation failed: {reason}")]
    Final { use_key: String, reason: String },
}

/// A built middleware: transforms an inference request in place.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, request: &mut Value) -> anyhow::Result<()>;
}

/// Ordered middlewares applied first to last.
#[derive(Clone, Default)]
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Run every middleware over `request`, stopping at the first failure.
    pub fn apply(&self, request: &mut Value) -> anyhow::Result<()> {
        for middleware in &self.middlewares {
            middleware.handle(request).map_err(|e| {
                tracing::warn!(middleware = %middleware.name(), error = %e, "Middleware failed");
                e.context(format!("middleware {}", middleware.name()))
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").field("middlewares", &self.names()).finish()
    }
}
