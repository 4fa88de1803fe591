//! Building middleware chains from resolved instances.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use super::definition::{BuildContext, BuildDeps, Definition, DefinitionRegistry};
use super::resolver::{ResolvedMiddlewareConfig, Resolver};
use super::schema::schema_defaults_object;
use super::source::{Source, UseConfigSource};
use super::{Chain, Middleware, MiddlewareConfigError};
use crate::profile::MiddlewareUse;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("build middleware {key}: definition is nil")]
    MissingDefinition { key: String },

    #[error("build middleware {key}: definition returned nil middleware")]
    NoMiddleware { key: String },

    #[error("build middleware {key}: {reason}")]
    Build { key: String, reason: String },

    #[error("resolve middleware {key}: {source}")]
    Resolve {
        key: String,
        #[source]
        source: MiddlewareConfigError,
    },
}

/// One middleware use bound to its definition and resolved config.
#[derive(Clone)]
pub struct ResolvedInstance {
    /// Explicit diagnostic key; derived from the use when absent
    pub key: Option<String>,
    pub middleware_use: MiddlewareUse,
    pub resolved: Option<ResolvedMiddlewareConfig>,
    pub definition: Option<Arc<dyn Definition>>,
}

impl ResolvedInstance {
    pub fn new(
        middleware_use: MiddlewareUse,
        definition: Arc<dyn Definition>,
        resolved: ResolvedMiddlewareConfig,
    ) -> Self {
        Self {
            key: None,
            middleware_use,
            resolved: Some(resolved),
            definition: Some(definition),
        }
    }

    /// Explicit key if set and non-blank, else `name#id`, else `name[index]`.
    pub fn instance_key(&self, index: usize) -> String {
        match self.key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => self.middleware_use.instance_key(index),
        }
    }
}

impl std::fmt::Debug for ResolvedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedInstance")
            .field("key", &self.key)
            .field("middleware_use", &self.middleware_use)
            .field("has_definition", &self.definition.is_some())
            .finish()
    }
}

/// Build enabled instances in input order. Disabled uses are skipped.
///
/// An instance without a resolved config is built from its schema defaults,
/// so builders always receive an object.
pub fn build_chain(
    ctx: &BuildContext,
    deps: &BuildDeps,
    instances: &[ResolvedInstance],
) -> Result<Vec<Arc<dyn Middleware>>, ChainError> {
    let mut chain = Vec::with_capacity(instances.len());
    for (index, instance) in instances.iter().enumerate() {
        if !instance.middleware_use.is_enabled() {
            continue;
        }
        let key = instance.instance_key(index);
        let definition = instance
            .definition
            .as_ref()
            .ok_or_else(|| ChainError::MissingDefinition { key: key.clone() })?;

        let config = match &instance.resolved {
            Some(resolved) => resolved.config.clone(),
            None => schema_defaults_object(&definition.config_json_schema()).unwrap_or_default(),
        };

        let middleware = definition
            .build(ctx, deps.clone(), Value::Object(config))
            .map_err(|e| {
                tracing::warn!(middleware = %key, error = %e, "Middleware build failed");
                ChainError::Build {
                    key: key.clone(),
                    reason: format!("{:#}", e),
                }
            })?
            .ok_or(ChainError::NoMiddleware { key })?;
        chain.push(middleware);
    }
    Ok(chain)
}

/// Convenience over [`build_chain`] returning a [`Chain`].
pub fn build(
    ctx: &BuildContext,
    deps: &BuildDeps,
    instances: &[ResolvedInstance],
) -> Result<Chain, ChainError> {
    build_chain(ctx, deps, instances).map(Chain::new)
}

/// Resolve every use of a runtime against `definitions`.
///
/// Each use gets its own inline config as a profile-layer source, followed
/// by `extra_sources`. Disabled uses are carried through unresolved so that
/// positional keys stay stable.
pub fn resolve_instances(
    definitions: &dyn DefinitionRegistry,
    uses: &[MiddlewareUse],
    extra_sources: &[Arc<dyn Source>],
) -> Result<Vec<ResolvedInstance>, ChainError> {
    let mut out = Vec::with_capacity(uses.len());
    for (index, middleware_use) in uses.iter().enumerate() {
        let key = middleware_use.instance_key(index);
        let definition = definitions.get(&middleware_use.name);
        if !middleware_use.is_enabled() {
            out.push(ResolvedInstance {
                key: Some(key),
                middleware_use: middleware_use.clone(),
                resolved: None,
                definition,
            });
            continue;
        }
        let definition = definition.ok_or_else(|| ChainError::Resolve {
            key: key.clone(),
            source: MiddlewareConfigError::UnknownDefinition(middleware_use.name.trim().to_string()),
        })?;

        let mut sources: Vec<Arc<dyn Source>> = vec![Arc::new(UseConfigSource::new())];
        sources.extend(extra_sources.iter().cloned());
        let resolved = Resolver::new(sources)
            .resolve(definition.as_ref(), middleware_use)
            .map_err(|source| ChainError::Resolve {
                key: key.clone(),
                source,
            })?;

        out.push(ResolvedInstance {
            key: Some(key),
            middleware_use: middleware_use.clone(),
            resolved: Some(resolved),
            definition: Some(definition),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::definition::InMemoryDefinitionRegistry;
    use serde_json::json;

    struct Named(String);

    impl Middleware for Named {
        fn name(&self) -> &str {
            &self.0
        }

        fn handle(&self, _: &mut Value) -> anyhow::Result<()> {
            Ok(())
        }
    }

    enum Behavior {
        Build,
        ReturnNone,
        Fail,
    }

    struct Def {
        name: &'static str,
        behavior: Behavior,
    }

    impl Definition for Def {
        fn name(&self) -> &str {
            self.name
        }

        fn config_json_schema(&self) -> Value {
            json!({"type": "object", "properties": {"label": {"type": "string"}}})
        }

        fn build(&self, _: &BuildContext, deps: BuildDeps, config: Value) -> anyhow::Result<Option<Arc<dyn Middleware>>> {
            match self.behavior {
                Behavior::Build => {
                    let suffix = deps.get::<String>("suffix").map(|s| s.to_string()).unwrap_or_default();
                    let label = config["label"].as_str().unwrap_or(self.name).to_string();
                    Ok(Some(Arc::new(Named(format!("{}{}", label, suffix)))))
                }
                Behavior::ReturnNone => Ok(None),
                Behavior::Fail => anyhow::bail!("bad config"),
            }
        }
    }

    fn instance(name: &'static str, behavior: Behavior, mw: MiddlewareUse) -> ResolvedInstance {
        let def: Arc<dyn Definition> = Arc::new(Def { name, behavior });
        let resolved = Resolver::default().resolve(def.as_ref(), &mw).unwrap();
        ResolvedInstance::new(mw, def, resolved)
    }

    #[test]
    fn test_build_preserves_order_and_skips_disabled() {
        let instances = vec![
            instance("a", Behavior::Build, MiddlewareUse::new("a").with_id("first")),
            instance("b", Behavior::Fail, MiddlewareUse::new("b").with_id("skip").with_enabled(false)),
            instance("c", Behavior::Build, MiddlewareUse::new("c").with_id("third")),
        ];
        let deps = BuildDeps::new().with("suffix", "!".to_string());
        let chain = build(&BuildContext::default(), &deps, &instances).unwrap();
        assert_eq!(chain.names(), vec!["a!", "c!"]);
    }

    #[test]
    fn test_build_errors_name_instance() {
        let ctx = BuildContext::default();
        let deps = BuildDeps::new();

        let failing = vec![instance("a", Behavior::Fail, MiddlewareUse::new("a"))];
        assert_eq!(
            build_chain(&ctx, &deps, &failing).err().unwrap().to_string(),
            "build middleware a[0]: bad config"
        );

        let none = vec![instance("a", Behavior::ReturnNone, MiddlewareUse::new("a").with_id("x"))];
        assert_eq!(
            build_chain(&ctx, &deps, &none).err().unwrap().to_string(),
            "build middleware a#x: definition returned nil middleware"
        );

        let missing = vec![ResolvedInstance {
            key: Some("custom".into()),
            middleware_use: MiddlewareUse::new("a"),
            resolved: None,
            definition: None,
        }];
        assert_eq!(
            build_chain(&ctx, &deps, &missing).err().unwrap().to_string(),
            "build middleware custom: definition is nil"
        );
    }

    struct Labelled;

    impl Definition for Labelled {
        fn name(&self) -> &str {
            "labelled"
        }

        fn config_json_schema(&self) -> Value {
            json!({"type": "object", "properties": {"label": {"type": "string", "default": "plain"}}})
        }

        fn build(&self, _: &BuildContext, _: BuildDeps, config: Value) -> anyhow::Result<Option<Arc<dyn Middleware>>> {
            let label = config
                .get("label")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("config has no label: {}", config))?;
            Ok(Some(Arc::new(Named(label.to_string()))))
        }
    }

    #[test]
    fn test_unresolved_instance_builds_from_schema_defaults() {
        let unresolved = vec![
            ResolvedInstance {
                key: None,
                middleware_use: MiddlewareUse::new("labelled"),
                resolved: None,
                definition: Some(Arc::new(Labelled)),
            },
            ResolvedInstance {
                key: None,
                middleware_use: MiddlewareUse::new("a"),
                resolved: None,
                definition: Some(Arc::new(Def { name: "a", behavior: Behavior::Build })),
            },
        ];
        let chain = build(&BuildContext::default(), &BuildDeps::new(), &unresolved).unwrap();
        assert_eq!(chain.names(), vec!["plain", "a"]);
    }

    #[test]
    fn test_resolve_instances_from_uses() {
        let registry = InMemoryDefinitionRegistry::new();
        registry
            .register(Arc::new(Def { name: "a", behavior: Behavior::Build }))
            .unwrap();

        let uses = vec![
            MiddlewareUse::new("a").with_config(json!({"label": "tagged"})),
            MiddlewareUse::new("ghost").with_enabled(false),
        ];
        let instances = resolve_instances(&registry, &uses, &[]).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].key.as_deref(), Some("a[0]"));
        assert!(instances[1].resolved.is_none());

        let chain = build(&BuildContext::default(), &BuildDeps::new(), &instances).unwrap();
        assert_eq!(chain.names(), vec!["tagged"]);

        let err = resolve_instances(&registry, &[MiddlewareUse::new("ghost")], &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "resolve middleware ghost[0]: unknown middleware definition: ghost"
        );
    }
}
