//! # preset-core
//!
//! Profile-driven runtime resolution and schema-first middleware
//! configuration for LLM inference.
//!
//! A caller names a profile (or relies on its registry's default); the
//! engine expands the profile's inheritance stack, merges the layers, applies
//! request overrides under the merged policy and hands back a
//! [`ResolvedProfile`] with a reproducible runtime fingerprint. Middleware
//! uses in that runtime are then configured from layered sources and built
//! into an ordered chain.
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: stack expansion, merging and config resolution
//!    depend only on their inputs
//! 2. **Traceable**: every merged field and every middleware config path
//!    records which layer or source wrote it
//! 3. **Restrictive inheritance**: a leaf profile can only tighten the
//!    override policy it inherits
//! 4. **Value semantics**: stores hand out clones; nothing returned aliases
//!    stored state
//!
//! ## Example
//!
//! ```rust,ignore
//! use preset_core::{decode_registry_yaml, InMemoryProfileStore, ResolveInput, StoreRegistry};
//!
//! let registry = decode_registry_yaml(&std::fs::read_to_string("profiles.yaml")?)?
//!     .expect("registry document");
//! let store = Arc::new(InMemoryProfileStore::with_registries([registry])?);
//! let service = StoreRegistry::new(store)?;
//!
//! let resolved = service.resolve_effective_profile(ResolveInput::default()).await?;
//! println!("{} -> {}", resolved.profile_slug, resolved.runtime_fingerprint);
//! ```

pub mod error;
pub mod extension;
pub mod fingerprint;
pub mod middleware;
pub mod overrides;
pub mod pointer;
pub mod profile;
pub mod registry;
pub mod slug;
pub mod stack;
pub mod store;

// Re-export main types at crate root
pub use error::{ProfileError, Result};
pub use extension::{
    normalize_profile_extensions, ExtensionCodec, ExtensionCodecRegistry, ExtensionError,
    ExtensionKey, InMemoryExtensionCodecRegistry, ProfileExtensionKey,
};
pub use fingerprint::{runtime_fingerprint, FingerprintInput, LineageEntry};
pub use middleware::{
    build_chain, resolve_instances, BuildContext, BuildDeps, Chain, ChainError, Definition,
    DefinitionRegistry, InMemoryDefinitionRegistry, Middleware, MiddlewareConfigError,
    ResolvedInstance, ResolvedMiddlewareConfig, Resolver, Source, SourceLayer,
};
pub use overrides::{apply_request_overrides, canonical_override_key};
pub use profile::{
    apply_step_settings_patch, decode_registry_yaml, encode_registry_yaml, validate_profile,
    validate_registry, MiddlewareUse, PolicySpec, Profile, ProfileMetadata, ProfileRef,
    ProfileRegistry, RegistrySummary, ResolvedProfile, RuntimeSpec, StepSettings,
    StepSettingsPatch,
};
pub use registry::{ProfilePatch, ResolveInput, StoreRegistry, WriteOptions};
pub use slug::{ProfileSlug, RegistrySlug, RuntimeKey, SlugError};
pub use stack::{
    expand_profile_stack, merge_profile_stack_layers, merge_profile_stack_layers_with_trace,
    ProfileStackLayer, ProfileStackTrace, StackMergeResult, StackResolverOptions,
};
pub use store::{
    InMemoryProfileStore, OverlayStore, ProfileStore, ProfileStoreReader, ProfileStoreWriter,
    SaveOptions,
};
