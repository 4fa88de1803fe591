//! Profile stacks: expansion into ordered layers, and topology checks.
//!
//! A profile's `stack` lists the profiles it inherits from. Expansion walks
//! that graph depth-first and emits each profile after everything it
//! inherits from (post-order), which yields a base→leaf sequence ending with
//! the root profile. Profiles reachable along several paths are emitted once,
//! at their first occurrence.

pub mod merge;
pub mod trace;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::error::{ProfileError, Result};
use crate::profile::{Profile, ProfileRef, ProfileRegistry};
use crate::slug::{ProfileSlug, RegistrySlug};
use crate::store::ProfileStoreReader;

pub use merge::{merge_profile_stack_layers, merge_profile_stack_layers_with_trace, StackMergeResult};
pub use trace::{PathTrace, ProfileStackTrace, TraceStep};

/// Default limit on inheritance depth.
pub const DEFAULT_MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackResolverOptions {
    pub max_depth: usize,
}

impl Default for StackResolverOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// One profile's contribution to a stack, in base→leaf order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileStackLayer {
    pub registry_slug: RegistrySlug,
    pub profile_slug: ProfileSlug,
    pub profile: Profile,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Identity {
    registry: RegistrySlug,
    profile: ProfileSlug,
}

impl Identity {
    fn target_of(&self, reference: &ProfileRef) -> Identity {
        Identity {
            registry: reference
                .registry_slug
                .clone()
                .unwrap_or_else(|| self.registry.clone()),
            profile: reference.profile_slug.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.profile)
    }
}

fn join_path<'a>(path: impl IntoIterator<Item = &'a Identity>) -> String {
    path.into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn ref_field(owner: &ProfileSlug, index: usize) -> String {
    format!("registry.profiles[{}].stack[{}]", owner, index)
}

fn depth_error(field: String, max_depth: usize, path: &[Identity], target: &Identity) -> ProfileError {
    ProfileError::validation(
        field,
        format!(
            "stack depth exceeds max_depth={} while traversing {} -> {}",
            max_depth,
            join_path(path),
            target
        ),
    )
}

fn cycle_error(field: String, path: &[Identity], start: usize, target: &Identity) -> ProfileError {
    ProfileError::validation(
        field,
        format!(
            "stack cycle detected: {}",
            join_path(path[start..].iter().chain(std::iter::once(target)))
        ),
    )
}

struct Frame {
    id: Identity,
    profile: Profile,
    next_ref: usize,
}

async fn load_profile(
    reader: &dyn ProfileStoreReader,
    cache: &mut HashMap<Identity, Profile>,
    id: &Identity,
) -> Result<Profile> {
    if let Some(profile) = cache.get(id) {
        return Ok(profile.clone());
    }
    if reader.get_registry(&id.registry).await?.is_none() {
        return Err(ProfileError::RegistryNotFound(id.registry.to_string()));
    }
    let profile = reader
        .get_profile(&id.registry, &id.profile)
        .await?
        .ok_or_else(|| ProfileError::profile_not_found(id.registry.as_str(), id.profile.as_str()))?;
    cache.insert(id.clone(), profile.clone());
    Ok(profile)
}

/// Expand `registry/profile` into base→leaf layers. The root is always last.
pub async fn expand_profile_stack(
    reader: &dyn ProfileStoreReader,
    registry: &RegistrySlug,
    profile: &ProfileSlug,
    opts: StackResolverOptions,
) -> Result<Vec<ProfileStackLayer>> {
    let max_depth = if opts.max_depth == 0 {
        DEFAULT_MAX_DEPTH
    } else {
        opts.max_depth
    };

    let mut cache = HashMap::new();
    let root = Identity {
        registry: registry.clone(),
        profile: profile.clone(),
    };
    let root_profile = load_profile(reader, &mut cache, &root).await?;

    let mut visited: HashSet<Identity> = HashSet::new();
    let mut in_path: HashMap<Identity, usize> = HashMap::new();
    let mut path: Vec<Identity> = vec![root.clone()];
    let mut frames = vec![Frame {
        id: root.clone(),
        profile: root_profile,
        next_ref: 0,
    }];
    in_path.insert(root, 0);
    let mut layers = Vec::new();

    while let Some(frame) = frames.last_mut() {
        if frame.next_ref >= frame.profile.stack.len() {
            let Some(done) = frames.pop() else { break };
            path.pop();
            in_path.remove(&done.id);
            visited.insert(done.id.clone());
            layers.push(ProfileStackLayer {
                registry_slug: done.id.registry,
                profile_slug: done.id.profile,
                profile: done.profile,
            });
            continue;
        }

        let index = frame.next_ref;
        frame.next_ref += 1;
        let field = ref_field(&frame.id.profile, index);
        let target = frame.id.target_of(&frame.profile.stack[index]);

        if path.len() + 1 > max_depth {
            return Err(depth_error(field, max_depth, &path, &target));
        }
        if let Some(&start) = in_path.get(&target) {
            return Err(cycle_error(field, &path, start, &target));
        }

        let target_profile = match load_profile(reader, &mut cache, &target).await {
            Ok(profile) => profile,
            Err(ProfileError::RegistryNotFound(_)) => {
                return Err(ProfileError::validation(
                    field,
                    format!("referenced registry \"{}\" not found", target.registry),
                ))
            }
            Err(ProfileError::ProfileNotFound { .. }) => {
                return Err(ProfileError::validation(
                    field,
                    format!(
                        "referenced profile \"{}\" not found in registry \"{}\"",
                        target.profile, target.registry
                    ),
                ))
            }
            Err(other) => return Err(other),
        };

        if visited.contains(&target) {
            continue;
        }
        in_path.insert(target.clone(), path.len());
        path.push(target.clone());
        frames.push(Frame {
            id: target,
            profile: target_profile,
            next_ref: 0,
        });
    }

    Ok(layers)
}

/// Check cycles, depth and local ref existence inside one registry.
///
/// Refs naming another registry are outside this registry's control and are
/// accepted without being followed.
pub fn validate_registry_stack_topology(registry: &ProfileRegistry, max_depth: usize) -> Result<()> {
    let max_depth = if max_depth == 0 { DEFAULT_MAX_DEPTH } else { max_depth };
    let nodes: BTreeSet<Identity> = registry
        .profiles
        .keys()
        .map(|slug| Identity {
            registry: registry.slug.clone(),
            profile: slug.clone(),
        })
        .collect();

    let mut visited: HashSet<Identity> = HashSet::new();
    for start in &nodes {
        if visited.contains(start) {
            continue;
        }
        // (node, next ref index)
        let mut frames: Vec<(Identity, usize)> = vec![(start.clone(), 0)];
        let mut path: Vec<Identity> = vec![start.clone()];
        let mut in_path: HashMap<Identity, usize> = HashMap::from([(start.clone(), 0)]);

        while let Some((node, next_ref)) = frames.last_mut() {
            let stack = registry
                .profiles
                .get(&node.profile)
                .map(|p| p.stack.as_slice())
                .unwrap_or_default();
            if *next_ref >= stack.len() {
                let node = node.clone();
                frames.pop();
                path.pop();
                in_path.remove(&node);
                visited.insert(node);
                continue;
            }

            let index = *next_ref;
            *next_ref += 1;
            let reference = &stack[index];
            let field = ref_field(&node.profile, index);
            let target = node.target_of(reference);

            if target.registry != registry.slug {
                continue;
            }
            if !nodes.contains(&target) {
                return Err(ProfileError::validation(
                    field,
                    format!(
                        "referenced profile \"{}\" not found in registry \"{}\"",
                        target.profile, target.registry
                    ),
                ));
            }
            if let Some(&start) = in_path.get(&target) {
                return Err(cycle_error(field, &path, start, &target));
            }
            if path.len() + 1 > max_depth {
                return Err(depth_error(field, max_depth, &path, &target));
            }
            if visited.contains(&target) {
                continue;
            }
            in_path.insert(target.clone(), path.len());
            path.push(target.clone());
            frames.push((target, 0));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryProfileStore;

    fn pslug(s: &str) -> ProfileSlug {
        ProfileSlug::parse(s).unwrap()
    }

    fn rslug(s: &str) -> RegistrySlug {
        RegistrySlug::parse(s).unwrap()
    }

    fn profile(slug: &str, stack: &[&str]) -> Profile {
        let mut p = Profile::new(pslug(slug));
        p.stack = stack
            .iter()
            .map(|s| match s.split_once('/') {
                Some((reg, prof)) => ProfileRef::remote(rslug(reg), pslug(prof)),
                None => ProfileRef::local(pslug(s)),
            })
            .collect();
        p
    }

    fn registry(slug: &str, profiles: Vec<Profile>) -> ProfileRegistry {
        profiles
            .into_iter()
            .fold(ProfileRegistry::new(rslug(slug)), |r, p| r.with_profile(p))
    }

    fn slugs(layers: &[ProfileStackLayer]) -> Vec<String> {
        layers
            .iter()
            .map(|l| format!("{}/{}", l.registry_slug, l.profile_slug))
            .collect()
    }

    #[tokio::test]
    async fn test_post_order_with_fan_in() {
        // leaf -> [mid1, mid2], both -> base
        let store = InMemoryProfileStore::with_registries([registry(
            "a",
            vec![
                profile("base", &[]),
                profile("mid1", &["base"]),
                profile("mid2", &["base"]),
                profile("leaf", &["mid1", "mid2"]),
            ],
        )])
        .unwrap();

        let layers = expand_profile_stack(&store, &rslug("a"), &pslug("leaf"), Default::default())
            .await
            .unwrap();
        assert_eq!(slugs(&layers), vec!["a/base", "a/mid1", "a/mid2", "a/leaf"]);

        let again = expand_profile_stack(&store, &rslug("a"), &pslug("leaf"), Default::default())
            .await
            .unwrap();
        assert_eq!(layers, again);
    }

    #[tokio::test]
    async fn test_refs_inherit_current_registry() {
        let store = InMemoryProfileStore::with_registries([
            registry("a", vec![profile("leaf", &["b/mid"])]),
            registry("b", vec![profile("mid", &["core"]), profile("core", &[])]),
        ])
        .unwrap();
        let layers = expand_profile_stack(&store, &rslug("a"), &pslug("leaf"), Default::default())
            .await
            .unwrap();
        assert_eq!(slugs(&layers), vec!["b/core", "b/mid", "a/leaf"]);
    }

    #[tokio::test]
    async fn test_cross_registry_cycle_detected() {
        let store = InMemoryProfileStore::with_registries([
            registry("a", vec![profile("x", &["b/y"])]),
            registry("b", vec![profile("y", &["a/x"])]),
        ])
        .unwrap();
        let err = expand_profile_stack(&store, &rslug("a"), &pslug("x"), Default::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProfileError::validation(
                "registry.profiles[y].stack[0]",
                "stack cycle detected: a/x -> b/y -> a/x"
            )
        );
    }

    #[tokio::test]
    async fn test_missing_refs() {
        let store = InMemoryProfileStore::with_registries([registry(
            "a",
            vec![profile("x", &["ghost/y"]), profile("z", &["b/q"])],
        )])
        .unwrap();
        let err = expand_profile_stack(&store, &rslug("a"), &pslug("x"), Default::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error (registry.profiles[x].stack[0]): referenced registry \"ghost\" not found"
        );

        let store = InMemoryProfileStore::with_registries([
            registry("a", vec![profile("x", &["b/nope"])]),
            registry("b", vec![]),
        ])
        .unwrap();
        let err = expand_profile_stack(&store, &rslug("a"), &pslug("x"), Default::default())
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("referenced profile \"nope\" not found in registry \"b\""));
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let store = InMemoryProfileStore::with_registries([registry(
            "a",
            vec![profile("p1", &["p2"]), profile("p2", &["p3"]), profile("p3", &[])],
        )])
        .unwrap();
        let err = expand_profile_stack(
            &store,
            &rslug("a"),
            &pslug("p1"),
            StackResolverOptions { max_depth: 2 },
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error (registry.profiles[p2].stack[0]): stack depth exceeds max_depth=2 while traversing a/p1 -> a/p2 -> a/p3"
        );
    }

    #[tokio::test]
    async fn test_unknown_root() {
        let store = InMemoryProfileStore::with_registries([registry("a", vec![])]).unwrap();
        let err = expand_profile_stack(&store, &rslug("a"), &pslug("x"), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProfileError::ProfileNotFound { .. }));
        let err = expand_profile_stack(&store, &rslug("zz"), &pslug("x"), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProfileError::RegistryNotFound(_)));
    }

    #[test]
    fn test_topology_allows_external_refs() {
        let reg = registry("a", vec![profile("x", &["other/y"]), profile("y", &["x"])]);
        assert!(validate_registry_stack_topology(&reg, DEFAULT_MAX_DEPTH).is_ok());

        let cyclic = registry("a", vec![profile("x", &["y"]), profile("y", &["x"])]);
        let err = validate_registry_stack_topology(&cyclic, DEFAULT_MAX_DEPTH).unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error (registry.profiles[y].stack[0]): stack cycle detected: a/x -> a/y -> a/x"
        );
    }
}
