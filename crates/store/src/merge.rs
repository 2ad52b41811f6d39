//! Multi-source composition: one logical kind served by several endpoints.

use std::fmt;

use kestrel_core::{ItemParams, KubeObject, ResourceDescriptor, StoreError, StoreResult};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceScope {
    Namespaced,
    Cluster,
}

impl fmt::Display for SourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceScope::Namespaced => "namespaced",
            SourceScope::Cluster => "cluster",
        })
    }
}

/// A descriptor tagged with its scope.
pub struct Source<T> {
    pub scope: SourceScope,
    pub descriptor: ResourceDescriptor<T>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self { Self { scope: self.scope, descriptor: self.descriptor.clone() } }
}

impl<T> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("scope", &self.scope).field("descriptor", &self.descriptor).finish()
    }
}

impl<T> Source<T> {
    pub fn new(descriptor: ResourceDescriptor<T>) -> Self {
        let scope = if descriptor.namespaced { SourceScope::Namespaced } else { SourceScope::Cluster };
        Self { scope, descriptor }
    }
}

/// Picks the source index for a single-object call, `None` if no source fits.
pub type RouteFn<T> = fn(&[Source<T>], &ItemParams) -> Option<usize>;

/// Namespace present: namespaced source. Absent: cluster source. A
/// single-source kind always routes to its only source.
pub fn route_by_namespace<T>(sources: &[Source<T>], params: &ItemParams) -> Option<usize> {
    if sources.len() == 1 {
        return Some(0);
    }
    let want = if params.namespace.is_some() { SourceScope::Namespaced } else { SourceScope::Cluster };
    sources.iter().position(|s| s.scope == want)
}

/// Tagged list of descriptors plus the routing predicate for single-object calls.
pub struct MergePolicy<T> {
    sources: SmallVec<[Source<T>; 2]>,
    route: RouteFn<T>,
}

impl<T> Clone for MergePolicy<T> {
    fn clone(&self) -> Self { Self { sources: self.sources.clone(), route: self.route } }
}

impl<T> fmt::Debug for MergePolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergePolicy").field("sources", &self.sources).finish()
    }
}

impl<T> MergePolicy<T> {
    pub fn single(descriptor: ResourceDescriptor<T>) -> Self {
        Self { sources: SmallVec::from_iter([Source::new(descriptor)]), route: route_by_namespace }
    }

    /// Sources in load order; on uid collision the later source wins.
    pub fn merged(descriptors: impl IntoIterator<Item = ResourceDescriptor<T>>) -> Self {
        Self { sources: descriptors.into_iter().map(Source::new).collect(), route: route_by_namespace }
    }

    pub fn with_route(mut self, route: RouteFn<T>) -> Self {
        self.route = route;
        self
    }

    pub fn sources(&self) -> &[Source<T>] { &self.sources }

    pub fn is_merged(&self) -> bool { self.sources.len() > 1 }

    pub fn route_index(&self, params: &ItemParams) -> StoreResult<usize> {
        (self.route)(&self.sources, params)
            .filter(|&i| i < self.sources.len())
            .ok_or_else(|| StoreError::InvalidParams(format!("no source accepts {params:?}")))
    }

    pub fn route(&self, params: &ItemParams) -> StoreResult<&ResourceDescriptor<T>> {
        let i = self.route_index(params)?;
        Ok(&self.sources[i].descriptor)
    }

    /// Combined fingerprint of every source, in order.
    pub fn fingerprint(&self) -> String {
        self.sources.iter().map(|s| s.descriptor.fingerprint()).collect::<Vec<_>>().join(";")
    }
}

/// Flatten per-source batches into one uid-keyed set. Later batches win on
/// collision. Each surviving item carries the index of the batch it came from.
pub fn dedup_by_uid<T: KubeObject>(batches: Vec<Vec<T>>) -> FxHashMap<String, (usize, T)> {
    let mut out: FxHashMap<String, (usize, T)> = FxHashMap::default();
    for (idx, batch) in batches.into_iter().enumerate() {
        for obj in batch {
            let uid = obj.uid().to_string();
            if let Some((prev, _)) = out.insert(uid.clone(), (idx, obj)) {
                if prev != idx {
                    debug!(uid = %uid, from = prev, to = idx, "uid collision across sources; later source wins");
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::ResourceObject;
    use serde_json::json;

    fn policy() -> MergePolicy<ResourceObject> {
        MergePolicy::merged([
            ResourceDescriptor::dynamic("rbac.authorization.k8s.io/v1", "ClusterRole", "clusterroles", false),
            ResourceDescriptor::dynamic("rbac.authorization.k8s.io/v1", "Role", "roles", true),
        ])
    }

    fn obj(uid: &str, name: &str) -> ResourceObject {
        ResourceObject::from_value(json!({"kind": "Role", "metadata": {"uid": uid, "name": name}})).unwrap()
    }

    #[test]
    fn routes_by_namespace_presence() {
        let p = policy();
        assert_eq!(p.route(&ItemParams::namespaced("ns1", "r")).unwrap().identity.kind, "Role");
        assert_eq!(p.route(&ItemParams::cluster("r")).unwrap().identity.kind, "ClusterRole");
    }

    #[test]
    fn custom_route_overrides_default() {
        fn always_cluster(_: &[Source<ResourceObject>], _: &ItemParams) -> Option<usize> { Some(0) }
        let p = policy().with_route(always_cluster);
        assert_eq!(p.route(&ItemParams::namespaced("ns1", "r")).unwrap().identity.kind, "ClusterRole");
    }

    #[test]
    fn unroutable_params_are_rejected() {
        let p = MergePolicy::merged([ResourceDescriptor::dynamic("v1", "Pod", "pods", true)]);
        assert!(p.route(&ItemParams::cluster("x")).is_ok());
        fn nowhere(_: &[Source<ResourceObject>], _: &ItemParams) -> Option<usize> { Some(7) }
        assert!(matches!(p.with_route(nowhere).route(&ItemParams::cluster("x")), Err(StoreError::InvalidParams(_))));
    }

    #[test]
    fn dedup_keeps_one_entry_per_uid_last_wins() {
        let merged = dedup_by_uid(vec![vec![obj("a", "first"), obj("b", "other")], vec![obj("a", "second")]]);
        assert_eq!(merged.len(), 2);
        let (src, winner) = &merged["a"];
        assert_eq!(*src, 1);
        assert_eq!(winner.name(), "second");
    }
}
