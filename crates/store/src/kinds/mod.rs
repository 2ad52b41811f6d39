//! Per-kind capability tables: descriptors, merge sources, routing and order.

use std::cmp::Ordering;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service};
use kestrel_core::{KindIdentity, KubeObject, ResourceDescriptor, ResourceObject, SyncConfig};
use kestrel_kubehub::TransportClient;

use crate::merge::MergePolicy;
use crate::snapshot::{by_kind_then_name, Comparator};
use crate::store::ResourceStore;

pub mod nodes;
pub mod roles;

/// Everything needed to build the store for one logical kind.
pub struct KindSpec<T> {
    pub identity: KindIdentity,
    pub policy: MergePolicy<T>,
    pub comparator: Comparator<T>,
}

impl<T: KubeObject> KindSpec<T> {
    pub fn new(identity: KindIdentity, policy: MergePolicy<T>) -> Self {
        Self { identity, policy, comparator: Arc::new(by_kind_then_name::<T>) }
    }

    /// Single-source kind named after its descriptor.
    pub fn single(descriptor: ResourceDescriptor<T>) -> Self {
        Self::new(descriptor.identity.clone(), MergePolicy::single(descriptor))
    }

    pub fn with_comparator(mut self, cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        self.comparator = Arc::new(cmp);
        self
    }

    pub fn build(self, client: TransportClient, config: SyncConfig) -> ResourceStore<T> {
        ResourceStore::new(self, client, config)
    }
}

/// Short names accepted by [`builtin`].
pub const BUILTIN_ALIASES: &[&str] = &[
    "roles",
    "nodes",
    "pods",
    "namespaces",
    "configmaps",
    "secrets",
    "services",
    "deployments",
    "statefulsets",
    "daemonsets",
];

/// Capability table for a built-in kind by plural or short name.
pub fn builtin(alias: &str) -> Option<KindSpec<ResourceObject>> {
    let spec = match alias.to_ascii_lowercase().as_str() {
        "roles" | "role" | "clusterroles" => roles::spec(),
        "nodes" | "node" | "no" => nodes::spec(),
        "pods" | "pod" | "po" => KindSpec::single(ResourceDescriptor::of::<Pod>()),
        "namespaces" | "namespace" | "ns" => KindSpec::single(ResourceDescriptor::of::<Namespace>()),
        "configmaps" | "configmap" | "cm" => KindSpec::single(ResourceDescriptor::of::<ConfigMap>()),
        "secrets" | "secret" => KindSpec::single(ResourceDescriptor::of::<Secret>()),
        "services" | "service" | "svc" => KindSpec::single(ResourceDescriptor::of::<Service>()),
        "deployments" | "deployment" | "deploy" => KindSpec::single(ResourceDescriptor::of::<Deployment>()),
        "statefulsets" | "statefulset" | "sts" => KindSpec::single(ResourceDescriptor::of::<StatefulSet>()),
        "daemonsets" | "daemonset" | "ds" => KindSpec::single(ResourceDescriptor::of::<DaemonSet>()),
        _ => return None,
    };
    Some(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_kinds() {
        for alias in BUILTIN_ALIASES {
            assert!(builtin(alias).is_some(), "{alias}");
        }
        assert_eq!(builtin("svc").unwrap().identity, KindIdentity::new("v1", "Service"));
        assert!(builtin("roles").unwrap().policy.is_merged());
        assert!(builtin("widgets").is_none());
    }
}
