//! Role and ClusterRole served as one logical kind.

use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role};
use k8s_openapi::Resource;
use kestrel_core::{KindIdentity, ResourceDescriptor, ResourceObject, StoreResult};

use super::KindSpec;
use crate::merge::MergePolicy;

pub fn identity() -> KindIdentity { KindIdentity::new(Role::API_VERSION, Role::KIND) }

/// Cluster roles are listed first, so a namespaced role wins a uid collision.
/// Writes with a namespace go to `roles`, without one to `clusterroles`.
pub fn spec() -> KindSpec<ResourceObject> {
    KindSpec::new(
        identity(),
        MergePolicy::merged([ResourceDescriptor::of::<ClusterRole>(), ResourceDescriptor::of::<Role>()]),
    )
}

/// Policy rules of a cached Role or ClusterRole.
pub fn rules(obj: &ResourceObject) -> StoreResult<Vec<PolicyRule>> {
    let rules = if obj.kind == ClusterRole::KIND {
        obj.typed::<ClusterRole>()?.rules
    } else {
        obj.typed::<Role>()?.rules
    };
    Ok(rules.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::ItemParams;
    use serde_json::json;

    #[test]
    fn routes_namespaced_writes_to_roles() {
        let s = spec();
        assert_eq!(s.policy.route(&ItemParams::namespaced("ns1", "r")).unwrap().plural, "roles");
        assert_eq!(s.policy.route(&ItemParams::cluster("r")).unwrap().plural, "clusterroles");
    }

    #[test]
    fn rules_decode_for_both_kinds() {
        let role = ResourceObject::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": {"uid": "1", "name": "reader", "namespace": "a"},
            "rules": [{"apiGroups": [""], "resources": ["pods"], "verbs": ["get", "list"]}]
        }))
        .unwrap();
        let cluster = ResourceObject::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"uid": "2", "name": "admin"}
        }))
        .unwrap();
        let r = rules(&role).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].verbs, vec!["get".to_string(), "list".to_string()]);
        assert!(rules(&cluster).unwrap().is_empty());
    }
}
