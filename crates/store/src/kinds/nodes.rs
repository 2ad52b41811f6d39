//! Node capability table and a typed view over cached nodes.

use k8s_openapi::api::core::v1::{Node, Taint};
use kestrel_core::units::{cpu_units_to_number, units_to_bytes};
use kestrel_core::{ResourceDescriptor, ResourceObject, StoreResult};
use serde::Serialize;

use super::KindSpec;

pub fn spec() -> KindSpec<ResourceObject> { KindSpec::single(ResourceDescriptor::of::<Node>()) }

const ROLE_LABEL_PREFIX: &str = "node-role.kubernetes.io";
const LEGACY_ROLE_LABEL: &str = "kubernetes.io/role";
const OS_LABEL: &str = "kubernetes.io/os";
/// Active conditions that are not worth a warning.
const HEALTHY_CONDITIONS: &[&str] = &["Ready", "HostUpgrades", "SchedulingDisabled"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeCondition {
    pub fn is_active(&self) -> bool { self.status == "True" }
}

/// Typed accessors over a cached Node.
#[derive(Debug, Clone)]
pub struct NodeView {
    node: Node,
}

impl NodeView {
    pub fn new(obj: &ResourceObject) -> StoreResult<Self> { Ok(Self { node: obj.typed::<Node>()? }) }

    pub fn name(&self) -> &str { self.node.metadata.name.as_deref().unwrap_or_default() }

    fn label(&self, key: &str) -> Option<&str> {
        self.node.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
    }

    pub fn taints(&self) -> &[Taint] {
        self.node.spec.as_ref().and_then(|s| s.taints.as_deref()).unwrap_or_default()
    }

    /// Role names from `node-role.kubernetes.io/<role>` keys and the legacy
    /// `kubernetes.io/role` value.
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self
            .node
            .metadata
            .labels
            .iter()
            .flatten()
            .filter(|(k, _)| k.contains(ROLE_LABEL_PREFIX))
            .filter_map(|(k, _)| k.rsplit('/').next().map(str::to_string))
            .collect();
        if let Some(role) = self.label(LEGACY_ROLE_LABEL) {
            roles.push(role.to_string());
        }
        roles
    }

    /// Cores; 0 when unreported.
    pub fn cpu_capacity(&self) -> f64 { self.capacity("cpu").and_then(cpu_units_to_number).unwrap_or(0.0) }

    /// Bytes; 0 when unreported.
    pub fn memory_capacity(&self) -> f64 { self.capacity("memory").and_then(units_to_bytes).unwrap_or(0.0) }

    fn capacity(&self, key: &str) -> Option<&str> {
        self.node.status.as_ref()?.capacity.as_ref()?.get(key).map(|q| q.0.as_str())
    }

    pub fn is_unschedulable(&self) -> bool {
        self.node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false)
    }

    /// Reported conditions, led by a synthetic `SchedulingDisabled` when cordoned.
    pub fn conditions(&self) -> Vec<NodeCondition> {
        let mut out = Vec::new();
        if self.is_unschedulable() {
            out.push(NodeCondition {
                kind: "SchedulingDisabled".into(),
                status: "True".into(),
                reason: None,
                message: None,
            });
        }
        let reported = self.node.status.as_ref().and_then(|s| s.conditions.as_deref()).unwrap_or_default();
        out.extend(reported.iter().map(|c| NodeCondition {
            kind: c.type_.clone(),
            status: c.status.clone(),
            reason: c.reason.clone(),
            message: c.message.clone(),
        }));
        out
    }

    pub fn active_conditions(&self) -> Vec<NodeCondition> {
        self.conditions().into_iter().filter(NodeCondition::is_active).collect()
    }

    pub fn warning_conditions(&self) -> Vec<NodeCondition> {
        self.active_conditions().into_iter().filter(|c| !HEALTHY_CONDITIONS.contains(&c.kind.as_str())).collect()
    }

    /// Space-separated types of the active conditions, e.g. `"Ready DiskPressure"`.
    pub fn condition_text(&self) -> String {
        self.active_conditions().iter().map(|c| c.kind.as_str()).collect::<Vec<_>>().join(" ")
    }

    pub fn kubelet_version(&self) -> Option<&str> {
        self.node.status.as_ref()?.node_info.as_ref().map(|i| i.kubelet_version.as_str())
    }

    pub fn operating_system(&self) -> &str { self.label(OS_LABEL).unwrap_or("linux") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(extra: serde_json::Value) -> NodeView {
        let mut raw = json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {
                "uid": "n1",
                "name": "worker-1",
                "labels": {
                    "node-role.kubernetes.io/control-plane": "",
                    "kubernetes.io/role": "master",
                    "kubernetes.io/os": "windows"
                }
            },
            "status": {
                "capacity": {"cpu": "3500m", "memory": "2Gi"},
                "conditions": [
                    {"type": "Ready", "status": "True"},
                    {"type": "DiskPressure", "status": "True", "reason": "KubeletHasDiskPressure"},
                    {"type": "MemoryPressure", "status": "False"}
                ],
                "nodeInfo": {
                    "machineID": "", "systemUUID": "", "bootID": "", "kernelVersion": "", "osImage": "",
                    "containerRuntimeVersion": "", "kubeletVersion": "v1.29.2", "kubeProxyVersion": "",
                    "operatingSystem": "linux", "architecture": "amd64"
                }
            }
        });
        if let (Some(dst), Some(src)) = (raw.as_object_mut(), extra.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        NodeView::new(&ResourceObject::from_value(raw).unwrap()).unwrap()
    }

    #[test]
    fn capacity_roles_and_os() {
        let n = node(json!({}));
        assert_eq!(n.name(), "worker-1");
        assert!((n.cpu_capacity() - 3.5).abs() < 1e-9);
        assert_eq!(n.memory_capacity(), 2.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(n.roles(), vec!["control-plane".to_string(), "master".to_string()]);
        assert_eq!(n.operating_system(), "windows");
        assert_eq!(n.kubelet_version(), Some("v1.29.2"));
        assert!(n.taints().is_empty());
    }

    #[test]
    fn cordoned_nodes_lead_with_scheduling_disabled() {
        let n = node(json!({"spec": {"unschedulable": true, "taints": [{"key": "k", "effect": "NoSchedule"}]}}));
        let conditions = n.conditions();
        assert_eq!(conditions[0].kind, "SchedulingDisabled");
        assert_eq!(n.active_conditions().len(), 3);
        let warnings: Vec<_> = n.warning_conditions().into_iter().map(|c| c.kind).collect();
        assert_eq!(warnings, vec!["DiskPressure".to_string()]);
        assert_eq!(n.condition_text(), "SchedulingDisabled Ready DiskPressure");
        assert_eq!(node(json!({})).condition_text(), "Ready DiskPressure");
        assert_eq!(n.taints().len(), 1);
    }
}
