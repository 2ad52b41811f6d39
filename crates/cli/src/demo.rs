//! In-memory cluster for `--demo`: a few nodes, roles and pods, a canned
//! metrics reply, and a driver that keeps pods changing.

use std::sync::Arc;
use std::time::Duration;

use kestrel_core::ChangeType;
use kestrel_kubehub::MemoryTransport;
use kestrel_metrics::MetricsGateway;
use serde_json::{json, Value};
use tracing::debug;

pub const PODS: &str = "/api/v1/namespaces/default/pods";

fn node(name: &str, role: &str, cpu: &str, memory: &str, ready: bool, unschedulable: bool) -> Value {
    let ready = if ready { "True" } else { "False" };
    json!({
        "metadata": {
            "name": name,
            "creationTimestamp": "2024-05-01T08:00:00Z",
            "labels": {
                format!("node-role.kubernetes.io/{role}"): "",
                "kubernetes.io/os": "linux"
            }
        },
        "spec": {"unschedulable": unschedulable},
        "status": {
            "capacity": {"cpu": cpu, "memory": memory},
            "nodeInfo": {"kubeletVersion": "v1.29.4"},
            "conditions": [
                {"type": "Ready", "status": ready},
                {"type": "MemoryPressure", "status": "False"}
            ]
        }
    })
}

fn pod(name: &str, phase: &str) -> Value {
    json!({
        "metadata": {"name": name, "namespace": "default", "labels": {"app": "web"}},
        "status": {"phase": phase}
    })
}

fn series(values: &[(i64, &str)]) -> Value {
    let values: Vec<Value> = values.iter().map(|(ts, v)| json!([ts, v])).collect();
    json!({"status": "success", "data": {"resultType": "matrix", "result": [{"metric": {}, "values": values}]}})
}

pub fn transport() -> Arc<MemoryTransport> {
    let mem = Arc::new(MemoryTransport::new());
    mem.seed("/api/v1/nodes", vec![
        node("cp-1", "control-plane", "4", "16Gi", true, false),
        node("worker-1", "worker", "8", "32Gi", true, false),
        node("worker-2", "worker", "8000m", "32Gi", false, true),
    ]);
    mem.seed("/api/v1/namespaces", vec![
        json!({"metadata": {"name": "default"}}),
        json!({"metadata": {"name": "kube-system"}}),
    ]);
    mem.seed("/apis/rbac.authorization.k8s.io/v1/clusterroles", vec![
        json!({"metadata": {"name": "view"}, "rules": [{"apiGroups": [""], "resources": ["pods"], "verbs": ["get", "list", "watch"]}]}),
        json!({"metadata": {"name": "admin"}, "rules": [{"apiGroups": ["*"], "resources": ["*"], "verbs": ["*"]}]}),
    ]);
    mem.seed("/apis/rbac.authorization.k8s.io/v1/namespaces/default/roles", vec![json!({
        "metadata": {"name": "pod-reader"},
        "rules": [{"apiGroups": [""], "resources": ["pods", "pods/log"], "verbs": ["get", "list"]}]
    })]);
    mem.seed(PODS, vec![pod("web-0", "Running"), pod("web-1", "Running")]);
    mem.respond_post(MetricsGateway::DEFAULT_PATH, json!({
        "memoryUsage": series(&[(1_700_000_000, "21474836480"), (1_700_000_060, "22548578304")]),
        "memoryCapacity": series(&[(1_700_000_060, "85899345920")]),
        "cpuUsage": series(&[(1_700_000_000, "3.2"), (1_700_000_060, "3.6")]),
        "cpuCapacity": series(&[(1_700_000_060, "20")]),
        "fsSize": series(&[(1_700_000_060, "322122547200")]),
        "fsUsage": {"status": "error", "errorType": "timeout", "error": "query timed out"}
    }));
    mem
}

/// Add and remove extra pods every two seconds until the process exits.
pub async fn drive(mem: Arc<MemoryTransport>) {
    let mut tick = 0u64;
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        tick += 1;
        let name = format!("web-{}", 2 + tick % 2);
        let existing = mem
            .objects(PODS)
            .into_iter()
            .find(|o| o.pointer("/metadata/name").and_then(Value::as_str) == Some(name.as_str()));
        let (change, obj) = match existing {
            Some(obj) => (ChangeType::Deleted, obj),
            None => {
                let mut obj = pod(&name, "Pending");
                obj["metadata"]["uid"] = json!(format!("demo-{name}-{tick}"));
                (ChangeType::Added, obj)
            }
        };
        debug!(pod = %name, ?change, "demo: emitting");
        mem.emit(PODS, change, obj);
    }
}
