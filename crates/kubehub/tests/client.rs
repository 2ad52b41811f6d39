#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kestrel_core::{Backoff, ItemParams, KubeObject, ResourceDescriptor, ResourceObject, StoreError};
use kestrel_kubehub::{ListOptions, MemoryTransport, TransportClient, Verb};
use serde_json::json;

const ROLES: &str = "/apis/rbac.authorization.k8s.io/v1/roles";
const ROLES_A: &str = "/apis/rbac.authorization.k8s.io/v1/namespaces/a/roles";

fn roles() -> ResourceDescriptor<ResourceObject> {
    ResourceDescriptor::dynamic("rbac.authorization.k8s.io/v1", "Role", "roles", true)
}

fn client(mem: &Arc<MemoryTransport>, attempts: Option<u32>) -> TransportClient {
    let mut retry = Backoff::new(Duration::from_millis(1), Duration::from_millis(4));
    retry.max_attempts = attempts;
    TransportClient::new(mem.clone(), retry)
}

#[tokio::test]
async fn list_fills_type_meta_and_skips_malformed_items() {
    let mem = Arc::new(MemoryTransport::new());
    mem.seed(ROLES_A, vec![
        json!({"metadata": {"name": "reader", "resourceVersion": "4"}}),
        json!({"metadata": {"name": "writer", "resourceVersion": "9"}}),
    ]);
    // A server payload with no uid cannot be cached.
    mem.seed(ROLES_A, vec![json!({"metadata": {"name": "broken", "uid": ""}})]);

    let out = client(&mem, None).list(&roles(), None, &ListOptions::default()).await.unwrap();
    assert_eq!(out.items.len(), 2);
    assert_eq!(out.skipped, 1);
    assert!(out.items.iter().all(|o| o.kind() == "Role" && o.api_version() == "rbac.authorization.k8s.io/v1"));
    assert!(out.resource_version.compare(&"9".into()).is_some_and(|o| o.is_ge()));
    assert_eq!(mem.count(Verb::List, ROLES), 1);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let mem = Arc::new(MemoryTransport::new());
    mem.seed(ROLES_A, vec![json!({"metadata": {"name": "reader"}})]);
    mem.fail_next(Verb::Get, ROLES_A, StoreError::NetworkTransient("reset".into()));
    mem.fail_next(Verb::Get, ROLES_A, StoreError::NetworkTransient("reset".into()));

    let got = client(&mem, None).get(&roles(), &ItemParams::namespaced("a", "reader")).await.unwrap();
    assert_eq!(got.name(), "reader");
    assert_eq!(mem.count(Verb::Get, ROLES_A), 3);
}

#[tokio::test]
async fn retries_stop_at_the_attempt_limit() {
    let mem = Arc::new(MemoryTransport::new());
    for _ in 0..5 {
        mem.fail_next(Verb::List, ROLES, StoreError::NetworkTransient("down".into()));
    }
    let err = client(&mem, Some(3)).list(&roles(), None, &ListOptions::default()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(mem.count(Verb::List, ROLES), 3);
}

#[tokio::test]
async fn conflicts_and_creates_are_not_retried() {
    let mem = Arc::new(MemoryTransport::new());
    mem.seed(ROLES_A, vec![json!({"metadata": {"name": "reader", "resourceVersion": "3"}})]);
    let c = client(&mem, None);

    let stale = json!({"metadata": {"resourceVersion": "1"}, "rules": []});
    let err = c.update(&roles(), &ItemParams::namespaced("a", "reader"), stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert_eq!(mem.count(Verb::Replace, ROLES_A), 1);

    mem.fail_next(Verb::Create, ROLES_A, StoreError::NetworkTransient("reset".into()));
    let err = c.create(&roles(), &ItemParams::namespaced("a", "new"), json!({})).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(mem.count(Verb::Create, ROLES_A), 1);
}

#[tokio::test]
async fn create_fills_identity_from_params() {
    let mem = Arc::new(MemoryTransport::new());
    let c = client(&mem, None);
    let created = c.create(&roles(), &ItemParams::namespaced("a", "ops"), json!({"rules": []})).await.unwrap();
    assert_eq!(created.name(), "ops");
    assert_eq!(created.namespace(), Some("a"));
    assert!(!created.uid().is_empty());

    let err = c.create(&roles(), &ItemParams::cluster("ops"), json!({})).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidParams(_)));
}

#[tokio::test]
async fn delete_returns_the_removed_object() {
    let mem = Arc::new(MemoryTransport::new());
    mem.seed(ROLES_A, vec![json!({"metadata": {"name": "reader"}})]);
    let c = client(&mem, None);
    let gone = c.delete(&roles(), &ItemParams::namespaced("a", "reader")).await.unwrap();
    assert_eq!(gone.map(|o| o.name().to_string()).as_deref(), Some("reader"));
    assert!(mem.objects(ROLES_A).is_empty());

    let err = c.delete(&roles(), &ItemParams::namespaced("a", "reader")).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn patch_merges_into_the_live_object() {
    let mem = Arc::new(MemoryTransport::new());
    mem.seed(ROLES_A, vec![json!({"metadata": {"name": "reader", "labels": {"team": "x"}}, "rules": []})]);
    let c = client(&mem, None);
    let out = c
        .patch(&roles(), &ItemParams::namespaced("a", "reader"), json!({"metadata": {"labels": {"team": "y"}}}))
        .await
        .unwrap();
    assert_eq!(out.meta().labels.get("team").map(String::as_str), Some("y"));
}
