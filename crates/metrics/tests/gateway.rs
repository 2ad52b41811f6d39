#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kestrel_core::{Backoff, StoreError};
use kestrel_kubehub::{MemoryTransport, TransportClient, Verb};
use kestrel_metrics::{node_metrics_queries, MetricQuery, MetricsGateway, MetricsRange};
use serde_json::json;

fn gateway(mem: &Arc<MemoryTransport>) -> MetricsGateway {
    let retry = Backoff::new(Duration::from_millis(1), Duration::from_millis(4));
    MetricsGateway::new(TransportClient::new(mem.clone(), retry))
}

fn success(value: &str) -> serde_json::Value {
    json!({"status": "success", "data": {"resultType": "matrix", "result": [{"metric": {}, "values": [[1700000000, value]]}]}})
}

#[tokio::test]
async fn failed_sub_query_becomes_an_empty_entry() {
    let mem = Arc::new(MemoryTransport::new());
    mem.respond_post(MetricsGateway::DEFAULT_PATH, json!({
        "a": success("42"),
        "b": {"status": "error", "errorType": "timeout", "error": "query timed out"}
    }));
    let queries = BTreeMap::from([
        ("a".to_string(), MetricQuery::Expr("sum(rate(x[1m]))".into())),
        ("b".to_string(), MetricQuery::Expr("slow_query".into())),
    ]);

    let out = gateway(&mem).query(&queries, None).await.unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out["a"].last_value(), Some(42.0));
    assert!(out["b"].is_empty());
    assert_eq!(mem.count(Verb::Post, MetricsGateway::DEFAULT_PATH), 1);
}

#[tokio::test]
async fn missing_keys_are_filled_and_extra_keys_ignored() {
    let mem = Arc::new(MemoryTransport::new());
    mem.respond_post(MetricsGateway::DEFAULT_PATH, json!({"cpuUsage": success("0.5"), "unrelated": success("1")}));

    let out = gateway(&mem).query(&node_metrics_queries(), None).await.unwrap();
    let keys: Vec<_> = out.keys().map(String::as_str).collect();
    assert_eq!(keys, ["cpuCapacity", "cpuUsage", "fsSize", "fsUsage", "memoryCapacity", "memoryUsage"]);
    assert_eq!(out["cpuUsage"].last_value(), Some(0.5));
    assert!(out["fsSize"].is_empty());
}

#[tokio::test]
async fn one_request_carries_every_query_and_the_range() {
    let mem = Arc::new(MemoryTransport::new());
    mem.respond_post("/metrics", json!({}));
    let range = MetricsRange::last(Duration::from_secs(3600), Duration::from_secs(60));

    let gw = MetricsGateway::with_path(TransportClient::new(mem.clone(), Backoff::default()), "/metrics");
    gw.query(&node_metrics_queries(), Some(&range)).await.unwrap();

    let posts = mem.posts();
    assert_eq!(posts.len(), 1);
    let (path, query, body) = &posts[0];
    assert_eq!(path, "/metrics");
    let query: BTreeMap<_, _> = query.iter().cloned().collect();
    assert_eq!(query["step"], "60");
    let start: i64 = query["start"].parse().unwrap();
    let end: i64 = query["end"].parse().unwrap();
    assert_eq!(end - start, 3600);
    assert_eq!(body["memoryUsage"], json!({"category": "nodes"}));
    assert_eq!(body.as_object().map(|o| o.len()), Some(6));
}

#[tokio::test]
async fn combined_request_failure_is_an_error() {
    let mem = Arc::new(MemoryTransport::new());
    mem.fail_next(Verb::Post, MetricsGateway::DEFAULT_PATH, StoreError::Forbidden("metrics".into()));
    let err = gateway(&mem).query(&node_metrics_queries(), None).await.unwrap_err();
    assert!(err.is_auth());

    mem.respond_post(MetricsGateway::DEFAULT_PATH, json!(["not", "keyed"]));
    let err = gateway(&mem).query(&node_metrics_queries(), None).await.unwrap_err();
    assert!(matches!(err, StoreError::Malformed(_)));
}

#[tokio::test]
async fn transient_failures_are_retried_and_empty_batches_skip_the_backend() {
    let mem = Arc::new(MemoryTransport::new());
    mem.respond_post(MetricsGateway::DEFAULT_PATH, json!({"a": success("1")}));
    mem.fail_next(Verb::Post, MetricsGateway::DEFAULT_PATH, StoreError::NetworkTransient("reset".into()));
    let queries = BTreeMap::from([("a".to_string(), MetricQuery::category("pods").with("pods", "web-0"))]);

    let out = gateway(&mem).query(&queries, None).await.unwrap();
    assert_eq!(out["a"].last_value(), Some(1.0));
    assert_eq!(mem.count(Verb::Post, MetricsGateway::DEFAULT_PATH), 2);

    assert!(gateway(&mem).query(&BTreeMap::new(), None).await.unwrap().is_empty());
    assert_eq!(mem.count(Verb::Post, MetricsGateway::DEFAULT_PATH), 2);
}
