//! Kestrel metrics gateway: several named sub-queries bundled into one POST,
//! answered per key.
//!
//! The backend replies with an object keyed by the request's names. A key that
//! failed server-side, or that is missing from the reply, comes back as an
//! empty [`MetricSeries`]; only a failure of the combined request is an error.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kestrel_core::{StoreError, StoreResult};
use kestrel_kubehub::TransportClient;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

mod series;

pub use series::{MetricResult, MetricSeries};

/// Query spec for one named sub-query: either a raw expression or a set of
/// backend parameters (e.g. `{"category": "nodes"}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricQuery {
    Expr(String),
    Params(BTreeMap<String, String>),
}

impl MetricQuery {
    pub fn category(category: impl Into<String>) -> Self {
        Self::Params(BTreeMap::from([("category".to_string(), category.into())]))
    }

    /// Add a parameter; turns an expression into `{query: expr, ..}`.
    pub fn with(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut params = match self {
            Self::Params(p) => p,
            Self::Expr(e) => BTreeMap::from([("query".to_string(), e)]),
        };
        params.insert(key.into(), value.into());
        Self::Params(params)
    }
}

/// Time window forwarded as `start`, `end` (unix seconds) and `step` (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: Duration,
}

impl MetricsRange {
    /// The `window` ending now.
    pub fn last(window: Duration, step: Duration) -> Self {
        let end = Utc::now();
        let start = end - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self { start, end, step }
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("start".into(), self.start.timestamp().to_string()),
            ("end".into(), self.end.timestamp().to_string()),
            ("step".into(), self.step.as_secs().max(1).to_string()),
        ]
    }
}

/// The six-key bundle shown for cluster nodes.
pub fn node_metrics_queries() -> BTreeMap<String, MetricQuery> {
    ["memoryUsage", "memoryCapacity", "cpuUsage", "cpuCapacity", "fsSize", "fsUsage"]
        .into_iter()
        .map(|name| (name.to_string(), MetricQuery::category("nodes")))
        .collect()
}

#[derive(Clone)]
pub struct MetricsGateway {
    client: TransportClient,
    path: String,
}

impl MetricsGateway {
    pub const DEFAULT_PATH: &'static str = "/api/metrics";

    pub fn new(client: TransportClient) -> Self { Self::with_path(client, Self::DEFAULT_PATH) }

    pub fn with_path(client: TransportClient, path: impl Into<String>) -> Self { Self { client, path: path.into() } }

    pub fn path(&self) -> &str { &self.path }

    /// One round trip for every entry of `queries`. The result has exactly the
    /// requested keys.
    pub async fn query(
        &self,
        queries: &BTreeMap<String, MetricQuery>,
        range: Option<&MetricsRange>,
    ) -> StoreResult<BTreeMap<String, MetricSeries>> {
        if queries.is_empty() {
            return Ok(BTreeMap::new());
        }
        let body = serde_json::to_value(queries).map_err(|e| StoreError::InvalidParams(format!("metric queries: {e}")))?;
        let params = range.map(MetricsRange::query_pairs).unwrap_or_default();
        let t0 = Instant::now();
        let reply = self.client.post(&self.path, &params, &body).await?;
        let Value::Object(mut entries) = reply else {
            return Err(StoreError::Malformed(format!("{}: metrics reply is not an object", self.path)));
        };

        let mut out = BTreeMap::new();
        let mut failed = 0usize;
        for name in queries.keys() {
            let series = match entries.remove(name).as_ref().map(MetricSeries::from_entry) {
                Some(Some(series)) => series,
                Some(None) => {
                    warn!(path = %self.path, query = %name, "metrics: sub-query failed; using empty series");
                    failed += 1;
                    MetricSeries::default()
                }
                None => {
                    debug!(path = %self.path, query = %name, "metrics: sub-query missing from reply");
                    failed += 1;
                    MetricSeries::default()
                }
            };
            out.insert(name.clone(), series);
        }
        if failed > 0 {
            counter!("metrics_batch_failed_entries_total", failed as u64);
        }
        info!(path = %self.path, queries = queries.len(), failed, took_ms = %t0.elapsed().as_millis(), "metrics: batch ok");
        Ok(out)
    }
}
