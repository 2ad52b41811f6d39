//! Time-series payloads returned by the metrics backend.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One labelled series: `[timestamp, "value"]` pairs as the backend sends them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<(f64, String)>,
}

impl MetricResult {
    /// Points with a numeric value; unparsable samples are dropped.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.values.iter().filter_map(|(ts, v)| v.parse::<f64>().ok().map(|v| (*ts, v)))
    }
}

/// Result for one named sub-query. A failed or missing sub-query yields the
/// empty placeholder (`MetricSeries::default()`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Vec<MetricResult>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: Option<Data>,
}

#[derive(Deserialize)]
struct Data {
    #[serde(default)]
    result: Vec<MetricResult>,
}

impl MetricSeries {
    /// Decode one keyed entry. `None` unless the entry reports success.
    pub(crate) fn from_entry(entry: &Value) -> Option<Self> {
        let env: Envelope = serde_json::from_value(entry.clone()).ok()?;
        if env.status != "success" {
            return None;
        }
        Some(Self { status: env.status, result: env.data.map(|d| d.result).unwrap_or_default() })
    }

    pub fn is_empty(&self) -> bool { self.result.iter().all(|r| r.values.is_empty()) }

    /// Most recent numeric sample of the first series.
    pub fn last_value(&self) -> Option<f64> { self.result.first()?.points().last().map(|(_, v)| v) }
}
