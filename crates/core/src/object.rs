//! Cached object model.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Opaque, server-assigned version token.
///
/// Tokens that parse as unsigned integers are ordered numerically. Any other
/// pair of tokens is only comparable for equality; see [`ResourceVersion::is_newer_than`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(token: impl Into<String>) -> Self { Self(token.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    fn numeric(&self) -> Option<u64> { self.0.parse().ok() }

    /// Total order over numeric tokens; equality only for anything else.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ if self.0 == other.0 => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Whether an incoming copy at `self` should replace a cached copy at `cached`.
    ///
    /// Non-numeric tokens that differ are trusted in delivery order.
    pub fn is_newer_than(&self, cached: &Self) -> bool {
        match self.compare(cached) {
            Some(Ordering::Greater) => true,
            Some(_) => false,
            None => true,
        }
    }

    /// Pick the greater of two tokens, preferring `self` when they are incomparable.
    pub fn max_of(self, other: Self) -> Self {
        match self.compare(&other) {
            Some(Ordering::Less) => other,
            _ => self,
        }
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for ResourceVersion {
    fn from(v: String) -> Self { Self(v) }
}

impl From<u64> for ResourceVersion {
    fn from(v: u64) -> Self { Self(v.to_string()) }
}

/// Object metadata shared by every cached kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub uid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub resource_version: ResourceVersion,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing)]
    owner_references: Vec<Value>,
}

impl ObjectMeta {
    pub fn owner_count(&self) -> usize { self.owner_references.len() }

    /// Creation time as unix seconds (0 when absent or unparsable).
    pub fn creation_ts(&self) -> i64 {
        self.creation_timestamp
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0)
    }
}

/// Anything a store can cache: identity, version and a kind label.
pub trait KubeObject: Clone + Send + Sync + 'static {
    fn kind(&self) -> &str;
    fn api_version(&self) -> &str;
    fn meta(&self) -> &ObjectMeta;

    fn uid(&self) -> &str { &self.meta().uid }
    fn name(&self) -> &str { &self.meta().name }
    fn namespace(&self) -> Option<&str> { self.meta().namespace.as_deref() }
    fn resource_version(&self) -> &ResourceVersion { &self.meta().resource_version }
}

/// Dynamically typed object; keeps the full payload for kind-specific views.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceObject {
    pub kind: String,
    pub api_version: String,
    pub metadata: ObjectMeta,
    raw: Value,
}

impl ResourceObject {
    /// Materialize from a raw payload. Fails when identity fields are missing.
    pub fn from_value(raw: Value) -> Result<Self, StoreError> {
        let kind = raw.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
        let api_version = raw.get("apiVersion").and_then(Value::as_str).unwrap_or_default().to_string();
        let meta_raw = raw
            .get("metadata")
            .cloned()
            .ok_or_else(|| StoreError::Malformed(format!("{kind}: object missing metadata")))?;
        let metadata: ObjectMeta = serde_json::from_value(meta_raw)
            .map_err(|e| StoreError::Malformed(format!("{kind}: metadata: {e}")))?;
        if metadata.uid.is_empty() {
            return Err(StoreError::Malformed(format!("{kind}/{}: object missing metadata.uid", metadata.name)));
        }
        Ok(Self { kind, api_version, metadata, raw })
    }

    pub fn raw(&self) -> &Value { &self.raw }

    pub fn into_raw(self) -> Value { self.raw }

    pub fn spec(&self) -> Option<&Value> { self.raw.get("spec") }

    pub fn status(&self) -> Option<&Value> { self.raw.get("status") }

    /// Deserialize the payload into a kind-specific type.
    pub fn typed<K: DeserializeOwned>(&self) -> Result<K, StoreError> {
        serde_json::from_value(self.raw.clone()).map_err(|e| StoreError::Malformed(format!("{}: {e}", self.kind)))
    }
}

impl KubeObject for ResourceObject {
    fn kind(&self) -> &str { &self.kind }
    fn api_version(&self) -> &str { &self.api_version }
    fn meta(&self) -> &ObjectMeta { &self.metadata }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_versions_order_numerically() {
        let v9 = ResourceVersion::from("9");
        let v10 = ResourceVersion::from("10");
        assert_eq!(v9.compare(&v10), Some(Ordering::Less));
        assert!(v10.is_newer_than(&v9));
        assert!(!v9.is_newer_than(&v10));
        assert!(!v10.is_newer_than(&v10.clone()));
    }

    #[test]
    fn opaque_versions_compare_by_equality() {
        let a = ResourceVersion::from("abc");
        let b = ResourceVersion::from("xyz");
        assert_eq!(a.compare(&b), None);
        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&a.clone()));
    }

    #[test]
    fn max_of_prefers_greater() {
        assert_eq!(ResourceVersion::from(3).max_of(ResourceVersion::from(7)).as_str(), "7");
        assert_eq!(ResourceVersion::from(8).max_of(ResourceVersion::from(7)).as_str(), "8");
    }

    #[test]
    fn decodes_metadata_and_keeps_payload() {
        let raw = serde_json::json!({
            "kind": "Role",
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "metadata": {
                "uid": "u-1",
                "name": "reader",
                "namespace": "ns1",
                "resourceVersion": "42",
                "labels": {"app": "web"},
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "managedFields": []
            },
            "rules": []
        });
        let obj = ResourceObject::from_value(raw).expect("decode");
        assert_eq!(obj.kind(), "Role");
        assert_eq!(obj.uid(), "u-1");
        assert_eq!(obj.namespace(), Some("ns1"));
        assert_eq!(obj.resource_version().as_str(), "42");
        assert_eq!(obj.meta().labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(obj.meta().creation_ts(), 1_577_836_800);
        assert!(obj.raw().get("rules").is_some());
    }

    #[test]
    fn missing_uid_is_malformed() {
        let raw = serde_json::json!({"kind": "Role", "metadata": {"name": "x"}});
        assert!(matches!(ResourceObject::from_value(raw), Err(StoreError::Malformed(_))));
        let raw = serde_json::json!({"kind": "Role"});
        assert!(matches!(ResourceObject::from_value(raw), Err(StoreError::Malformed(_))));
    }
}
