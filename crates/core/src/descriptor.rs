//! Resource endpoint descriptors: where a kind lives and how to decode it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::object::ResourceObject;

/// Logical kind identity `(apiVersion, kind)` used as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindIdentity {
    pub api_version: String,
    pub kind: String,
}

impl KindIdentity {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    /// Parse `v1/Node` or `rbac.authorization.k8s.io/v1/Role`.
    pub fn parse(key: &str) -> Result<Self, StoreError> {
        match key.rsplit_once('/') {
            Some((api_version, kind)) if !api_version.is_empty() && !kind.is_empty() && api_version.split('/').count() <= 2 => {
                Ok(Self::new(api_version, kind))
            }
            _ => Err(StoreError::Config(format!("invalid kind key: {key} (expect v1/Kind or group/v1/Kind)"))),
        }
    }
}

impl fmt::Display for KindIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.api_version, self.kind) }
}

/// Addressing parameters for single-object calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemParams {
    pub name: String,
    pub namespace: Option<String>,
}

impl ItemParams {
    pub fn cluster(name: impl Into<String>) -> Self { Self { name: name.into(), namespace: None } }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: Some(namespace.into()) }
    }
}

/// Decoder from a raw payload to the cached type.
pub type DecodeFn<T> = fn(Value) -> Result<T, StoreError>;

/// Scope marker for generated Kubernetes types.
pub trait ScopeKind {
    const NAMESPACED: bool;
}

impl ScopeKind for k8s_openapi::NamespaceResourceScope {
    const NAMESPACED: bool = true;
}

impl ScopeKind for k8s_openapi::ClusterResourceScope {
    const NAMESPACED: bool = false;
}

/// Per-kind endpoint metadata. Immutable once built.
pub struct ResourceDescriptor<T> {
    pub identity: KindIdentity,
    /// `/api/v1` or `/apis/{group}/{version}`
    pub api_base: String,
    pub plural: String,
    pub namespaced: bool,
    decode: DecodeFn<T>,
}

impl<T> Clone for ResourceDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            api_base: self.api_base.clone(),
            plural: self.plural.clone(),
            namespaced: self.namespaced,
            decode: self.decode,
        }
    }
}

impl<T> fmt::Debug for ResourceDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("identity", &self.identity)
            .field("api_base", &self.api_base)
            .field("plural", &self.plural)
            .field("namespaced", &self.namespaced)
            .finish()
    }
}

fn api_base_for(api_version: &str) -> String {
    if api_version.contains('/') { format!("/apis/{api_version}") } else { format!("/api/{api_version}") }
}

impl<T> ResourceDescriptor<T> {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
        namespaced: bool,
        decode: DecodeFn<T>,
    ) -> Self {
        let identity = KindIdentity::new(api_version, kind);
        let api_base = api_base_for(&identity.api_version);
        Self { identity, api_base, plural: plural.into(), namespaced, decode }
    }

    /// Descriptor for a generated Kubernetes type with a custom decoder.
    pub fn for_resource<K>(decode: DecodeFn<T>) -> Self
    where
        K: k8s_openapi::Resource,
        K::Scope: ScopeKind,
    {
        Self::new(K::API_VERSION, K::KIND, K::URL_PATH_SEGMENT, <K::Scope as ScopeKind>::NAMESPACED, decode)
    }

    /// Override the base path (aggregated APIs, proxies).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// `{apiBase}[/namespaces/{ns}]/{plural}`. Without a namespace a namespaced
    /// kind addresses all namespaces.
    pub fn collection_path(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if self.namespaced => format!("{}/namespaces/{}/{}", self.api_base, ns, self.plural),
            _ => format!("{}/{}", self.api_base, self.plural),
        }
    }

    /// Collection path for a single-object call; the namespace is required iff namespaced.
    pub fn item_collection_path(&self, params: &ItemParams) -> Result<String, StoreError> {
        match (self.namespaced, params.namespace.as_deref()) {
            (true, Some(ns)) => Ok(self.collection_path(Some(ns))),
            (true, None) => Err(StoreError::InvalidParams(format!("{}: namespace required for {}", self.identity, params.name))),
            (false, Some(ns)) => Err(StoreError::InvalidParams(format!("{}: cluster-scoped, got namespace {ns}", self.identity))),
            (false, None) => Ok(self.collection_path(None)),
        }
    }

    /// `{collection}/{name}`
    pub fn item_path(&self, params: &ItemParams) -> Result<String, StoreError> {
        Ok(format!("{}/{}", self.item_collection_path(params)?, params.name))
    }

    /// Stable text identifying the endpoint, used to detect conflicting registrations.
    pub fn fingerprint(&self) -> String {
        format!("{}|{}|{}|{}", self.identity, self.api_base, self.plural, if self.namespaced { "ns" } else { "cluster" })
    }

    pub fn decode(&self, raw: Value) -> Result<T, StoreError> { (self.decode)(raw) }
}

impl ResourceDescriptor<ResourceObject> {
    /// Dynamic descriptor for a generated Kubernetes type.
    pub fn of<K>() -> Self
    where
        K: k8s_openapi::Resource,
        K::Scope: ScopeKind,
    {
        Self::for_resource::<K>(ResourceObject::from_value)
    }

    pub fn dynamic(api_version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self::new(api_version, kind, plural, namespaced, ResourceObject::from_value)
    }
}
