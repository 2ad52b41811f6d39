//! Kestrel kubehub: transport to the API server, retries and watch decoding.

#![forbid(unsafe_code)]

use bytes::Bytes;
use futures::stream::BoxStream;
use kestrel_core::{ResourceVersion, StoreResult};
use serde_json::Value;

pub mod backoff;
pub mod client;
pub mod memory;
pub mod remote;
pub mod watch;

pub use client::{ListResult, TransportClient};
pub use memory::{MemoryTransport, Verb};
pub use remote::KubeTransport;
pub use watch::WatchChannel;

/// Raw body of a streaming response.
pub type ByteStream = BoxStream<'static, StoreResult<Bytes>>;

/// Options forwarded to list and watch requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    /// Server-side watch timeout.
    pub timeout_secs: Option<u32>,
}

/// Undecoded list response.
#[derive(Debug, Clone, Default)]
pub struct RawList {
    pub items: Vec<Value>,
    /// List-level resourceVersion, when the server reports one.
    pub resource_version: Option<ResourceVersion>,
    /// e.g. `RoleList`
    pub kind: Option<String>,
    pub api_version: Option<String>,
}

/// One request attempt against the API server; no caching, no retries.
///
/// Paths are collection paths (`{apiBase}[/namespaces/{ns}]/{plural}`).
/// Credentials are attached by the implementation.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn list(&self, collection: &str, opts: &ListOptions) -> StoreResult<RawList>;

    async fn get(&self, collection: &str, name: &str) -> StoreResult<Value>;

    async fn create(&self, collection: &str, body: &Value) -> StoreResult<Value>;

    async fn replace(&self, collection: &str, name: &str, body: &Value) -> StoreResult<Value>;

    /// JSON merge patch.
    async fn patch(&self, collection: &str, name: &str, patch: &Value) -> StoreResult<Value>;

    async fn delete(&self, collection: &str, name: &str) -> StoreResult<Value>;

    /// Open a streaming watch starting after `since`.
    async fn watch(&self, collection: &str, opts: &ListOptions, since: &ResourceVersion) -> StoreResult<ByteStream>;

    /// Plain POST to an arbitrary path (metrics backend).
    async fn post(&self, path: &str, query: &[(String, String)], body: &Value) -> StoreResult<Value>;
}
