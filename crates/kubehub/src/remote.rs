//! `kube::Client`-backed transport. Credentials come from the client's config
//! (kubeconfig / in-cluster), which the core treats as opaque.

use futures::{StreamExt, TryStreamExt};
use kestrel_core::{ResourceVersion, StoreError, StoreResult};
use kube::api::{DeleteParams, GetParams, ListParams, Patch, PatchParams, PostParams, WatchParams};
use kube::core::Request;
use kube::Client;
use serde_json::Value;
use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
use tracing::info;

use crate::{ByteStream, ListOptions, RawList, Transport};

/// Bookmarks are on by default in `WatchParams`.
fn watch_params(opts: &ListOptions) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(sel) = &opts.label_selector {
        wp = wp.labels(sel);
    }
    if let Some(secs) = opts.timeout_secs {
        wp = wp.timeout(secs);
    }
    wp
}

pub struct KubeTransport {
    client: Client,
}

/// Map kube-rs failures into the store taxonomy.
pub fn map_kube_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(resp) => StoreError::from_status(resp.code, format!("{}: {}", resp.reason, resp.message)),
        kube::Error::HyperError(e) => StoreError::NetworkTransient(e.to_string()),
        kube::Error::Service(e) => StoreError::NetworkTransient(e.to_string()),
        kube::Error::ReadEvents(e) => StoreError::NetworkTransient(e.to_string()),
        kube::Error::SerdeError(e) => StoreError::Malformed(e.to_string()),
        kube::Error::Auth(e) => StoreError::Unauthorized(e.to_string()),
        kube::Error::BuildRequest(e) => StoreError::InvalidParams(e.to_string()),
        other => StoreError::Internal(other.to_string()),
    }
}

fn build_error(e: kube::core::request::Error) -> StoreError { StoreError::InvalidParams(e.to_string()) }

fn to_bytes(body: &Value) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(body).map_err(|e| StoreError::InvalidParams(e.to_string()))
}

impl KubeTransport {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Client from the default kubeconfig or in-cluster environment.
    pub async fn try_default() -> StoreResult<Self> {
        let client = Client::try_default().await.map_err(map_kube_error)?;
        info!("kube transport ready");
        Ok(Self::new(client))
    }

    fn list_params(opts: &ListOptions) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(sel) = &opts.label_selector {
            lp = lp.labels(sel);
        }
        lp
    }
}

#[async_trait::async_trait]
impl Transport for KubeTransport {
    async fn list(&self, collection: &str, opts: &ListOptions) -> StoreResult<RawList> {
        let req = Request::new(collection).list(&Self::list_params(opts)).map_err(build_error)?;
        let mut v: Value = self.client.request(req).await.map_err(map_kube_error)?;
        let items = match v.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        let resource_version = v
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(Value::as_str)
            .map(ResourceVersion::from);
        Ok(RawList {
            items,
            resource_version,
            kind: v.get("kind").and_then(Value::as_str).map(str::to_string),
            api_version: v.get("apiVersion").and_then(Value::as_str).map(str::to_string),
        })
    }

    async fn get(&self, collection: &str, name: &str) -> StoreResult<Value> {
        let req = Request::new(collection).get(name, &GetParams::default()).map_err(build_error)?;
        self.client.request(req).await.map_err(map_kube_error)
    }

    async fn create(&self, collection: &str, body: &Value) -> StoreResult<Value> {
        let req = Request::new(collection).create(&PostParams::default(), to_bytes(body)?).map_err(build_error)?;
        self.client.request(req).await.map_err(map_kube_error)
    }

    async fn replace(&self, collection: &str, name: &str, body: &Value) -> StoreResult<Value> {
        let req = Request::new(collection).replace(name, &PostParams::default(), to_bytes(body)?).map_err(build_error)?;
        self.client.request(req).await.map_err(map_kube_error)
    }

    async fn patch(&self, collection: &str, name: &str, patch: &Value) -> StoreResult<Value> {
        let req = Request::new(collection)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .map_err(build_error)?;
        self.client.request(req).await.map_err(map_kube_error)
    }

    async fn delete(&self, collection: &str, name: &str) -> StoreResult<Value> {
        let req = Request::new(collection).delete(name, &DeleteParams::default()).map_err(build_error)?;
        self.client.request(req).await.map_err(map_kube_error)
    }

    async fn watch(&self, collection: &str, opts: &ListOptions, since: &ResourceVersion) -> StoreResult<ByteStream> {
        let wp = watch_params(opts);
        let req = Request::new(collection).watch(&wp, since.as_str()).map_err(build_error)?;
        let reader = self.client.request_stream(req).await.map_err(map_kube_error)?;
        let body = ReaderStream::new(reader.compat()).map_err(|e| StoreError::NetworkTransient(e.to_string()));
        Ok(body.boxed())
    }

    async fn post(&self, path: &str, query: &[(String, String)], body: &Value) -> StoreResult<Value> {
        let mut req = Request::new(path).create(&PostParams::default(), to_bytes(body)?).map_err(build_error)?;
        let qs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let target = if qs.is_empty() { path.to_string() } else { format!("{path}?{}", qs.join("&")) };
        *req.uri_mut() = target.parse().map_err(|e| StoreError::InvalidParams(format!("{target}: {e}")))?;
        self.client.request(req).await.map_err(map_kube_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_requests_bookmarks_and_forwards_options() {
        let opts = ListOptions { label_selector: Some("app=web".into()), timeout_secs: Some(60) };
        let wp = watch_params(&opts);
        assert!(wp.bookmarks);
        assert_eq!(wp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(wp.timeout, Some(60));

        let req = Request::new("/api/v1/pods").watch(&wp, "42").unwrap();
        let query = req.uri().query().unwrap_or_default().to_string();
        assert!(query.contains("allowWatchBookmarks=true"), "{query}");
        assert!(query.contains("resourceVersion=42"), "{query}");
    }
}
