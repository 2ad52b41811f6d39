//! Descriptor-bound transport client with transient-failure retries.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use kestrel_core::{Backoff, ItemParams, KubeObject, ResourceDescriptor, ResourceVersion, StoreError, StoreResult};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backoff::jittered;
use crate::{ListOptions, Transport, WatchChannel};

/// Decoded list result for one source.
#[derive(Debug, Clone)]
pub struct ListResult<T> {
    pub items: Vec<T>,
    /// Max of the list-level version and every item's version.
    pub resource_version: ResourceVersion,
    /// Items skipped because they failed to decode.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct TransportClient {
    transport: Arc<dyn Transport>,
    retry: Backoff,
}

/// List items come back without `kind`/`apiVersion`; fill them from the envelope or descriptor.
fn fill_type_meta<T>(item: &mut Value, kind: &str, api_version: &str, descriptor: &ResourceDescriptor<T>) {
    if let Some(obj) = item.as_object_mut() {
        if !obj.get("kind").map(Value::is_string).unwrap_or(false) {
            let k = if kind.is_empty() { descriptor.identity.kind.as_str() } else { kind };
            obj.insert("kind".into(), Value::String(k.to_string()));
        }
        if !obj.get("apiVersion").map(Value::is_string).unwrap_or(false) {
            let v = if api_version.is_empty() { descriptor.identity.api_version.as_str() } else { api_version };
            obj.insert("apiVersion".into(), Value::String(v.to_string()));
        }
    }
}

/// Make the body agree with the addressing params.
fn prepare_body<T>(mut body: Value, params: &ItemParams, descriptor: &ResourceDescriptor<T>) -> StoreResult<Value> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidParams(format!("{}: body must be a JSON object", descriptor.identity)))?;
    obj.entry("kind").or_insert_with(|| Value::String(descriptor.identity.kind.clone()));
    obj.entry("apiVersion").or_insert_with(|| Value::String(descriptor.identity.api_version.clone()));
    let meta = obj.entry("metadata").or_insert_with(|| Value::Object(Default::default()));
    let meta = meta
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidParams(format!("{}: metadata must be an object", descriptor.identity)))?;
    if !params.name.is_empty() {
        meta.insert("name".into(), Value::String(params.name.clone()));
    }
    if let Some(ns) = &params.namespace {
        meta.insert("namespace".into(), Value::String(ns.clone()));
    }
    Ok(body)
}

impl TransportClient {
    pub fn new(transport: Arc<dyn Transport>, retry: Backoff) -> Self { Self { transport, retry } }

    pub fn transport(&self) -> &Arc<dyn Transport> { &self.transport }

    /// Run `op` until it succeeds or fails with a non-transient error.
    async fn retrying<R, F, Fut>(&self, verb: &'static str, target: &str, mut op: F) -> StoreResult<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<R>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if self.retry.exhausted(attempt) {
                        warn!(verb, target = %target, attempts = attempt, error = %e, "transport: giving up");
                        return Err(e);
                    }
                    let delay = jittered(&self.retry, attempt - 1);
                    counter!("transport_retries_total", 1u64, "verb" => verb);
                    debug!(verb, target = %target, attempt, delay_ms = %delay.as_millis(), error = %e, "transport: retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// List one source and decode its items; malformed items are skipped.
    pub async fn list<T: KubeObject>(
        &self,
        descriptor: &ResourceDescriptor<T>,
        namespace: Option<&str>,
        opts: &ListOptions,
    ) -> StoreResult<ListResult<T>> {
        let t0 = Instant::now();
        let path = descriptor.collection_path(namespace);
        let raw = self.retrying("list", &path, || self.transport.list(&path, opts)).await?;
        let kind = raw.kind.as_deref().and_then(|k| k.strip_suffix("List")).unwrap_or_default().to_string();
        let api_version = raw.api_version.clone().unwrap_or_default();
        let mut items = Vec::with_capacity(raw.items.len());
        let mut skipped = 0usize;
        for mut item in raw.items {
            fill_type_meta(&mut item, &kind, &api_version, descriptor);
            match descriptor.decode(item) {
                Ok(obj) => items.push(obj),
                Err(e) => {
                    skipped += 1;
                    counter!("store_malformed_total", 1u64, "phase" => "list");
                    warn!(path = %path, error = %e, "skipping malformed list item");
                }
            }
        }
        let resource_version = items
            .iter()
            .map(|o: &T| o.resource_version().clone())
            .fold(raw.resource_version.unwrap_or_default(), ResourceVersion::max_of);
        info!(path = %path, items = items.len(), skipped, rv = %resource_version, took_ms = %t0.elapsed().as_millis(), "transport: list ok");
        Ok(ListResult { items, resource_version, skipped })
    }

    pub async fn get<T>(&self, descriptor: &ResourceDescriptor<T>, params: &ItemParams) -> StoreResult<T> {
        let path = descriptor.item_collection_path(params)?;
        let raw = self.retrying("get", &path, || self.transport.get(&path, &params.name)).await?;
        descriptor.decode(raw)
    }

    /// Create; not retried, a repeated POST could create twice.
    pub async fn create<T>(&self, descriptor: &ResourceDescriptor<T>, params: &ItemParams, body: Value) -> StoreResult<T> {
        let path = descriptor.item_collection_path(params)?;
        let body = prepare_body(body, params, descriptor)?;
        let raw = self.transport.create(&path, &body).await?;
        info!(path = %path, name = %params.name, "transport: create ok");
        descriptor.decode(raw)
    }

    pub async fn update<T>(&self, descriptor: &ResourceDescriptor<T>, params: &ItemParams, body: Value) -> StoreResult<T> {
        let path = descriptor.item_collection_path(params)?;
        let body = prepare_body(body, params, descriptor)?;
        let raw = self.retrying("update", &path, || self.transport.replace(&path, &params.name, &body)).await?;
        info!(path = %path, name = %params.name, "transport: update ok");
        descriptor.decode(raw)
    }

    pub async fn patch<T>(&self, descriptor: &ResourceDescriptor<T>, params: &ItemParams, patch: Value) -> StoreResult<T> {
        let path = descriptor.item_collection_path(params)?;
        let raw = self.retrying("patch", &path, || self.transport.patch(&path, &params.name, &patch)).await?;
        info!(path = %path, name = %params.name, "transport: patch ok");
        descriptor.decode(raw)
    }

    /// Delete. The server answers with either the object or a `Status`; the
    /// latter yields `None`.
    pub async fn delete<T>(&self, descriptor: &ResourceDescriptor<T>, params: &ItemParams) -> StoreResult<Option<T>> {
        let path = descriptor.item_collection_path(params)?;
        let raw = self.retrying("delete", &path, || self.transport.delete(&path, &params.name)).await?;
        info!(path = %path, name = %params.name, "transport: delete ok");
        if raw.get("kind").and_then(Value::as_str) == Some("Status") {
            return Ok(None);
        }
        Ok(descriptor.decode(raw).ok())
    }

    /// Open a watch from `since`. A `Gone` here is returned as-is; the caller re-lists.
    pub async fn open_watch<T>(
        &self,
        descriptor: &ResourceDescriptor<T>,
        namespace: Option<&str>,
        opts: &ListOptions,
        since: &ResourceVersion,
    ) -> StoreResult<WatchChannel<T>> {
        let path = descriptor.collection_path(namespace);
        let body = self.retrying("watch", &path, || self.transport.watch(&path, opts, since)).await?;
        debug!(path = %path, since = %since, "transport: watch opened");
        Ok(WatchChannel::new(body, descriptor.clone()))
    }

    /// POST to a non-resource path (metrics backend).
    pub async fn post(&self, path: &str, query: &[(String, String)], body: &Value) -> StoreResult<Value> {
        self.retrying("post", path, || self.transport.post(path, query, body)).await
    }
}
