//! In-process API server double.
//!
//! Holds objects per collection, streams watch records to open watchers and
//! lets tests inject failures, expiries and raw records. Mutations made through
//! the transport do not emit watch records; use [`MemoryTransport::emit`] for that.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use kestrel_core::{ChangeType, ResourceVersion, StoreError, StoreResult};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::{ByteStream, ListOptions, RawList, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    List,
    Get,
    Create,
    Replace,
    Patch,
    Delete,
    Watch,
    Post,
}

struct Watcher {
    namespace: Option<String>,
    selector: Option<String>,
    tx: UnboundedSender<StoreResult<Bytes>>,
}

type ObjectKey = (Option<String>, String);

#[derive(Default)]
struct State {
    /// Keyed by the all-namespaces collection path.
    objects: BTreeMap<String, BTreeMap<ObjectKey, Value>>,
    watchers: BTreeMap<String, Vec<Watcher>>,
    failures: VecDeque<(Verb, String, StoreError)>,
    post_responses: BTreeMap<String, Value>,
    posts: Vec<(String, Vec<(String, String)>, Value)>,
    calls: Vec<(Verb, String)>,
    list_latency: Option<Duration>,
    revision: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    /// Keep the revision counter ahead of versions supplied by tests.
    fn observe_version(&mut self, obj: &Value) {
        if let Some(n) = version_of(obj).and_then(|v| v.parse::<u64>().ok()) {
            self.revision = self.revision.max(n);
        }
    }

    fn take_failure(&mut self, verb: Verb, path: &str) -> Option<StoreError> {
        let idx = self.failures.iter().position(|(v, p, _)| *v == verb && p == path)?;
        self.failures.remove(idx).map(|(_, _, e)| e)
    }

    /// Record the call and pop any injected failure for it.
    fn enter(&mut self, verb: Verb, path: &str) -> StoreResult<()> {
        self.calls.push((verb, path.to_string()));
        match self.take_failure(verb, path) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn broadcast(&mut self, key: &str, line: &[u8], namespace: Option<&str>, labels: Option<&Value>) {
        let Some(watchers) = self.watchers.get_mut(key) else { return };
        watchers.retain(|w| {
            let ns_ok = match (&w.namespace, namespace) {
                (None, _) => true,
                (Some(want), Some(have)) => want == have,
                (Some(_), None) => false,
            };
            let sel_ok = w.selector.as_deref().map(|s| selector_matches(s, labels)).unwrap_or(true);
            if !(ns_ok && sel_ok) {
                return !w.tx.is_closed();
            }
            let mut chunk = line.to_vec();
            chunk.push(b'\n');
            w.tx.unbounded_send(Ok(Bytes::from(chunk))).is_ok()
        });
    }
}

/// `/apis/g/v/namespaces/ns/plural` becomes (`/apis/g/v/plural`, `Some(ns)`).
fn split_collection(path: &str) -> (String, Option<String>) {
    if let Some(idx) = path.find("/namespaces/") {
        let (base, rest) = path.split_at(idx);
        if let Some((ns, plural)) = rest["/namespaces/".len()..].split_once('/') {
            return (format!("{base}/{plural}"), Some(ns.to_string()));
        }
    }
    (path.to_string(), None)
}

fn version_of(obj: &Value) -> Option<&str> { obj.pointer("/metadata/resourceVersion").and_then(Value::as_str) }

fn name_of(obj: &Value) -> Option<&str> { obj.pointer("/metadata/name").and_then(Value::as_str) }

fn namespace_of(obj: &Value) -> Option<String> {
    obj.pointer("/metadata/namespace").and_then(Value::as_str).map(str::to_string)
}

fn meta_mut(obj: &mut Value) -> StoreResult<&mut serde_json::Map<String, Value>> {
    let map = obj.as_object_mut().ok_or_else(|| StoreError::InvalidParams("body must be a JSON object".into()))?;
    map.entry("metadata")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidParams("metadata must be an object".into()))
}

/// `a=b,c` style equality/existence selectors.
fn selector_matches(selector: &str, labels: Option<&Value>) -> bool {
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        let (key, want) = match term.split_once("!=") {
            Some((k, v)) => return labels.and_then(|l| l.get(k.trim())).and_then(Value::as_str) != Some(v.trim()),
            None => match term.split_once('=') {
                Some((k, v)) => (k, Some(v.trim_start_matches('='))),
                None => (term, None),
            },
        };
        let have = labels.and_then(|l| l.get(key.trim())).and_then(Value::as_str);
        match want {
            Some(w) => have == Some(w.trim()),
            None => have.is_some(),
        }
    })
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn change_label(change: ChangeType) -> &'static str {
    match change {
        ChangeType::Added => "ADDED",
        ChangeType::Modified => "MODIFIED",
        ChangeType::Deleted => "DELETED",
    }
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Insert objects; missing uid, resourceVersion and namespace are filled in.
    pub fn seed(&self, collection: &str, items: Vec<Value>) {
        let (key, path_ns) = split_collection(collection);
        let mut st = self.state();
        for mut obj in items {
            st.observe_version(&obj);
            let rv = st.next_version();
            let Ok(meta) = meta_mut(&mut obj) else { continue };
            meta.entry("uid").or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            meta.entry("resourceVersion").or_insert_with(|| Value::String(rv));
            if let Some(ns) = &path_ns {
                meta.entry("namespace").or_insert_with(|| Value::String(ns.clone()));
            }
            let Some(name) = name_of(&obj).map(str::to_string) else { continue };
            let ns = namespace_of(&obj);
            st.objects.entry(key.clone()).or_default().insert((ns, name), obj);
        }
    }

    /// Apply a change server-side and stream it to open watchers. A missing
    /// resourceVersion is assigned from the revision counter.
    pub fn emit(&self, collection: &str, change: ChangeType, mut obj: Value) {
        let (key, _) = split_collection(collection);
        let mut st = self.state();
        st.observe_version(&obj);
        if version_of(&obj).is_none() {
            let rv = st.next_version();
            if let Ok(meta) = meta_mut(&mut obj) {
                meta.insert("resourceVersion".into(), Value::String(rv));
            }
        }
        let ns = namespace_of(&obj);
        if let Some(name) = name_of(&obj).map(str::to_string) {
            let coll = st.objects.entry(key.clone()).or_default();
            match change {
                ChangeType::Deleted => {
                    coll.remove(&(ns.clone(), name));
                }
                _ => {
                    coll.insert((ns.clone(), name), obj.clone());
                }
            }
        }
        let line = json!({ "type": change_label(change), "object": obj }).to_string();
        let labels = obj.pointer("/metadata/labels").cloned();
        st.broadcast(&key, line.as_bytes(), ns.as_deref(), labels.as_ref());
    }

    /// Push one verbatim record to every watcher of the collection.
    pub fn emit_raw(&self, collection: &str, line: &str) {
        let (key, _) = split_collection(collection);
        let mut st = self.state();
        if let Some(watchers) = st.watchers.get_mut(&key) {
            let mut chunk = line.as_bytes().to_vec();
            chunk.push(b'\n');
            watchers.retain(|w| w.tx.unbounded_send(Ok(Bytes::from(chunk.clone()))).is_ok());
        }
    }

    /// Send a 410 ERROR record to every watcher of the collection and close them.
    pub fn expire_watches(&self, collection: &str) {
        let (key, _) = split_collection(collection);
        let line = json!({
            "type": "ERROR",
            "object": {"kind": "Status", "code": 410, "reason": "Expired", "message": "too old resource version"}
        })
        .to_string();
        let mut st = self.state();
        for w in st.watchers.remove(&key).unwrap_or_default() {
            let mut chunk = line.as_bytes().to_vec();
            chunk.push(b'\n');
            let _ = w.tx.unbounded_send(Ok(Bytes::from(chunk)));
        }
    }

    /// End every watch stream on the collection without an error record.
    pub fn close_watches(&self, collection: &str) {
        let (key, _) = split_collection(collection);
        self.state().watchers.remove(&key);
    }

    /// Fail the next `verb` call on exactly `path` with `err`.
    pub fn fail_next(&self, verb: Verb, path: &str, err: StoreError) {
        self.state().failures.push_back((verb, path.to_string(), err));
    }

    /// Delay every list response.
    pub fn set_list_latency(&self, latency: Option<Duration>) { self.state().list_latency = latency; }

    pub fn respond_post(&self, path: &str, body: Value) { self.state().post_responses.insert(path.to_string(), body); }

    pub fn posts(&self) -> Vec<(String, Vec<(String, String)>, Value)> { self.state().posts.clone() }

    pub fn calls(&self) -> Vec<(Verb, String)> { self.state().calls.clone() }

    pub fn count(&self, verb: Verb, path: &str) -> usize {
        self.state().calls.iter().filter(|(v, p)| *v == verb && p == path).count()
    }

    /// Open watch streams on the collection across all namespaces.
    pub fn watcher_count(&self, collection: &str) -> usize {
        let (key, _) = split_collection(collection);
        let mut st = self.state();
        match st.watchers.get_mut(&key) {
            Some(ws) => {
                ws.retain(|w| !w.tx.is_closed());
                ws.len()
            }
            None => 0,
        }
    }

    /// Objects currently held for the collection, filtered by the path's namespace.
    pub fn objects(&self, collection: &str) -> Vec<Value> {
        let (key, ns) = split_collection(collection);
        let st = self.state();
        st.objects
            .get(&key)
            .map(|c| c.iter().filter(|((n, _), _)| ns.is_none() || *n == ns).map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn list(&self, collection: &str, opts: &ListOptions) -> StoreResult<RawList> {
        let latency = {
            let mut st = self.state();
            st.enter(Verb::List, collection)?;
            st.list_latency
        };
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        let (key, ns) = split_collection(collection);
        let st = self.state();
        let items = st
            .objects
            .get(&key)
            .map(|c| {
                c.iter()
                    .filter(|((n, _), _)| ns.is_none() || *n == ns)
                    .filter(|(_, v)| {
                        opts.label_selector
                            .as_deref()
                            .map(|s| selector_matches(s, v.pointer("/metadata/labels")))
                            .unwrap_or(true)
                    })
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(RawList { items, resource_version: Some(ResourceVersion::from(st.revision)), kind: None, api_version: None })
    }

    async fn get(&self, collection: &str, name: &str) -> StoreResult<Value> {
        let mut st = self.state();
        st.enter(Verb::Get, collection)?;
        let (key, ns) = split_collection(collection);
        st.objects
            .get(&key)
            .and_then(|c| c.get(&(ns, name.to_string())))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{collection}/{name}")))
    }

    async fn create(&self, collection: &str, body: &Value) -> StoreResult<Value> {
        let mut st = self.state();
        st.enter(Verb::Create, collection)?;
        let (key, ns) = split_collection(collection);
        let name = name_of(body)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StoreError::InvalidParams("metadata.name required".into()))?
            .to_string();
        if st.objects.get(&key).map(|c| c.contains_key(&(ns.clone(), name.clone()))).unwrap_or(false) {
            return Err(StoreError::Conflict(format!("{collection}/{name} already exists")));
        }
        let rv = st.next_version();
        let mut obj = body.clone();
        let meta = meta_mut(&mut obj)?;
        meta.insert("uid".into(), Value::String(Uuid::new_v4().to_string()));
        meta.insert("resourceVersion".into(), Value::String(rv));
        if let Some(ns) = &ns {
            meta.insert("namespace".into(), Value::String(ns.clone()));
        }
        st.objects.entry(key).or_default().insert((ns, name), obj.clone());
        debug!(collection, "memory: created");
        Ok(obj)
    }

    async fn replace(&self, collection: &str, name: &str, body: &Value) -> StoreResult<Value> {
        let mut st = self.state();
        st.enter(Verb::Replace, collection)?;
        let (key, ns) = split_collection(collection);
        let id = (ns, name.to_string());
        let current = st
            .objects
            .get(&key)
            .and_then(|c| c.get(&id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{collection}/{name}")))?;
        if let Some(sent) = version_of(body).filter(|v| !v.is_empty()) {
            if Some(sent) != version_of(&current) {
                return Err(StoreError::Conflict(format!("{collection}/{name}: resourceVersion {sent} is stale")));
            }
        }
        let rv = st.next_version();
        let uid = current.pointer("/metadata/uid").cloned().unwrap_or(Value::Null);
        let mut obj = body.clone();
        let meta = meta_mut(&mut obj)?;
        meta.insert("uid".into(), uid);
        meta.insert("resourceVersion".into(), Value::String(rv));
        st.objects.entry(key).or_default().insert(id, obj.clone());
        Ok(obj)
    }

    async fn patch(&self, collection: &str, name: &str, patch: &Value) -> StoreResult<Value> {
        let mut st = self.state();
        st.enter(Verb::Patch, collection)?;
        let (key, ns) = split_collection(collection);
        let id = (ns, name.to_string());
        let mut obj = st
            .objects
            .get(&key)
            .and_then(|c| c.get(&id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{collection}/{name}")))?;
        merge_patch(&mut obj, patch);
        let rv = st.next_version();
        meta_mut(&mut obj)?.insert("resourceVersion".into(), Value::String(rv));
        st.objects.entry(key).or_default().insert(id, obj.clone());
        Ok(obj)
    }

    async fn delete(&self, collection: &str, name: &str) -> StoreResult<Value> {
        let mut st = self.state();
        st.enter(Verb::Delete, collection)?;
        let (key, ns) = split_collection(collection);
        st.objects
            .get_mut(&key)
            .and_then(|c| c.remove(&(ns, name.to_string())))
            .ok_or_else(|| StoreError::NotFound(format!("{collection}/{name}")))
    }

    async fn watch(&self, collection: &str, opts: &ListOptions, since: &ResourceVersion) -> StoreResult<ByteStream> {
        let mut st = self.state();
        st.enter(Verb::Watch, collection)?;
        let (key, namespace) = split_collection(collection);
        let (tx, rx) = unbounded();
        st.watchers.entry(key).or_default().push(Watcher { namespace, selector: opts.label_selector.clone(), tx });
        debug!(collection, since = %since, "memory: watch opened");
        Ok(rx.boxed())
    }

    async fn post(&self, path: &str, query: &[(String, String)], body: &Value) -> StoreResult<Value> {
        let mut st = self.state();
        st.enter(Verb::Post, path)?;
        st.posts.push((path.to_string(), query.to_vec(), body.clone()));
        st.post_responses.get(path).cloned().ok_or_else(|| StoreError::NotFound(path.to_string()))
    }
}
