//! Generic resource store: list, watch, reconcile and write through for one
//! logical kind.
//!
//! Mutable state lives behind one mutex and is only touched in short critical
//! sections with no `.await` inside, so applies from different sources never
//! interleave. Every mutation re-sorts the item set and publishes a fresh
//! [`StoreSnapshot`] through an `ArcSwap` (lock-free reads) and a `watch`
//! channel (subscribers), plus a [`StoreChange`] diff on a broadcast channel.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use arc_swap::ArcSwap;
use futures::future::join_all;
use kestrel_core::{
    ChangeType, ItemParams, KindIdentity, KubeObject, ResourceDescriptor, ResourceVersion, StoreError, StoreResult,
    SyncConfig, WatchEvent, WatchNotification,
};
use kestrel_kubehub::backoff::jittered;
use kestrel_kubehub::{ListOptions, ListResult, TransportClient};
use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kinds::KindSpec;
use crate::merge::{dedup_by_uid, MergePolicy};
use crate::snapshot::{Comparator, DegradedSource, LoadState, StoreChange, StoreSnapshot};

/// Parameters for [`ResourceStore::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadParams {
    /// Restrict namespaced sources to these namespaces. Empty means all.
    pub namespaces: Vec<String>,
    pub label_selector: Option<String>,
}

impl LoadParams {
    pub fn namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { namespaces: namespaces.into_iter().map(Into::into).collect(), label_selector: None }
    }

    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

/// Outcome of a successful load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub items: usize,
    pub sources: usize,
    /// Items dropped because they failed to decode.
    pub skipped: usize,
    /// Sources that failed while others succeeded.
    pub degraded: Vec<DegradedSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    /// Not newer than the cached copy; discarded.
    Stale,
    Removed,
    /// Delete for an object the store does not hold.
    Absent,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool { matches!(self, Self::Inserted | Self::Updated | Self::Removed) }
}

/// One list + watch unit: a descriptor, optionally narrowed to a namespace.
struct SourceSpec<T> {
    /// Collection path; doubles as the source's name.
    key: String,
    namespace: Option<String>,
    descriptor: ResourceDescriptor<T>,
}

impl<T> Clone for SourceSpec<T> {
    fn clone(&self) -> Self {
        Self { key: self.key.clone(), namespace: self.namespace.clone(), descriptor: self.descriptor.clone() }
    }
}

struct State<T> {
    items: FxHashMap<String, Arc<T>>,
    /// uid -> key of the source that last delivered it
    origin: FxHashMap<String, String>,
    /// uid -> version at which it was deleted; cleared by every full list.
    tombstones: FxHashMap<String, ResourceVersion>,
    load_state: LoadState,
    /// Resume point per source.
    versions: FxHashMap<String, ResourceVersion>,
    /// Sources whose last list succeeded; these get watched.
    live: Vec<SourceSpec<T>>,
    degraded: Vec<DegradedSource>,
    params: LoadParams,
    session: Option<CancellationToken>,
    subscribers: usize,
    epoch: u64,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            items: FxHashMap::default(),
            origin: FxHashMap::default(),
            tombstones: FxHashMap::default(),
            load_state: LoadState::Idle,
            versions: FxHashMap::default(),
            live: Vec::new(),
            degraded: Vec::new(),
            params: LoadParams::default(),
            session: None,
            subscribers: 0,
            epoch: 0,
        }
    }
}

struct Inner<T: KubeObject> {
    identity: KindIdentity,
    kind_label: String,
    policy: MergePolicy<T>,
    comparator: Comparator<T>,
    client: TransportClient,
    config: SyncConfig,
    /// Bumped by every load and reset; a load whose generation is no longer
    /// current discards its result.
    generation: AtomicU64,
    state: Mutex<State<T>>,
    current: ArcSwap<StoreSnapshot<T>>,
    snapshots: watch::Sender<Arc<StoreSnapshot<T>>>,
    changes: broadcast::Sender<StoreChange<T>>,
}

impl<T: KubeObject> Drop for Inner<T> {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = st.session.take() {
            token.cancel();
        }
    }
}

impl<T: KubeObject> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn notify(&self, change: StoreChange<T>) { let _ = self.changes.send(change); }

    /// Re-sort and publish the current state.
    fn publish(&self, st: &mut State<T>) {
        st.epoch += 1;
        let snap = Arc::new(StoreSnapshot::build(
            st.epoch,
            st.load_state,
            st.degraded.clone(),
            st.items.values().cloned().collect(),
            &self.comparator,
        ));
        gauge!("store_items", snap.len() as f64, "kind" => self.kind_label.clone());
        self.current.store(Arc::clone(&snap));
        self.snapshots.send_replace(snap);
    }

    fn set_state(&self, st: &mut State<T>, next: LoadState) {
        if st.load_state != next {
            st.load_state = next;
            self.notify(StoreChange::StateChanged(next));
        }
    }

    fn resolve_sources(&self, params: &LoadParams) -> Vec<SourceSpec<T>> {
        let namespaces: BTreeSet<&str> = params.namespaces.iter().map(String::as_str).collect();
        let mut out = Vec::new();
        for source in self.policy.sources() {
            let d = &source.descriptor;
            if d.namespaced && !namespaces.is_empty() {
                for &ns in &namespaces {
                    out.push(SourceSpec {
                        key: d.collection_path(Some(ns)),
                        namespace: Some(ns.to_string()),
                        descriptor: d.clone(),
                    });
                }
            } else {
                out.push(SourceSpec { key: d.collection_path(None), namespace: None, descriptor: d.clone() });
            }
        }
        out
    }

    /// Source key a locally written object is attributed to.
    fn source_key(&self, st: &State<T>, index: usize, namespace: Option<&str>) -> String {
        let d = &self.policy.sources()[index].descriptor;
        if d.namespaced && !st.params.namespaces.is_empty() {
            d.collection_path(namespace)
        } else {
            d.collection_path(None)
        }
    }

    /// Recency-checked apply. Deletes always win.
    fn apply_locked(
        &self,
        st: &mut State<T>,
        source: &str,
        change: ChangeType,
        object: Arc<T>,
        version: &ResourceVersion,
    ) -> ApplyOutcome {
        let uid = object.uid().to_string();
        let outcome = match change {
            ChangeType::Deleted => {
                let version = if version.is_empty() { object.resource_version() } else { version };
                let removed = Self::remove_locked(st, &uid, version.clone());
                match removed {
                    Some(prev) => {
                        self.notify(StoreChange::Applied { change, object: prev });
                        ApplyOutcome::Removed
                    }
                    None => ApplyOutcome::Absent,
                }
            }
            ChangeType::Added | ChangeType::Modified => {
                let version = if version.is_empty() { object.resource_version() } else { version };
                let floor = match st.items.get(&uid) {
                    Some(cached) => Some(cached.resource_version()),
                    None => st.tombstones.get(&uid),
                };
                if let Some(floor) = floor.filter(|floor| !version.is_newer_than(floor)) {
                    counter!("store_notifications_stale_total", 1u64, "kind" => self.kind_label.clone());
                    debug!(kind = %self.identity, uid = %uid, incoming = %version, cached = %floor, "stale notification discarded");
                    return ApplyOutcome::Stale;
                }
                let existed = st.items.contains_key(&uid);
                st.tombstones.remove(&uid);
                st.items.insert(uid.clone(), Arc::clone(&object));
                st.origin.insert(uid, source.to_string());
                let change = if existed { ChangeType::Modified } else { ChangeType::Added };
                self.notify(StoreChange::Applied { change, object });
                if existed { ApplyOutcome::Updated } else { ApplyOutcome::Inserted }
            }
        };
        counter!("store_notifications_applied_total", 1u64, "kind" => self.kind_label.clone());
        outcome
    }

    /// Drop `uid` and remember the version it was deleted at, or the cached
    /// copy's version when the delete carries none.
    fn remove_locked(st: &mut State<T>, uid: &str, version: ResourceVersion) -> Option<Arc<T>> {
        st.origin.remove(uid);
        let prev = st.items.remove(uid);
        let cached = prev.as_ref().map(|p| p.resource_version().clone()).unwrap_or_default();
        let buried = match st.tombstones.remove(uid) {
            Some(old) => old.max_of(version),
            None => version,
        };
        let buried = if buried.is_empty() { cached } else { buried.max_of(cached) };
        if !buried.is_empty() {
            st.tombstones.insert(uid.to_string(), buried);
        }
        prev
    }

    fn advance_version(st: &mut State<T>, source: &str, version: ResourceVersion) {
        if version.is_empty() {
            return;
        }
        let entry = st.versions.entry(source.to_string()).or_default();
        *entry = std::mem::take(entry).max_of(version);
    }

    /// Apply a notification delivered by the watch of `source`.
    fn apply_from_source(&self, source: &str, session: &CancellationToken, n: WatchNotification<T>) {
        let mut st = self.lock();
        if session.is_cancelled() {
            return;
        }
        let WatchNotification { change, object, resource_version } = n;
        let outcome = self.apply_locked(&mut st, source, change, Arc::new(object), &resource_version);
        Self::advance_version(&mut st, source, resource_version);
        if outcome.changed() {
            self.publish(&mut st);
        }
    }

    fn bookmark(&self, source: &str, session: &CancellationToken, version: ResourceVersion) {
        let mut st = self.lock();
        if !session.is_cancelled() {
            Self::advance_version(&mut st, source, version);
        }
    }

    /// Replace one source's share of the items with a fresh list.
    fn reconcile(&self, source: &str, session: &CancellationToken, list: ListResult<T>) {
        let mut st = self.lock();
        if session.is_cancelled() {
            return;
        }
        let fresh: FxHashSet<&str> = list.items.iter().map(|o| o.uid()).collect();
        let vanished: Vec<String> = st
            .origin
            .iter()
            .filter(|(uid, from)| from.as_str() == source && !fresh.contains(uid.as_str()))
            .map(|(uid, _)| uid.clone())
            .collect();
        drop(fresh);
        let removed = vanished.len();
        for uid in vanished {
            st.origin.remove(&uid);
            if let Some(prev) = st.items.remove(&uid) {
                self.notify(StoreChange::Applied { change: ChangeType::Deleted, object: prev });
            }
        }
        st.tombstones.clear();
        let total = list.items.len();
        for obj in list.items {
            let version = obj.resource_version().clone();
            self.apply_locked(&mut st, source, ChangeType::Modified, Arc::new(obj), &version);
        }
        st.versions.insert(source.to_string(), list.resource_version);
        st.degraded.retain(|d| d.source != source);
        self.publish(&mut st);
        info!(kind = %self.identity, source = %source, items = total, removed, "store: source re-listed");
    }

    fn degrade(&self, source: &str, session: &CancellationToken, error: StoreError) {
        let mut st = self.lock();
        if session.is_cancelled() {
            return;
        }
        warn!(kind = %self.identity, source = %source, error = %error, "store: source degraded; watch stopped");
        st.degraded.retain(|d| d.source != source);
        st.degraded.push(DegradedSource { source: source.to_string(), error });
        self.publish(&mut st);
    }

    fn source_version(&self, source: &str) -> ResourceVersion { self.lock().versions.get(source).cloned().unwrap_or_default() }
}

enum WatchEnd {
    Gone,
    Dropped,
    Fatal(StoreError),
}

/// Watch one source until the session is cancelled, the store is dropped or
/// the source fails with an error that needs a decision.
async fn watch_source<T: KubeObject>(store: Weak<Inner<T>>, src: SourceSpec<T>, session: CancellationToken) {
    let Some(inner) = store.upgrade() else { return };
    let client = inner.client.clone();
    let backoff = inner.config.watch.clone();
    let selector = inner.lock().params.label_selector.clone();
    let list_opts = ListOptions { label_selector: selector.clone(), timeout_secs: None };
    let watch_opts = ListOptions { label_selector: selector, timeout_secs: Some(inner.config.watch_timeout_secs) };
    let kind = inner.kind_label.clone();
    drop(inner);

    let mut attempt = 0u32;
    loop {
        let Some(since) = store.upgrade().map(|inner| inner.source_version(&src.key)) else { return };
        let opened = tokio::select! {
            () = session.cancelled() => return,
            r = client.open_watch(&src.descriptor, src.namespace.as_deref(), &watch_opts, &since) => r,
        };
        let end = match opened {
            Ok(mut channel) => {
                debug!(kind = %kind, source = %src.key, since = %since, "watch: open");
                let mut seen = false;
                let end = loop {
                    let ev = tokio::select! {
                        () = session.cancelled() => return,
                        ev = channel.next() => ev,
                    };
                    let Some(inner) = store.upgrade() else { return };
                    match ev {
                        Some(Ok(WatchEvent::Notification(n))) => {
                            seen = true;
                            inner.apply_from_source(&src.key, &session, n);
                        }
                        Some(Ok(WatchEvent::Bookmark(rv))) => {
                            seen = true;
                            inner.bookmark(&src.key, &session, rv);
                        }
                        Some(Ok(WatchEvent::Gone)) | Some(Err(StoreError::Gone(_))) => break WatchEnd::Gone,
                        Some(Err(e)) if e.is_transient() => break WatchEnd::Dropped,
                        Some(Err(e)) => break WatchEnd::Fatal(e),
                        None => break WatchEnd::Dropped,
                    }
                };
                if seen {
                    attempt = 0;
                }
                end
            }
            Err(StoreError::Gone(_)) => WatchEnd::Gone,
            Err(e) if e.is_transient() => WatchEnd::Dropped,
            Err(e) => WatchEnd::Fatal(e),
        };

        match end {
            WatchEnd::Gone => {
                counter!("watch_gone_total", 1u64, "kind" => kind.clone());
                info!(kind = %kind, source = %src.key, "watch: resume point expired; re-listing");
                // The old resume point is useless now; retry the list itself.
                loop {
                    let listed = tokio::select! {
                        () = session.cancelled() => return,
                        r = client.list(&src.descriptor, src.namespace.as_deref(), &list_opts) => r,
                    };
                    match listed {
                        Ok(list) => {
                            let Some(inner) = store.upgrade() else { return };
                            inner.reconcile(&src.key, &session, list);
                            attempt = 0;
                            break;
                        }
                        Err(e) if e.is_transient() => {
                            warn!(kind = %kind, source = %src.key, error = %e, "watch: re-list failed; will retry");
                            let delay = jittered(&backoff, attempt);
                            attempt = attempt.saturating_add(1);
                            tokio::select! {
                                () = session.cancelled() => return,
                                () = tokio::time::sleep(delay) => {}
                            }
                        }
                        Err(e) => {
                            if let Some(inner) = store.upgrade() {
                                inner.degrade(&src.key, &session, e);
                            }
                            return;
                        }
                    }
                }
            }
            WatchEnd::Dropped => {
                counter!("watch_reconnects_total", 1u64, "kind" => kind.clone());
                let delay = jittered(&backoff, attempt);
                attempt = attempt.saturating_add(1);
                debug!(kind = %kind, source = %src.key, delay_ms = %delay.as_millis(), "watch: reconnecting");
                tokio::select! {
                    () = session.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            WatchEnd::Fatal(e) => {
                if let Some(inner) = store.upgrade() {
                    inner.degrade(&src.key, &session, e);
                }
                return;
            }
        }
    }
}

fn spawn_watches<T: KubeObject>(inner: &Arc<Inner<T>>, sources: Vec<SourceSpec<T>>, session: &CancellationToken) {
    for src in sources {
        tokio::spawn(watch_source(Arc::downgrade(inner), src, session.clone()));
    }
}

/// Cached, live-synchronized collection for one logical kind. Cheap to clone.
pub struct ResourceStore<T: KubeObject> {
    inner: Arc<Inner<T>>,
}

impl<T: KubeObject> Clone for ResourceStore<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: KubeObject> fmt::Debug for ResourceStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStore")
            .field("identity", &self.inner.identity)
            .field("load_state", &self.load_state())
            .field("items", &self.len())
            .finish()
    }
}

impl<T: KubeObject> ResourceStore<T> {
    pub fn new(spec: KindSpec<T>, client: TransportClient, config: SyncConfig) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(StoreSnapshot::default()));
        let (changes, _) = broadcast::channel(config.event_cap.max(1));
        let KindSpec { identity, policy, comparator } = spec;
        Self {
            inner: Arc::new(Inner {
                kind_label: identity.to_string(),
                identity,
                policy,
                comparator,
                client,
                config,
                generation: AtomicU64::new(0),
                state: Mutex::new(State::default()),
                current: ArcSwap::from_pointee(StoreSnapshot::default()),
                snapshots,
                changes,
            }),
        }
    }

    pub fn identity(&self) -> &KindIdentity { &self.inner.identity }

    pub fn policy(&self) -> &MergePolicy<T> { &self.inner.policy }

    /// Current view; lock-free.
    pub fn snapshot(&self) -> Arc<StoreSnapshot<T>> { self.inner.current.load_full() }

    pub fn load_state(&self) -> LoadState { self.inner.current.load().load_state }

    /// Items in comparator order.
    pub fn items(&self) -> Vec<Arc<T>> { self.snapshot().items().to_vec() }

    pub fn len(&self) -> usize { self.inner.current.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn get_by_id(&self, uid: &str) -> Option<Arc<T>> { self.inner.current.load().get_by_id(uid).cloned() }

    pub fn get_by_name(&self, name: &str, namespace: Option<&str>) -> Option<Arc<T>> {
        self.inner.current.load().get_by_name(name, namespace).cloned()
    }

    pub fn items_in_namespaces(&self, namespaces: &[&str]) -> Vec<Arc<T>> { self.snapshot().in_namespaces(namespaces) }

    /// Whether a watch session is active.
    pub fn is_watching(&self) -> bool { self.inner.lock().session.is_some() }

    /// Resume point per source, sorted by source.
    pub fn source_versions(&self) -> Vec<(String, ResourceVersion)> {
        let mut out: Vec<_> = self.inner.lock().versions.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// List every source, replace the items, then watch each listed source
    /// from its list version. A newer `load` or `reset` supersedes this one.
    pub async fn load(&self, params: LoadParams) -> StoreResult<LoadReport> {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let sources = inner.resolve_sources(&params);
        {
            let mut st = inner.lock();
            if let Some(prev) = st.session.take() {
                prev.cancel();
            }
            let next = match st.load_state {
                LoadState::Ready | LoadState::Refreshing => LoadState::Refreshing,
                _ => LoadState::Loading,
            };
            self.inner.set_state(&mut st, next);
            st.params = params.clone();
            inner.publish(&mut st);
        }
        info!(kind = %inner.identity, sources = sources.len(), namespaces = ?params.namespaces, "store: load start");
        let t0 = Instant::now();
        let opts = ListOptions { label_selector: params.label_selector.clone(), timeout_secs: None };
        let results = join_all(sources.iter().map(|s| inner.client.list(&s.descriptor, s.namespace.as_deref(), &opts))).await;

        let mut batches = Vec::with_capacity(sources.len());
        let mut listed: Vec<(SourceSpec<T>, ResourceVersion)> = Vec::with_capacity(sources.len());
        let mut degraded = Vec::new();
        let mut skipped = 0usize;
        let total_sources = sources.len();
        for (src, res) in sources.into_iter().zip(results) {
            match res {
                Ok(list) => {
                    skipped += list.skipped;
                    batches.push(list.items);
                    listed.push((src, list.resource_version));
                }
                Err(e) => {
                    warn!(kind = %inner.identity, source = %src.key, error = %e, "store: source list failed");
                    degraded.push(DegradedSource { source: src.key, error: e });
                }
            }
        }

        let mut st = inner.lock();
        if inner.generation.load(AtomicOrdering::SeqCst) != generation {
            info!(kind = %inner.identity, "store: load superseded; result discarded");
            return Err(StoreError::Superseded);
        }
        if listed.is_empty() {
            st.degraded = degraded.clone();
            st.live.clear();
            inner.set_state(&mut st, LoadState::Failed);
            inner.publish(&mut st);
            warn!(kind = %inner.identity, failed = degraded.len(), "store: load failed");
            return Err(match degraded.len() {
                1 => degraded.remove(0).error,
                _ => StoreError::Unavailable(
                    degraded.iter().map(|d| format!("{}: {}", d.source, d.error)).collect::<Vec<_>>().join("; "),
                ),
            });
        }

        st.items.clear();
        st.origin.clear();
        st.tombstones.clear();
        for (uid, (idx, obj)) in dedup_by_uid(batches) {
            st.origin.insert(uid.clone(), listed[idx].0.key.clone());
            st.items.insert(uid, Arc::new(obj));
        }
        st.versions = listed.iter().map(|(s, rv)| (s.key.clone(), rv.clone())).collect();
        st.live = listed.into_iter().map(|(s, _)| s).collect();
        st.degraded = degraded.clone();
        inner.set_state(&mut st, LoadState::Ready);
        inner.publish(&mut st);
        let epoch = st.epoch;
        let items = st.items.len();
        let session = CancellationToken::new();
        st.session = Some(session.clone());
        let live = st.live.clone();
        drop(st);

        inner.notify(StoreChange::Reloaded { epoch, items });
        spawn_watches(inner, live, &session);
        let took_ms = t0.elapsed().as_millis();
        histogram!("store_load_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => inner.kind_label.clone());
        info!(kind = %inner.identity, items, skipped, degraded = degraded.len(), took_ms = %took_ms, "store: load ok");
        Ok(LoadReport { items, sources: total_sources, skipped, degraded })
    }

    /// Apply one notification from outside the store's own watches.
    pub fn apply_notification(&self, n: WatchNotification<T>) -> ApplyOutcome {
        let params = ItemParams { name: n.object.name().to_string(), namespace: n.object.namespace().map(str::to_string) };
        let index = self.inner.policy.route_index(&params).unwrap_or(0);
        let mut st = self.inner.lock();
        let source = self.inner.source_key(&st, index, params.namespace.as_deref());
        let WatchNotification { change, object, resource_version } = n;
        let outcome = self.inner.apply_locked(&mut st, &source, change, Arc::new(object), &resource_version);
        if outcome.changed() {
            self.inner.publish(&mut st);
        }
        outcome
    }

    /// Apply a server response as a synthetic notification; returns the cached copy.
    fn apply_response(&self, index: usize, params: &ItemParams, change: ChangeType, object: T) -> Arc<T> {
        let object = Arc::new(object);
        let mut st = self.inner.lock();
        let source = self.inner.source_key(&st, index, params.namespace.as_deref());
        let version = object.resource_version().clone();
        let outcome = self.inner.apply_locked(&mut st, &source, change, Arc::clone(&object), &version);
        if outcome.changed() {
            self.inner.publish(&mut st);
        }
        st.items.get(object.uid()).cloned().unwrap_or(object)
    }

    /// Fetch one object through the routed source and upsert it.
    /// `NotFound` yields `Ok(None)`.
    pub async fn load_item(&self, params: &ItemParams) -> StoreResult<Option<Arc<T>>> {
        let index = self.inner.policy.route_index(params)?;
        let descriptor = &self.inner.policy.sources()[index].descriptor;
        match self.inner.client.get(descriptor, params).await {
            Ok(obj) => Ok(Some(self.apply_response(index, params, ChangeType::Modified, obj))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_item(&self, params: &ItemParams, body: Value) -> StoreResult<Arc<T>> {
        let index = self.inner.policy.route_index(params)?;
        let descriptor = &self.inner.policy.sources()[index].descriptor;
        let created = self.inner.client.create(descriptor, params, body).await?;
        Ok(self.apply_response(index, params, ChangeType::Added, created))
    }

    /// Full replace. A stale `metadata.resourceVersion` in `body` yields `Conflict`.
    pub async fn update_item(&self, params: &ItemParams, body: Value) -> StoreResult<Arc<T>> {
        let index = self.inner.policy.route_index(params)?;
        let descriptor = &self.inner.policy.sources()[index].descriptor;
        let updated = self.inner.client.update(descriptor, params, body).await?;
        Ok(self.apply_response(index, params, ChangeType::Modified, updated))
    }

    /// JSON merge patch.
    pub async fn patch_item(&self, params: &ItemParams, patch: Value) -> StoreResult<Arc<T>> {
        let index = self.inner.policy.route_index(params)?;
        let descriptor = &self.inner.policy.sources()[index].descriptor;
        let patched = self.inner.client.patch(descriptor, params, patch).await?;
        Ok(self.apply_response(index, params, ChangeType::Modified, patched))
    }

    /// Delete on the server, then drop the cached copy unconditionally.
    pub async fn remove_item(&self, params: &ItemParams) -> StoreResult<Option<Arc<T>>> {
        let index = self.inner.policy.route_index(params)?;
        let descriptor = &self.inner.policy.sources()[index].descriptor;
        let response = self.inner.client.delete(descriptor, params).await?;
        let mut st = self.inner.lock();
        let uid = match &response {
            Some(obj) => Some(obj.uid().to_string()),
            None => st
                .items
                .values()
                .find(|o| o.name() == params.name && o.namespace() == params.namespace.as_deref())
                .map(|o| o.uid().to_string()),
        };
        let version = response.as_ref().map(|o| o.resource_version().clone()).unwrap_or_default();
        let removed = uid.and_then(|uid| Inner::remove_locked(&mut st, &uid, version));
        if let Some(prev) = &removed {
            self.inner.notify(StoreChange::Applied { change: ChangeType::Deleted, object: Arc::clone(prev) });
            self.inner.publish(&mut st);
        }
        Ok(removed.or_else(|| response.map(Arc::new)))
    }

    /// Stop watches, keep items.
    pub fn stop(&self) {
        if let Some(session) = self.inner.lock().session.take() {
            session.cancel();
            info!(kind = %self.inner.identity, "store: watches stopped");
        }
    }

    /// Drop items, stop watches and return to `Idle`. Supersedes any in-flight load.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, AtomicOrdering::SeqCst);
        let mut st = self.inner.lock();
        if let Some(session) = st.session.take() {
            session.cancel();
        }
        st.items.clear();
        st.origin.clear();
        st.tombstones.clear();
        st.versions.clear();
        st.live.clear();
        st.degraded.clear();
        st.params = LoadParams::default();
        self.inner.set_state(&mut st, LoadState::Idle);
        self.inner.publish(&mut st);
        self.inner.notify(StoreChange::Reset);
        debug!(kind = %self.inner.identity, "store: reset");
    }

    /// Register interest in live updates. The first subscriber after the last
    /// one left restarts watches from the retained resume points.
    pub fn subscribe(&self) -> Subscription<T> {
        let inner = &self.inner;
        let mut st = inner.lock();
        st.subscribers += 1;
        if st.session.is_none() && st.load_state == LoadState::Ready && !st.live.is_empty() {
            let session = CancellationToken::new();
            st.session = Some(session.clone());
            let live = st.live.clone();
            drop(st);
            info!(kind = %inner.identity, sources = live.len(), "store: resuming watches");
            spawn_watches(inner, live, &session);
        }
        Subscription {
            store: Arc::downgrade(inner),
            snapshots: inner.snapshots.subscribe(),
            changes: inner.changes.subscribe(),
            active: true,
        }
    }

    pub fn subscriber_count(&self) -> usize { self.inner.lock().subscribers }
}

/// Live view handle. Dropping it unsubscribes.
pub struct Subscription<T: KubeObject> {
    store: Weak<Inner<T>>,
    snapshots: watch::Receiver<Arc<StoreSnapshot<T>>>,
    changes: broadcast::Receiver<StoreChange<T>>,
    active: bool,
}

impl<T: KubeObject> Subscription<T> {
    pub fn snapshot(&self) -> Arc<StoreSnapshot<T>> { self.snapshots.borrow().clone() }

    /// Receiver of whole snapshots; always holds the latest.
    pub fn snapshots(&self) -> watch::Receiver<Arc<StoreSnapshot<T>>> { self.snapshots.clone() }

    /// Wait for the next published snapshot. `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<Arc<StoreSnapshot<T>>> {
        self.snapshots.changed().await.ok()?;
        Some(self.snapshots.borrow_and_update().clone())
    }

    /// Next diff. Lagging receivers skip ahead; `None` once the store is gone.
    pub async fn next_change(&mut self) -> Option<StoreChange<T>> {
        loop {
            match self.changes.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "subscription lagged; diffs dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Idempotent. The last subscriber leaving stops watches; items are kept.
    pub fn unsubscribe(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        let Some(inner) = self.store.upgrade() else { return };
        let mut st = inner.lock();
        st.subscribers = st.subscribers.saturating_sub(1);
        if st.subscribers == 0 {
            if let Some(session) = st.session.take() {
                session.cancel();
                info!(kind = %inner.identity, "store: last subscriber left; watches stopped");
            }
        }
    }
}

impl<T: KubeObject> Drop for Subscription<T> {
    fn drop(&mut self) { self.unsubscribe(); }
}
