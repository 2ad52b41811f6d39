//! Immutable read views published by a store.

use std::cmp::Ordering;
use std::sync::Arc;

use kestrel_core::{ChangeType, KubeObject, StoreError};
use rustc_hash::FxHashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LoadState {
    Idle,
    Loading,
    Ready,
    Refreshing,
    Failed,
}

/// A source whose list or watch failed with an error that needs a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedSource {
    /// Collection path of the source.
    pub source: String,
    pub error: StoreError,
}

/// Item order for a store's sorted view.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Default order: kind, then name (case-sensitive).
pub fn by_kind_then_name<T: KubeObject>(a: &T, b: &T) -> Ordering { a.kind().cmp(b.kind()).then_with(|| a.name().cmp(b.name())) }

/// Sorted, indexed view of a store at one epoch.
#[derive(Debug)]
pub struct StoreSnapshot<T> {
    pub epoch: u64,
    pub load_state: LoadState,
    pub degraded: Vec<DegradedSource>,
    items: Vec<Arc<T>>,
    by_uid: FxHashMap<String, usize>,
    by_name: FxHashMap<(Option<String>, String), usize>,
}

impl<T> Default for StoreSnapshot<T> {
    fn default() -> Self {
        Self {
            epoch: 0,
            load_state: LoadState::Idle,
            degraded: Vec::new(),
            items: Vec::new(),
            by_uid: FxHashMap::default(),
            by_name: FxHashMap::default(),
        }
    }
}

impl<T: KubeObject> StoreSnapshot<T> {
    /// Sort `items` by `cmp` (uid breaks ties) and index them.
    pub fn build(
        epoch: u64,
        load_state: LoadState,
        degraded: Vec<DegradedSource>,
        mut items: Vec<Arc<T>>,
        cmp: &Comparator<T>,
    ) -> Self {
        items.sort_by(|a, b| cmp(&**a, &**b).then_with(|| a.uid().cmp(b.uid())));
        let mut by_uid = FxHashMap::default();
        let mut by_name = FxHashMap::default();
        by_uid.reserve(items.len());
        by_name.reserve(items.len());
        for (i, it) in items.iter().enumerate() {
            by_uid.insert(it.uid().to_string(), i);
            by_name.insert((it.namespace().map(str::to_string), it.name().to_string()), i);
        }
        Self { epoch, load_state, degraded, items, by_uid, by_name }
    }

    /// Items in comparator order.
    pub fn items(&self) -> &[Arc<T>] { &self.items }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn get_by_id(&self, uid: &str) -> Option<&Arc<T>> { self.by_uid.get(uid).map(|&i| &self.items[i]) }

    pub fn get_by_name(&self, name: &str, namespace: Option<&str>) -> Option<&Arc<T>> {
        self.by_name
            .get(&(namespace.map(str::to_string), name.to_string()))
            .map(|&i| &self.items[i])
    }

    /// Items in any of `namespaces`, in comparator order. Empty means all.
    pub fn in_namespaces(&self, namespaces: &[&str]) -> Vec<Arc<T>> {
        if namespaces.is_empty() {
            return self.items.clone();
        }
        self.items
            .iter()
            .filter(|it| it.namespace().map(|ns| namespaces.contains(&ns)).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn is_degraded(&self) -> bool { !self.degraded.is_empty() }
}

/// Diff pushed to subscribers after each store mutation.
#[derive(Debug, Clone)]
pub enum StoreChange<T> {
    Applied { change: ChangeType, object: Arc<T> },
    /// Items were replaced by a list; carries the new epoch.
    Reloaded { epoch: u64, items: usize },
    StateChanged(LoadState),
    Reset,
}
