//! Explicit registry of stores keyed by kind identity.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kestrel_core::{KindIdentity, KubeObject, ResourceDescriptor};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::store::ResourceStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Same identity, different endpoints.
    #[error("{kind}: already registered with different descriptors ({existing} vs {requested})")]
    Conflict { kind: KindIdentity, existing: String, requested: String },
    #[error("{kind}: registered with a different item type")]
    TypeMismatch { kind: KindIdentity },
    #[error("factory for {requested} built a store for {built}")]
    IdentityMismatch { requested: KindIdentity, built: KindIdentity },
}

/// Type-erased view of a registered store.
trait RegisteredStore: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn fingerprint(&self) -> String;
    fn owns_path(&self, path: &str) -> bool;
    fn stop(&self);
}

impl<T: KubeObject> RegisteredStore for ResourceStore<T> {
    fn as_any(&self) -> &dyn Any { self }

    fn fingerprint(&self) -> String { self.policy().fingerprint() }

    fn owns_path(&self, path: &str) -> bool { self.policy().sources().iter().any(|s| descriptor_owns(&s.descriptor, path)) }

    fn stop(&self) { ResourceStore::stop(self) }
}

/// Whether `path` addresses the descriptor's collection or one of its items.
fn descriptor_owns<T>(d: &ResourceDescriptor<T>, path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
    let Some(rest) = path.strip_prefix(d.api_base.as_str()) else { return false };
    let Some(rest) = rest.strip_prefix('/') else { return false };
    let rest = match rest.strip_prefix("namespaces/") {
        Some(after) if d.namespaced => match after.split_once('/') {
            Some((_, tail)) => tail,
            None => return false,
        },
        _ => rest,
    };
    let mut segs = rest.split('/');
    segs.next() == Some(d.plural.as_str()) && segs.count() <= 1
}

/// Stores keyed by `(apiVersion, kind)`. Construction is single-flight: the
/// factory runs under the registry lock, so concurrent first callers get the
/// same instance.
#[derive(Default)]
pub struct StoreRegistry {
    stores: Mutex<FxHashMap<KindIdentity, Arc<dyn RegisteredStore>>>,
}

impl StoreRegistry {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<KindIdentity, Arc<dyn RegisteredStore>>> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downcast<T: KubeObject>(kind: &KindIdentity, entry: &Arc<dyn RegisteredStore>) -> Result<ResourceStore<T>, RegistryError> {
        entry
            .as_any()
            .downcast_ref::<ResourceStore<T>>()
            .cloned()
            .ok_or_else(|| RegistryError::TypeMismatch { kind: kind.clone() })
    }

    /// Existing store for `kind`, or the one `factory` builds. The factory runs
    /// at most once per identity.
    pub fn get_or_create<T, F>(&self, kind: &KindIdentity, factory: F) -> Result<ResourceStore<T>, RegistryError>
    where
        T: KubeObject,
        F: FnOnce() -> ResourceStore<T>,
    {
        let mut stores = self.lock();
        if let Some(entry) = stores.get(kind) {
            return Self::downcast(kind, entry);
        }
        let store = factory();
        if store.identity() != kind {
            return Err(RegistryError::IdentityMismatch { requested: kind.clone(), built: store.identity().clone() });
        }
        info!(kind = %kind, sources = store.policy().sources().len(), "registry: store created");
        stores.insert(kind.clone(), Arc::new(store.clone()));
        Ok(store)
    }

    /// Register a prebuilt store. Re-registering the same endpoints returns the
    /// existing instance; different endpoints are a `Conflict`.
    pub fn register<T: KubeObject>(&self, store: ResourceStore<T>) -> Result<ResourceStore<T>, RegistryError> {
        let kind = store.identity().clone();
        let mut stores = self.lock();
        if let Some(entry) = stores.get(&kind) {
            let existing = entry.fingerprint();
            let requested = store.policy().fingerprint();
            if existing != requested {
                return Err(RegistryError::Conflict { kind, existing, requested });
            }
            debug!(kind = %kind, "registry: already registered");
            return Self::downcast(&kind, entry);
        }
        stores.insert(kind.clone(), Arc::new(store.clone()));
        info!(kind = %kind, "registry: store registered");
        Ok(store)
    }

    pub fn get<T: KubeObject>(&self, kind: &KindIdentity) -> Option<ResourceStore<T>> {
        self.lock().get(kind).and_then(|e| Self::downcast(kind, e).ok())
    }

    /// Stop the store's watches and forget it. `false` if it was not registered.
    pub fn dispose(&self, kind: &KindIdentity) -> bool {
        let Some(entry) = self.lock().remove(kind) else { return false };
        entry.stop();
        info!(kind = %kind, "registry: store disposed");
        true
    }

    /// Registered identities, sorted.
    pub fn kinds(&self) -> Vec<KindIdentity> {
        let mut out: Vec<_> = self.lock().keys().cloned().collect();
        out.sort();
        out
    }

    /// Identity of the store whose sources serve `path`.
    pub fn kind_for_path(&self, path: &str) -> Option<KindIdentity> {
        self.lock().iter().find(|(_, e)| e.owns_path(path)).map(|(k, _)| k.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_match_collections_and_items_only() {
        let pods = ResourceDescriptor::dynamic("v1", "Pod", "pods", true);
        let namespaces = ResourceDescriptor::dynamic("v1", "Namespace", "namespaces", false);
        assert!(descriptor_owns(&pods, "/api/v1/pods"));
        assert!(descriptor_owns(&pods, "/api/v1/namespaces/a/pods/web-0"));
        assert!(descriptor_owns(&pods, "/api/v1/namespaces/a/pods?watch=true"));
        assert!(!descriptor_owns(&pods, "/api/v1/namespaces/a"));
        assert!(descriptor_owns(&namespaces, "/api/v1/namespaces/a"));
        assert!(!descriptor_owns(&namespaces, "/api/v1/namespaces/a/pods"));
        assert!(!descriptor_owns(&pods, "/apis/apps/v1/namespaces/a/pods"));
    }
}
