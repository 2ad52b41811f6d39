//! Kestrel core types: resource objects, endpoint descriptors, watch
//! notifications, the error taxonomy and sync configuration.

#![forbid(unsafe_code)]

pub mod config;
pub mod descriptor;
pub mod error;
pub mod notify;
pub mod object;
pub mod units;

pub use config::{Backoff, SyncConfig};
pub use descriptor::{DecodeFn, ItemParams, KindIdentity, ResourceDescriptor, ScopeKind};
pub use error::{StoreError, StoreResult};
pub use notify::{ChangeType, WatchEvent, WatchNotification};
pub use object::{KubeObject, ObjectMeta, ResourceObject, ResourceVersion};

pub mod prelude {
    pub use super::{
        ChangeType, ItemParams, KindIdentity, KubeObject, ObjectMeta, ResourceDescriptor, ResourceObject,
        ResourceVersion, StoreError, StoreResult, WatchEvent, WatchNotification,
    };
}
