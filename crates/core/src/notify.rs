use serde::{Deserialize, Serialize};

use crate::object::{KubeObject, ResourceVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// One incremental change for one object.
#[derive(Debug, Clone)]
pub struct WatchNotification<T> {
    pub change: ChangeType,
    pub object: T,
    pub resource_version: ResourceVersion,
}

impl<T: KubeObject> WatchNotification<T> {
    /// Notification carrying the object's own resourceVersion.
    pub fn new(change: ChangeType, object: T) -> Self {
        let resource_version = object.resource_version().clone();
        Self { change, object, resource_version }
    }

    pub fn added(object: T) -> Self { Self::new(ChangeType::Added, object) }
    pub fn modified(object: T) -> Self { Self::new(ChangeType::Modified, object) }
    pub fn deleted(object: T) -> Self { Self::new(ChangeType::Deleted, object) }
}

/// Item of a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Notification(WatchNotification<T>),
    /// Progress marker: the source is current up to this version.
    Bookmark(ResourceVersion),
    /// Resume point expired; the stream ends after this.
    Gone,
}
