//! Kestrel store: per-kind caches kept in sync by list + watch, with merged
//! multi-source kinds and an explicit registry.

#![forbid(unsafe_code)]

pub mod kinds;
pub mod merge;
pub mod registry;
pub mod snapshot;
pub mod store;

pub use kinds::KindSpec;
pub use merge::{route_by_namespace, MergePolicy, Source, SourceScope};
pub use registry::{RegistryError, StoreRegistry};
pub use snapshot::{by_kind_then_name, Comparator, DegradedSource, LoadState, StoreChange, StoreSnapshot};
pub use store::{ApplyOutcome, LoadParams, LoadReport, ResourceStore, Subscription};
