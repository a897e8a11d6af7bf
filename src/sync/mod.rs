//! Reconciliation engine keeping the local mirror in step with the remote tracker.
//!
//! - `reconcile`: minimal diff between a mirrored collection and a fetched list
//! - `consistency`: status-label repair and best-effort upstream fixes
//! - `store`: the observable in-memory collections
//! - `coordinator`: fetch / repair / reconcile / persist cycles

pub mod consistency;
pub mod coordinator;
pub mod policy;
pub mod reconcile;
pub mod remote;
pub mod store;

#[cfg(test)]
pub mod testing;

pub use coordinator::{
  LoadSource, Notice, RemoteSnapshot, SyncCoordinator, SyncMessage, SyncPhase, SyncSettings,
};
pub use policy::StatusLabelPolicy;
pub use remote::{FetchOutcome, FetchRequest, Payload, RemoteWriter, ResourceFetcher};
pub use store::{CacheMeta, CacheMetadata, Change, ResourceStore, Shared, SubscriptionId};
