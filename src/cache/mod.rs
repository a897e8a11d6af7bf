//! Durable project snapshots for warm starts and offline use.
//!
//! A snapshot holds the four durable collections of a project plus their
//! freshness tokens. Writes replace the stored snapshot wholesale; reads back
//! it feed the warm-start path of the sync coordinator.

mod storage;
mod traits;

pub use storage::{NoopStorage, SqliteStorage};
pub use traits::{PersistenceGateway, Snapshot};
