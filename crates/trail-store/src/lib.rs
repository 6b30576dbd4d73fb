//! Version store implementations.

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryVersionStore;
pub use trail_types::{StoreError, VersionStore, VersionTransaction};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteVersionStore;
