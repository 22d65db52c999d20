//! Persistence collaborators implementing the repository contracts.
//!
//! - [`SqliteStore`] - the durable store the daemon runs on
//! - [`MemoryStore`] - in-process store with failure injection, for tests

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

/// Lifecycle hook for the storage handle, called once at shutdown.
#[async_trait]
pub trait StoreLifecycle: Send + Sync {
    async fn close(&self);
}
