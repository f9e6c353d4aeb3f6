//! Persistence collaborator interface
//!
//! The canonical store reads item states from a persistence manager on cache
//! miss and writes every committed change log through it as one atomic batch.
//! Two backends are bundled:
//! - [`MemoryPersistenceManager`] keeps everything in memory (tests, scratch repositories)
//! - [`SledPersistenceManager`] stores bincode records in a sled database

use async_trait::async_trait;

use crate::error::Result;
use crate::id::{ItemId, NodeId};
use crate::state::{ItemState, NodeReferences};

mod memory;
mod sled_store;

pub use memory::MemoryPersistenceManager;
pub use sled_store::SledPersistenceManager;

/// One atomic write against the backend
#[derive(Debug, Clone, Default)]
pub struct PersistBatch {
    /// Store-wide modification sequence after this batch
    pub sequence: u64,
    pub put_states: Vec<ItemState>,
    pub delete_states: Vec<ItemId>,
    pub put_references: Vec<NodeReferences>,
    pub delete_references: Vec<NodeId>,
}

impl PersistBatch {
    pub fn is_empty(&self) -> bool {
        self.put_states.is_empty()
            && self.delete_states.is_empty()
            && self.put_references.is_empty()
            && self.delete_references.is_empty()
    }
}

/// Durable record storage keyed by item identifier
#[async_trait]
pub trait PersistenceManager: Send + Sync {
    async fn load(&self, id: &ItemId) -> Result<Option<ItemState>>;

    async fn exists(&self, id: &ItemId) -> Result<bool>;

    async fn load_references(&self, id: &NodeId) -> Result<Option<NodeReferences>>;

    /// Last persisted modification sequence (0 for an empty store)
    async fn load_sequence(&self) -> Result<u64>;

    /// Apply `batch` atomically
    async fn store(&self, batch: &PersistBatch) -> Result<()>;
}
