//! In-memory persistence backend

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::{PersistBatch, PersistenceManager};
use crate::error::{Result, StateError};
use crate::id::{ItemId, NodeId};
use crate::state::{ItemState, NodeReferences};

#[derive(Default)]
struct Tables {
    states: HashMap<ItemId, ItemState>,
    references: HashMap<NodeId, NodeReferences>,
    sequence: u64,
}

/// Persistence manager holding every record in memory
#[derive(Default)]
pub struct MemoryPersistenceManager {
    tables: RwLock<Tables>,
    /// Number of `load` calls served
    loads: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryPersistenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many item loads reached this backend
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Make every following `store` fail, simulating a backend outage
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.states.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PersistenceManager for MemoryPersistenceManager {
    async fn load(&self, id: &ItemId) -> Result<Option<ItemState>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables.read().await.states.get(id).cloned())
    }

    async fn exists(&self, id: &ItemId) -> Result<bool> {
        Ok(self.tables.read().await.states.contains_key(id))
    }

    async fn load_references(&self, id: &NodeId) -> Result<Option<NodeReferences>> {
        Ok(self.tables.read().await.references.get(id).cloned())
    }

    async fn load_sequence(&self) -> Result<u64> {
        Ok(self.tables.read().await.sequence)
    }

    async fn store(&self, batch: &PersistBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StateError::Persistence("memory backend is refusing writes".into()));
        }

        let mut tables = self.tables.write().await;
        for id in &batch.delete_states {
            tables.states.remove(id);
        }
        for state in &batch.put_states {
            tables.states.insert(state.id(), state.clone());
        }
        for id in &batch.delete_references {
            tables.references.remove(id);
        }
        for refs in &batch.put_references {
            tables.references.insert(refs.target, refs.clone());
        }
        tables.sequence = batch.sequence;
        Ok(())
    }
}
