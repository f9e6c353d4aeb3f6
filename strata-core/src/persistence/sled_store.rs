//! sled-backed persistence
//!
//! All records live in one sled tree. Keys are prefixed by record kind:
//!   `n` + node uuid                 → bincode `NodeState`
//!   `p` + parent uuid + name bytes  → bincode `PropertyState`
//!   `r` + target uuid               → bincode `NodeReferences`
//!   `m` + "sequence"                → big-endian u64
//!
//! A batch is written with `apply_batch`, so a crash never leaves a
//! half-applied change log behind.

use async_trait::async_trait;
use std::path::Path;

use super::{PersistBatch, PersistenceManager};
use crate::error::{Result, StateError};
use crate::id::{ItemId, NodeId};
use crate::state::{ItemState, NodeReferences, NodeState, PropertyState};

const SEQUENCE_KEY: &[u8] = b"msequence";

fn item_key(id: &ItemId) -> Vec<u8> {
    match id {
        ItemId::Node(node) => {
            let mut key = Vec::with_capacity(17);
            key.push(b'n');
            key.extend_from_slice(node.as_uuid().as_bytes());
            key
        }
        ItemId::Property(prop) => {
            let name = prop.name().as_str().as_bytes();
            let mut key = Vec::with_capacity(17 + name.len());
            key.push(b'p');
            key.extend_from_slice(prop.parent().as_uuid().as_bytes());
            key.extend_from_slice(name);
            key
        }
    }
}

fn references_key(id: &NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(b'r');
    key.extend_from_slice(id.as_uuid().as_bytes());
    key
}

fn encode_state(state: &ItemState) -> Result<Vec<u8>> {
    Ok(match state {
        ItemState::Node(n) => bincode::serialize(n)?,
        ItemState::Property(p) => bincode::serialize(p)?,
    })
}

fn decode_state(id: &ItemId, bytes: &[u8]) -> Result<ItemState> {
    Ok(match id {
        ItemId::Node(_) => ItemState::Node(bincode::deserialize::<NodeState>(bytes)?),
        ItemId::Property(_) => ItemState::Property(bincode::deserialize::<PropertyState>(bytes)?),
    })
}

/// Persistence manager storing bincode records in an embedded sled database
pub struct SledPersistenceManager {
    db: sled::Db,
}

impl SledPersistenceManager {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| {
            StateError::Persistence(format!("Failed to open sled database at {:?}: {}", path, e))
        })?;
        tracing::debug!("Opened sled persistence at {:?} ({} records)", path, db.len());
        Ok(Self { db })
    }

    /// Number of records of every kind
    pub fn record_count(&self) -> usize {
        self.db.len()
    }

    /// Every persisted item state; used by dump tooling
    pub fn scan_states(&self) -> Result<Vec<ItemState>> {
        let mut states = Vec::new();
        for prefix in [b"n", b"p"] {
            for item in self.db.scan_prefix(prefix) {
                let (_, value) = item?;
                let state = if prefix == b"n" {
                    ItemState::Node(bincode::deserialize::<NodeState>(&value)?)
                } else {
                    ItemState::Property(bincode::deserialize::<PropertyState>(&value)?)
                };
                states.push(state);
            }
        }
        Ok(states)
    }
}

#[async_trait]
impl PersistenceManager for SledPersistenceManager {
    async fn load(&self, id: &ItemId) -> Result<Option<ItemState>> {
        match self.db.get(item_key(id))? {
            Some(value) => Ok(Some(decode_state(id, &value)?)),
            None => Ok(None),
        }
    }

    async fn exists(&self, id: &ItemId) -> Result<bool> {
        Ok(self.db.contains_key(item_key(id))?)
    }

    async fn load_references(&self, id: &NodeId) -> Result<Option<NodeReferences>> {
        match self.db.get(references_key(id))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    async fn load_sequence(&self) -> Result<u64> {
        match self.db.get(SEQUENCE_KEY)? {
            Some(value) => {
                let bytes: [u8; 8] = value.as_ref().try_into().map_err(|_| {
                    StateError::Serialization(format!("Corrupt sequence record ({} bytes)", value.len()))
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    async fn store(&self, batch: &PersistBatch) -> Result<()> {
        let mut writes = sled::Batch::default();
        for id in &batch.delete_states {
            writes.remove(item_key(id));
        }
        for state in &batch.put_states {
            writes.insert(item_key(&state.id()), encode_state(state)?);
        }
        for id in &batch.delete_references {
            writes.remove(references_key(id));
        }
        for refs in &batch.put_references {
            writes.insert(references_key(&refs.target), bincode::serialize(refs)?);
        }
        writes.insert(SEQUENCE_KEY, batch.sequence.to_be_bytes().to_vec());

        self.db.apply_batch(writes)?;
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Name, PropertyId};
    use crate::value::{InternalValue, PropertyType};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.db");

        let node = NodeState::new(NodeId::generate(), Some(NodeId::root()), Name::from("nt:unstructured"));
        let mut prop = PropertyState::new(
            PropertyId::new(node.id, Name::from("title")),
            PropertyType::String,
            false,
        );
        prop.values.push(InternalValue::String("hello".into()));
        let mut refs = NodeReferences::new(node.id);
        refs.add_reference(PropertyId::new(NodeId::root(), Name::from("link")), false);

        {
            let pm = SledPersistenceManager::open(&path).unwrap();
            pm.store(&PersistBatch {
                sequence: 9,
                put_states: vec![ItemState::Node(node.clone()), ItemState::Property(prop.clone())],
                put_references: vec![refs.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let pm = SledPersistenceManager::open(&path).unwrap();
        assert_eq!(pm.load_sequence().await.unwrap(), 9);
        assert_eq!(
            pm.load(&ItemId::Node(node.id)).await.unwrap(),
            Some(ItemState::Node(node.clone()))
        );
        assert_eq!(
            pm.load(&ItemId::Property(prop.id.clone())).await.unwrap(),
            Some(ItemState::Property(prop))
        );
        assert_eq!(pm.load_references(&node.id).await.unwrap(), Some(refs));
        assert_eq!(pm.scan_states().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let temp = TempDir::new().unwrap();
        let pm = SledPersistenceManager::open(temp.path().join("state.db")).unwrap();
        let node = NodeState::new(NodeId::generate(), None, Name::from("nt:base"));
        let id = ItemId::Node(node.id);

        pm.store(&PersistBatch {
            sequence: 1,
            put_states: vec![ItemState::Node(node)],
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(pm.exists(&id).await.unwrap());

        pm.store(&PersistBatch {
            sequence: 2,
            delete_states: vec![id.clone()],
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(!pm.exists(&id).await.unwrap());
        assert_eq!(pm.load(&id).await.unwrap(), None);
    }
}
