//! Canonical state store
//!
//! The single shared, cached source of truth for persisted items. Readers
//! take the shared side of a store-wide gate; a change log is validated,
//! persisted and published under the exclusive side, so no reader ever sees a
//! half-applied batch. The cache is an owned LRU; evicted states are simply
//! reloaded from the persistence collaborator.
//!
//! Every applied batch advances a store-wide sequence, and every state the
//! batch writes takes that sequence as its modification counter.

use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::changelog::ChangeLog;
use crate::config::StrataConfig;
use crate::error::{Result, StateError};
use crate::id::{names, ItemId, Name, NodeId, PropertyId};
use crate::listener::{ItemStateEvent, ItemStateListener, ListenerRegistry, Subscription};
use crate::manager::{ItemStateManager, ItemStateStore};
use crate::persistence::{PersistBatch, PersistenceManager};
use crate::state::{ItemState, ItemStatus, NodeReferences, NodeState, PropertyState};
use crate::value::{InternalValue, PropertyType};

/// One reference edge appearing or disappearing in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDelta {
    pub target: NodeId,
    pub property: PropertyId,
    pub weak: bool,
    /// `true` when the edge is added, `false` when it is removed
    pub added: bool,
}

/// Counters reported by [`CanonicalStore::stats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub cached_items: usize,
    pub cache_capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub applied_batches: u64,
    pub duplicate_batches: u64,
    pub sequence: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    applied: AtomicU64,
    duplicates: AtomicU64,
}

pub struct CanonicalStore {
    persistence: Arc<dyn PersistenceManager>,
    cache: Mutex<LruCache<ItemId, ItemState>>,
    references: Mutex<LruCache<NodeId, NodeReferences>>,
    /// Change logs already applied, for retry detection
    applied: Mutex<LruCache<Uuid, ()>>,
    gate: RwLock<()>,
    sequence: AtomicU64,
    listeners: ListenerRegistry,
    counters: Counters,
}

fn capacity(n: usize, what: &str) -> Result<NonZeroUsize> {
    NonZeroUsize::new(n).ok_or_else(|| StateError::Configuration(format!("{} must be positive", what)))
}

impl CanonicalStore {
    /// Open a store over `persistence`, resuming its modification sequence
    pub async fn open(persistence: Arc<dyn PersistenceManager>, config: &StrataConfig) -> Result<Self> {
        let sequence = persistence.load_sequence().await?;
        tracing::debug!("Canonical store opened at sequence {}", sequence);
        Ok(Self {
            persistence,
            cache: Mutex::new(LruCache::new(capacity(config.cache_capacity, "cache_capacity")?)),
            references: Mutex::new(LruCache::new(capacity(
                config.references_cache_capacity,
                "references_cache_capacity",
            )?)),
            applied: Mutex::new(LruCache::new(capacity(
                config.applied_log_retention,
                "applied_log_retention",
            )?)),
            gate: RwLock::new(()),
            sequence: AtomicU64::new(sequence),
            listeners: ListenerRegistry::new(),
            counters: Counters::default(),
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Create the root node if the store is empty. Returns whether it was created.
    pub async fn initialize_root(&self, primary_type: Name) -> Result<bool> {
        if self.has_item_state(&ItemId::Node(NodeId::ROOT)).await? {
            return Ok(false);
        }

        let mut root = NodeState::new(NodeId::ROOT, None, primary_type.clone());
        let type_name = Name::from(names::PRIMARY_TYPE);
        root.property_names.insert(type_name.clone());
        let mut prop = PropertyState::new(PropertyId::new(NodeId::ROOT, type_name), PropertyType::Name, false);
        prop.values.push(InternalValue::Name(primary_type));

        let mut changes = ChangeLog::new();
        changes.added.push(ItemState::Node(root));
        changes.added.push(ItemState::Property(prop));
        self.apply(changes).await?;
        tracing::info!("Initialized repository root {}", NodeId::ROOT);
        Ok(true)
    }

    /// Unconditional upsert of one state; the modification counter advances
    pub async fn store(&self, mut state: ItemState) -> Result<()> {
        state.set_base_mod_count(None);
        let mut changes = ChangeLog::new();
        changes.modified.push(state);
        self.apply(changes).await
    }

    /// Remove the record for `id`. Structure (parent links, children) is the
    /// caller's concern.
    pub async fn destroy(&self, id: &ItemId) -> Result<()> {
        let mut state = self.get_item_state(id).await?;
        state.set_base_mod_count(None);
        let mut changes = ChangeLog::new();
        changes.deleted.push(state);
        self.apply(changes).await
    }

    pub async fn stats(&self) -> StoreStats {
        let cache = self.cache.lock().await;
        StoreStats {
            cached_items: cache.len(),
            cache_capacity: cache.cap().get(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            applied_batches: self.counters.applied.load(Ordering::Relaxed),
            duplicate_batches: self.counters.duplicates.load(Ordering::Relaxed),
            sequence: self.sequence(),
        }
    }

    /// Apply `changes`, treating ids for which `is_virtual` holds as existing
    /// reference targets owned elsewhere.
    ///
    /// Returns the reference edges whose target is virtual; the caller must
    /// forward them to the owning provider.
    pub async fn apply_with(
        &self,
        changes: ChangeLog,
        is_virtual: &(dyn Fn(&NodeId) -> bool + Send + Sync),
    ) -> Result<Vec<ReferenceDelta>> {
        let (events, virtual_deltas) = {
            let _guard = self.gate.write().await;

            if self.applied.lock().await.contains(&changes.id()) {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Change log {} already applied, acknowledging", changes.id());
                return Ok(Vec::new());
            }

            let current = self.validate(&changes).await?;
            let deltas = reference_deltas(&changes, &current);
            self.check_integrity(&changes, &deltas, is_virtual).await?;

            let sequence = self.sequence() + 1;
            let mut batch = PersistBatch {
                sequence,
                ..Default::default()
            };
            let mut events = Vec::with_capacity(changes.len());

            for state in changes.added.iter().chain(changes.modified.iter()) {
                let mut state = state.clone();
                state.set_status(ItemStatus::Existing);
                state.set_mod_count(sequence);
                state.set_base_mod_count(None);
                let id = state.id();
                events.push(if current.contains_key(&id) {
                    ItemStateEvent::modified(id)
                } else {
                    ItemStateEvent::created(id)
                });
                batch.put_states.push(state);
            }
            for state in &changes.deleted {
                let id = state.id();
                if current.contains_key(&id) {
                    batch.delete_states.push(id.clone());
                    events.push(ItemStateEvent::destroyed(id));
                }
            }

            let mut virtual_deltas = Vec::new();
            let mut touched: HashMap<NodeId, NodeReferences> = HashMap::new();
            for delta in deltas {
                if is_virtual(&delta.target) {
                    virtual_deltas.push(delta);
                    continue;
                }
                if !touched.contains_key(&delta.target) {
                    let refs = self.load_references(&delta.target).await?;
                    touched.insert(delta.target, refs);
                }
                if let Some(refs) = touched.get_mut(&delta.target) {
                    if delta.added {
                        refs.add_reference(delta.property, delta.weak);
                    } else {
                        refs.remove_reference(&delta.property);
                    }
                }
            }
            let deleted_nodes: HashSet<NodeId> = changes
                .deleted
                .iter()
                .filter_map(|s| s.as_node().map(|n| n.id))
                .collect();
            for node in &deleted_nodes {
                touched.remove(node);
                batch.delete_references.push(*node);
            }
            for (target, refs) in touched {
                if refs.is_empty() {
                    batch.delete_references.push(target);
                } else {
                    batch.put_references.push(refs);
                }
            }

            self.persistence.store(&batch).await?;

            {
                let mut cache = self.cache.lock().await;
                for id in &batch.delete_states {
                    cache.pop(id);
                }
                for state in &batch.put_states {
                    cache.put(state.id(), state.clone());
                }
            }
            {
                let mut references = self.references.lock().await;
                for id in &batch.delete_references {
                    references.pop(id);
                }
                for refs in &batch.put_references {
                    references.put(refs.target, refs.clone());
                }
            }
            self.applied.lock().await.put(changes.id(), ());
            self.sequence.store(sequence, Ordering::SeqCst);
            self.counters.applied.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Applied change log {} at sequence {} ({} puts, {} deletes)",
                changes.id(),
                sequence,
                batch.put_states.len(),
                batch.delete_states.len()
            );
            (events, virtual_deltas)
        };

        for event in &events {
            self.listeners.notify(event);
        }
        Ok(virtual_deltas)
    }

    /// Check modification counters and creation collisions. Returns the
    /// current state of every entry that exists.
    async fn validate(&self, changes: &ChangeLog) -> Result<HashMap<ItemId, ItemState>> {
        let mut current = HashMap::new();

        for state in changes.modified.iter().chain(changes.deleted.iter()) {
            let id = state.id();
            match (self.load(&id).await?, state.base_mod_count()) {
                (Some(existing), Some(expected)) if existing.mod_count() != expected => {
                    tracing::warn!(
                        "Stale change to {}: base counter {} but store has {}",
                        id,
                        expected,
                        existing.mod_count()
                    );
                    return Err(StateError::Stale(id));
                }
                (Some(existing), _) => {
                    current.insert(id, existing);
                }
                (None, Some(_)) => {
                    tracing::warn!("Stale change to {}: destroyed underneath", id);
                    return Err(StateError::Stale(id));
                }
                (None, None) => {}
            }
        }

        for state in &changes.added {
            let id = state.id();
            if self.load(&id).await?.is_some() {
                return Err(StateError::ItemExists(format!("{} already exists", id)));
            }
        }
        Ok(current)
    }

    async fn check_integrity(
        &self,
        changes: &ChangeLog,
        deltas: &[ReferenceDelta],
        is_virtual: &(dyn Fn(&NodeId) -> bool + Send + Sync),
    ) -> Result<()> {
        let deleted: HashSet<NodeId> = changes
            .deleted
            .iter()
            .filter_map(|s| s.as_node().map(|n| n.id))
            .collect();
        let added: HashSet<NodeId> = changes
            .added
            .iter()
            .filter_map(|s| s.as_node().map(|n| n.id))
            .collect();

        for delta in deltas.iter().filter(|d| d.added && !d.weak) {
            let target = delta.target;
            let exists = added.contains(&target)
                || is_virtual(&target)
                || (!deleted.contains(&target) && self.load(&ItemId::Node(target)).await?.is_some());
            if !exists {
                return Err(StateError::ReferentialIntegrity(format!(
                    "{} references missing node {}",
                    delta.property, target
                )));
            }
        }

        for node in &deleted {
            let mut refs = self.load_references(node).await?;
            for delta in deltas.iter().filter(|d| &d.target == node) {
                if delta.added {
                    refs.add_reference(delta.property.clone(), delta.weak);
                } else {
                    refs.remove_reference(&delta.property);
                }
            }
            if let Some(holder) = refs.references.iter().find(|r| !r.weak) {
                return Err(StateError::ReferentialIntegrity(format!(
                    "node {} is still referenced by {}",
                    node, holder.property
                )));
            }
        }
        Ok(())
    }

    /// Cached or persisted state, `None` if absent
    async fn load(&self, id: &ItemId) -> Result<Option<ItemState>> {
        if let Some(state) = self.cache.lock().await.get(id) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(state.clone()));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let loaded = self.persistence.load(id).await?;
        if let Some(state) = &loaded {
            self.cache.lock().await.put(id.clone(), state.clone());
        }
        Ok(loaded)
    }

    async fn load_references(&self, id: &NodeId) -> Result<NodeReferences> {
        if let Some(refs) = self.references.lock().await.get(id) {
            return Ok(refs.clone());
        }
        match self.persistence.load_references(id).await? {
            Some(refs) => {
                self.references.lock().await.put(*id, refs.clone());
                Ok(refs)
            }
            None => Ok(NodeReferences::new(*id)),
        }
    }
}

/// Reference edges that appear or disappear when `changes` is applied
fn reference_deltas(changes: &ChangeLog, current: &HashMap<ItemId, ItemState>) -> Vec<ReferenceDelta> {
    fn edges(state: Option<&ItemState>) -> BTreeSet<(NodeId, bool)> {
        state
            .and_then(|s| s.as_property())
            .map(|p| {
                p.values
                    .iter()
                    .filter_map(|v| match v {
                        InternalValue::Reference(id) => Some((*id, false)),
                        InternalValue::WeakReference(id) => Some((*id, true)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    let mut deltas = Vec::new();
    for state in changes.entries() {
        let ItemState::Property(prop) = state else {
            continue;
        };
        let id = state.id();
        let before = edges(current.get(&id));
        let after = if changes.is_deleted(&id) {
            BTreeSet::new()
        } else {
            edges(Some(state))
        };
        let old_targets: HashSet<NodeId> = before.iter().map(|(t, _)| *t).collect();
        let new_targets: HashSet<NodeId> = after.iter().map(|(t, _)| *t).collect();

        for (target, weak) in &before {
            if !new_targets.contains(target) {
                deltas.push(ReferenceDelta {
                    target: *target,
                    property: prop.id.clone(),
                    weak: *weak,
                    added: false,
                });
            }
        }
        for (target, weak) in &after {
            if !old_targets.contains(target) {
                deltas.push(ReferenceDelta {
                    target: *target,
                    property: prop.id.clone(),
                    weak: *weak,
                    added: true,
                });
            }
        }
    }
    deltas
}

#[async_trait]
impl ItemStateManager for CanonicalStore {
    async fn get_item_state(&self, id: &ItemId) -> Result<ItemState> {
        let _guard = self.gate.read().await;
        self.load(id).await?.ok_or_else(|| StateError::NotFound(id.clone()))
    }

    async fn has_item_state(&self, id: &ItemId) -> Result<bool> {
        let _guard = self.gate.read().await;
        if self.cache.lock().await.contains(id) {
            return Ok(true);
        }
        self.persistence.exists(id).await
    }

    async fn get_node_references(&self, id: &NodeId) -> Result<NodeReferences> {
        let _guard = self.gate.read().await;
        self.load_references(id).await
    }
}

#[async_trait]
impl ItemStateStore for CanonicalStore {
    async fn check(&self, changes: &ChangeLog) -> Result<()> {
        let _guard = self.gate.read().await;
        if self.applied.lock().await.contains(&changes.id()) {
            return Ok(());
        }
        self.validate(changes).await.map(|_| ())
    }

    async fn apply(&self, changes: ChangeLog) -> Result<()> {
        self.apply_with(changes, &|_: &NodeId| false).await.map(|_| ())
    }

    fn subscribe(&self, listener: Arc<dyn ItemStateListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }
}
