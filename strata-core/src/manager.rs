//! Layer traits
//!
//! Every layer (canonical store, virtual federation, session and transaction
//! overlays) answers lookups through [`ItemStateManager`]. A layer that other
//! overlays can sit on additionally implements [`ItemStateStore`]; a layer
//! that accepts transient modifications implements [`WritableStateManager`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::changelog::ChangeLog;
use crate::error::{Result, StateError};
use crate::id::{ItemId, Name, NodeId, PropertyId};
use crate::listener::{ItemStateListener, Subscription};
use crate::state::{ItemState, NodeReferences, NodeState, PropertyState};
use crate::value::PropertyType;

/// Lookup contract shared by every layer
#[async_trait]
pub trait ItemStateManager: Send + Sync {
    /// Current state of `id`; `NotFound` if no layer knows it
    async fn get_item_state(&self, id: &ItemId) -> Result<ItemState>;

    async fn has_item_state(&self, id: &ItemId) -> Result<bool>;

    /// References pointing at `id`; an empty record if there are none
    async fn get_node_references(&self, id: &NodeId) -> Result<NodeReferences>;

    async fn has_node_references(&self, id: &NodeId) -> Result<bool> {
        Ok(!self.get_node_references(id).await?.is_empty())
    }

    async fn get_node_state(&self, id: &NodeId) -> Result<NodeState> {
        let item = ItemId::Node(*id);
        self.get_item_state(&item)
            .await?
            .into_node()
            .ok_or(StateError::NotFound(item))
    }

    async fn get_property_state(&self, id: &PropertyId) -> Result<PropertyState> {
        let item = ItemId::Property(id.clone());
        self.get_item_state(&item)
            .await?
            .into_property()
            .ok_or(StateError::NotFound(item))
    }
}

/// A layer that can serve as the base of an overlay
#[async_trait]
pub trait ItemStateStore: ItemStateManager {
    /// Validate `changes` against this layer's counters without applying them
    async fn check(&self, changes: &ChangeLog) -> Result<()>;

    /// Apply `changes` atomically: either every entry lands or none does
    async fn apply(&self, changes: ChangeLog) -> Result<()>;

    /// Register for creation, modification and removal events
    fn subscribe(&self, listener: Arc<dyn ItemStateListener>) -> Subscription;

    /// Whether `id` lies in the identifier space of a virtual provider
    fn is_virtual(&self, _id: &NodeId) -> bool {
        false
    }
}

/// Mutation surface of an overlay
#[async_trait]
pub trait WritableStateManager: ItemStateManager {
    /// Create a transient node and link it under `parent`.
    ///
    /// A fresh identifier is generated when `id` is `None`.
    async fn create_node_state(
        &self,
        parent: &NodeId,
        name: Name,
        primary_type: Name,
        id: Option<NodeId>,
    ) -> Result<NodeState>;

    /// A transient property for `parent`, not recorded until passed to `store`.
    ///
    /// `ItemExists` if the parent already has a property of that name.
    async fn create_property_state(
        &self,
        parent: &NodeId,
        name: Name,
        property_type: PropertyType,
        multi_valued: bool,
    ) -> Result<PropertyState>;

    /// Record a new or modified state; new properties are linked into their parent
    async fn store(&self, state: ItemState) -> Result<()>;

    /// Remove an item; nodes are removed with their whole subtree
    async fn destroy(&self, id: &ItemId) -> Result<()>;

    /// Whether there are pending changes
    async fn is_dirty(&self) -> bool;
}
