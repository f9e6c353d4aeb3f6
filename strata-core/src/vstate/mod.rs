//! Virtual item state providers
//!
//! A provider answers for a computed subtree mounted at a fixed root id. It
//! is queried through the same lookup contract as the canonical store and
//! publishes change events through the same listener protocol. Providers own
//! a reserved [`IdRange`] so that routing by identifier needs no lookup.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::id::{IdRange, ItemId, Name, NodeId};
use crate::listener::{ItemStateListener, Subscription};
use crate::manager::ItemStateManager;
use crate::state::{NodeReferences, NodeState, PropertyState};
use crate::value::PropertyType;

mod nodetypes;
mod tree;

pub use nodetypes::node_type_tree;
pub use tree::VirtualTreeProvider;

#[async_trait]
pub trait VirtualItemStateProvider: ItemStateManager {
    /// Whether `id` is the root of this provider's subtree
    fn is_virtual_root(&self, id: &ItemId) -> bool {
        matches!(id, ItemId::Node(node) if *node == self.virtual_root_id())
    }

    fn virtual_root_id(&self) -> NodeId;

    /// Identifier sub-range reserved for this provider, if any
    fn reserved_range(&self) -> Option<IdRange>;

    /// Whether this provider answers for `id`
    fn owns(&self, id: &NodeId) -> bool {
        *id == self.virtual_root_id() || self.reserved_range().is_some_and(|r| r.contains(id))
    }

    /// Create a node under `parent`, minting an id when `id` is `None`
    async fn create_node_state(
        &self,
        parent: &NodeId,
        name: Name,
        id: Option<NodeId>,
        type_name: Name,
    ) -> Result<NodeState>;

    async fn create_property_state(
        &self,
        parent: &NodeId,
        name: Name,
        property_type: PropertyType,
        multi_valued: bool,
    ) -> Result<PropertyState>;

    /// Take over a references record targeting one of this provider's nodes.
    /// Returns `false` if the target is not ours.
    async fn set_node_references(&self, refs: &NodeReferences) -> Result<bool>;

    fn add_listener(&self, listener: Arc<dyn ItemStateListener>) -> Subscription;
}
