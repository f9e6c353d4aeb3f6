//! Item states
//!
//! An item state is the known content of one node or property at one layer.
//! Every state carries a status and a modification counter; overlay copies
//! also remember the counter of the base state they were cloned from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::id::{ItemId, Name, NodeId, PropertyId};
use crate::schema::PropDefId;
use crate::value::{InternalValue, PropertyType};

/// Status of an item state at its layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    /// Created in an overlay, not yet persisted
    New,
    /// Mirrors the persisted or virtual truth
    Existing,
    /// Overlay copy diverges from its base
    ExistingModified,
    /// Marked for deletion
    ExistingRemoved,
    /// Base changed underneath a modified copy
    StaleModified,
    /// Base was destroyed underneath a copy
    StaleDestroyed,
}

impl ItemStatus {
    pub fn is_stale(&self) -> bool {
        matches!(self, ItemStatus::StaleModified | ItemStatus::StaleDestroyed)
    }

    /// Whether a shadow with this status must be flushed
    pub fn is_dirty(&self) -> bool {
        matches!(
            self,
            ItemStatus::New | ItemStatus::ExistingModified | ItemStatus::ExistingRemoved
        )
    }
}

/// One child entry of a node, in document order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildNodeEntry {
    pub name: Name,
    pub id: NodeId,
    /// Same-name-sibling index, starting at 1
    pub index: u32,
    /// Links the root of a virtual subtree; it resolves only through a
    /// federation with the provider mounted
    pub mounted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: NodeId,
    /// `None` only for a tree root
    pub parent_id: Option<NodeId>,
    pub primary_type: Name,
    pub mixins: BTreeSet<Name>,
    pub child_entries: Vec<ChildNodeEntry>,
    pub property_names: BTreeSet<Name>,
    pub status: ItemStatus,
    pub mod_count: u64,
    pub base_mod_count: Option<u64>,
}

impl NodeState {
    /// A transient node with no children or properties
    pub fn new(id: NodeId, parent_id: Option<NodeId>, primary_type: Name) -> Self {
        Self {
            id,
            parent_id,
            primary_type,
            mixins: BTreeSet::new(),
            child_entries: Vec::new(),
            property_names: BTreeSet::new(),
            status: ItemStatus::New,
            mod_count: 0,
            base_mod_count: None,
        }
    }

    /// Append a child entry and return its same-name-sibling index
    pub fn add_child_entry(&mut self, name: Name, id: NodeId) -> u32 {
        self.push_child_entry(name, id, false)
    }

    /// Append an entry linking the virtual root `id`
    pub fn add_mounted_entry(&mut self, name: Name, id: NodeId) -> u32 {
        self.push_child_entry(name, id, true)
    }

    fn push_child_entry(&mut self, name: Name, id: NodeId, mounted: bool) -> u32 {
        let index = self.child_entries.iter().filter(|e| e.name == name).count() as u32 + 1;
        self.child_entries.push(ChildNodeEntry { name, id, index, mounted });
        index
    }

    /// Remove the entry for `id`, reindexing its later same-name siblings
    pub fn remove_child_entry(&mut self, id: &NodeId) -> Option<ChildNodeEntry> {
        let pos = self.child_entries.iter().position(|e| &e.id == id)?;
        let removed = self.child_entries.remove(pos);
        for entry in self.child_entries.iter_mut().skip(pos) {
            if entry.name == removed.name {
                entry.index -= 1;
            }
        }
        Some(removed)
    }

    pub fn child_entry(&self, name: &Name, index: u32) -> Option<&ChildNodeEntry> {
        self.child_entries
            .iter()
            .find(|e| &e.name == name && e.index == index)
    }

    pub fn child_entry_by_id(&self, id: &NodeId) -> Option<&ChildNodeEntry> {
        self.child_entries.iter().find(|e| &e.id == id)
    }

    pub fn has_property_name(&self, name: &Name) -> bool {
        self.property_names.contains(name)
    }

    pub fn property_id(&self, name: &Name) -> PropertyId {
        PropertyId::new(self.id, name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyState {
    pub id: PropertyId,
    pub property_type: PropertyType,
    pub multi_valued: bool,
    pub values: Vec<InternalValue>,
    /// Definition the values were last validated against
    pub definition: Option<PropDefId>,
    pub status: ItemStatus,
    pub mod_count: u64,
    pub base_mod_count: Option<u64>,
}

impl PropertyState {
    pub fn new(id: PropertyId, property_type: PropertyType, multi_valued: bool) -> Self {
        Self {
            id,
            property_type,
            multi_valued,
            values: Vec::new(),
            definition: None,
            status: ItemStatus::New,
            mod_count: 0,
            base_mod_count: None,
        }
    }

    pub fn name(&self) -> &Name {
        self.id.name()
    }

    pub fn parent_id(&self) -> &NodeId {
        self.id.parent()
    }

    /// Nodes targeted by this property's reference values
    pub fn reference_targets(&self) -> impl Iterator<Item = &NodeId> {
        self.values.iter().filter_map(|v| v.reference_target())
    }
}

/// State of a node or a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemState {
    Node(NodeState),
    Property(PropertyState),
}

impl ItemState {
    pub fn id(&self) -> ItemId {
        match self {
            ItemState::Node(n) => ItemId::Node(n.id),
            ItemState::Property(p) => ItemId::Property(p.id.clone()),
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, ItemState::Node(_))
    }

    pub fn status(&self) -> ItemStatus {
        match self {
            ItemState::Node(n) => n.status,
            ItemState::Property(p) => p.status,
        }
    }

    pub fn set_status(&mut self, status: ItemStatus) {
        match self {
            ItemState::Node(n) => n.status = status,
            ItemState::Property(p) => p.status = status,
        }
    }

    pub fn mod_count(&self) -> u64 {
        match self {
            ItemState::Node(n) => n.mod_count,
            ItemState::Property(p) => p.mod_count,
        }
    }

    pub fn set_mod_count(&mut self, count: u64) {
        match self {
            ItemState::Node(n) => n.mod_count = count,
            ItemState::Property(p) => p.mod_count = count,
        }
    }

    pub fn base_mod_count(&self) -> Option<u64> {
        match self {
            ItemState::Node(n) => n.base_mod_count,
            ItemState::Property(p) => p.base_mod_count,
        }
    }

    pub fn set_base_mod_count(&mut self, count: Option<u64>) {
        match self {
            ItemState::Node(n) => n.base_mod_count = count,
            ItemState::Property(p) => p.base_mod_count = count,
        }
    }

    /// Node owning this item (the parent for properties)
    pub fn owning_node(&self) -> Option<&NodeId> {
        match self {
            ItemState::Node(n) => n.parent_id.as_ref(),
            ItemState::Property(p) => Some(p.parent_id()),
        }
    }

    pub fn as_node(&self) -> Option<&NodeState> {
        match self {
            ItemState::Node(n) => Some(n),
            ItemState::Property(_) => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyState> {
        match self {
            ItemState::Property(p) => Some(p),
            ItemState::Node(_) => None,
        }
    }

    pub fn into_node(self) -> Option<NodeState> {
        match self {
            ItemState::Node(n) => Some(n),
            ItemState::Property(_) => None,
        }
    }

    pub fn into_property(self) -> Option<PropertyState> {
        match self {
            ItemState::Property(p) => Some(p),
            ItemState::Node(_) => None,
        }
    }
}

impl From<NodeState> for ItemState {
    fn from(state: NodeState) -> Self {
        ItemState::Node(state)
    }
}

impl From<PropertyState> for ItemState {
    fn from(state: PropertyState) -> Self {
        ItemState::Property(state)
    }
}

/// A reference property pointing at a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub property: PropertyId,
    pub weak: bool,
}

/// Back-reference bookkeeping for one target node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReferences {
    pub target: NodeId,
    pub references: Vec<ReferenceEntry>,
}

impl NodeReferences {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            references: Vec::new(),
        }
    }

    /// Add a referring property; one entry per property
    pub fn add_reference(&mut self, property: PropertyId, weak: bool) {
        if !self.references.iter().any(|r| r.property == property) {
            self.references.push(ReferenceEntry { property, weak });
        }
    }

    pub fn remove_reference(&mut self, property: &PropertyId) -> bool {
        let before = self.references.len();
        self.references.retain(|r| &r.property != property);
        before != self.references.len()
    }

    /// Whether any non-weak reference remains
    pub fn has_hard_references(&self) -> bool {
        self.references.iter().any(|r| !r.weak)
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}
