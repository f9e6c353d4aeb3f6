//! Item identifiers
//!
//! Nodes and properties share one lookup space. A node is addressed by a
//! UUID; a property by its owning node plus its name. Virtual providers own a
//! reserved [`IdRange`] that cannot contain a randomly generated node id.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, StateError};

/// Qualified item name (`prefix:local` or `local`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Name(String);

impl Name {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace prefix, if the name is qualified
    pub fn prefix(&self) -> Option<&str> {
        self.0.split_once(':').map(|(p, _)| p)
    }

    /// Local part of the name
    pub fn local_name(&self) -> &str {
        self.0.split_once(':').map(|(_, l)| l).unwrap_or(&self.0)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Well-known names used by the core
pub mod names {
    pub const PRIMARY_TYPE: &str = "system:primaryType";
    pub const MIXIN_TYPES: &str = "system:mixinTypes";
    pub const UUID: &str = "system:uuid";
    pub const ROOT: &str = "";
    pub const NT_BASE: &str = "nt:base";
    pub const NT_UNSTRUCTURED: &str = "nt:unstructured";
    pub const MIX_REFERENCEABLE: &str = "mix:referenceable";
}

/// Identifier of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Fixed identifier of the repository root node
    pub const ROOT: NodeId = NodeId(Uuid::from_u128(0xcafebabe_cafe_babe_cafe_babecafebabe));

    /// Generate a fresh canonical identifier (random v4 UUID)
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn root() -> Self {
        Self::ROOT
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse from the hyphenated UUID form
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| StateError::ValueFormat(format!("Invalid node id '{}': {}", s, e)))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Identifier of a property: owning node plus name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyId {
    parent: NodeId,
    name: Name,
}

impl PropertyId {
    pub fn new(parent: NodeId, name: Name) -> Self {
        Self { parent, name }
    }

    pub fn parent(&self) -> &NodeId {
        &self.parent
    }

    pub fn name(&self) -> &Name {
        &self.name
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.name)
    }
}

/// Identifier of either a node or a property
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemId {
    Node(NodeId),
    Property(PropertyId),
}

impl ItemId {
    pub fn is_node(&self) -> bool {
        matches!(self, ItemId::Node(_))
    }

    /// The node that owns this item: itself for nodes, the parent for properties
    pub fn owning_node(&self) -> &NodeId {
        match self {
            ItemId::Node(id) => id,
            ItemId::Property(id) => id.parent(),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Node(id) => write!(f, "{}", id),
            ItemId::Property(id) => write!(f, "{}", id),
        }
    }
}

impl From<NodeId> for ItemId {
    fn from(id: NodeId) -> Self {
        ItemId::Node(id)
    }
}

impl From<PropertyId> for ItemId {
    fn from(id: PropertyId) -> Self {
        ItemId::Property(id)
    }
}

/// Reserved sub-range of node identifiers: every id whose first eight bytes
/// equal `prefix`.
///
/// The prefix covers the UUID version nibble, and it may not be 4, so a range
/// never contains a generated v4 id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdRange {
    prefix: [u8; 8],
}

impl IdRange {
    pub fn new(prefix: [u8; 8]) -> Result<Self> {
        if prefix[6] >> 4 == 4 {
            return Err(StateError::Configuration(format!(
                "Reserved id prefix {:02x?} overlaps generated (v4) identifiers",
                prefix
            )));
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &[u8; 8] {
        &self.prefix
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        id.as_uuid().as_bytes()[..8] == self.prefix
    }

    /// The `seq`-th identifier of this range
    pub fn node_id(&self, seq: u64) -> NodeId {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.prefix);
        bytes[8..].copy_from_slice(&seq.to_be_bytes());
        NodeId(Uuid::from_bytes(bytes))
    }

    pub fn overlaps(&self, other: &IdRange) -> bool {
        self.prefix == other.prefix
    }
}
