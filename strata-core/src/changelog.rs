//! Change logs
//!
//! A change log is the unit an overlay flushes into its base. Added items are
//! ordered parents-first, deleted items children-first. Modified and deleted
//! entries carry the base modification counter they were derived from in
//! `base_mod_count`; `None` means unconditional.

use std::collections::HashMap;
use uuid::Uuid;

use crate::id::{ItemId, NodeId};
use crate::state::{ItemState, ItemStatus};

#[derive(Debug, Clone)]
pub struct ChangeLog {
    id: Uuid,
    pub added: Vec<ItemState>,
    pub modified: Vec<ItemState>,
    pub deleted: Vec<ItemState>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            added: Vec::new(),
            modified: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Identity of this batch; re-applying the same id is a no-op
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Build an ordered change log from the dirty states of an overlay
    pub fn from_shadows<'a>(shadows: impl IntoIterator<Item = &'a ItemState>) -> Self {
        let mut log = Self::new();
        for state in shadows {
            match state.status() {
                ItemStatus::New => log.added.push(state.clone()),
                ItemStatus::ExistingModified => log.modified.push(state.clone()),
                ItemStatus::ExistingRemoved => log.deleted.push(state.clone()),
                _ => {}
            }
        }
        log.order();
        log
    }

    /// Sort added items parents-first and deleted items children-first
    fn order(&mut self) {
        let added_depth = depths(&self.added);
        self.added.sort_by_key(|s| rank(s, &added_depth));

        let deleted_depth = depths(&self.deleted);
        self.deleted.sort_by_key(|s| rank(s, &deleted_depth));
        self.deleted.reverse();
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// Every entry, in application order
    pub fn entries(&self) -> impl Iterator<Item = &ItemState> {
        self.added.iter().chain(self.modified.iter()).chain(self.deleted.iter())
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.entries().any(|s| &s.id() == id)
    }

    pub fn is_deleted(&self, id: &ItemId) -> bool {
        self.deleted.iter().any(|s| &s.id() == id)
    }

    pub fn is_added(&self, id: &ItemId) -> bool {
        self.added.iter().any(|s| &s.id() == id)
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Depth of every node within the set, counting only ancestors in the set
fn depths(states: &[ItemState]) -> HashMap<NodeId, usize> {
    let parents: HashMap<NodeId, Option<NodeId>> = states
        .iter()
        .filter_map(|s| s.as_node().map(|n| (n.id, n.parent_id)))
        .collect();

    let mut depth = HashMap::with_capacity(parents.len());
    for id in parents.keys() {
        let mut d = 0;
        let mut cursor = parents.get(id).copied().flatten();
        while let Some(parent) = cursor {
            match parents.get(&parent) {
                Some(next) => {
                    d += 1;
                    cursor = *next;
                }
                None => break,
            }
        }
        depth.insert(*id, d);
    }
    depth
}

/// Sort key: nodes by depth, each property right after the level of its parent
fn rank(state: &ItemState, depth: &HashMap<NodeId, usize>) -> (usize, u8) {
    match state {
        ItemState::Node(n) => (depth.get(&n.id).copied().unwrap_or(0), 0),
        ItemState::Property(p) => (depth.get(p.parent_id()).map(|d| d + 1).unwrap_or(0), 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Name, PropertyId};
    use crate::state::{NodeState, PropertyState};
    use crate::value::PropertyType;

    fn node(id: NodeId, parent: NodeId, status: ItemStatus) -> ItemState {
        let mut n = NodeState::new(id, Some(parent), Name::from("nt:unstructured"));
        n.status = status;
        ItemState::Node(n)
    }

    fn prop(parent: NodeId, status: ItemStatus) -> ItemState {
        let mut p = PropertyState::new(PropertyId::new(parent, Name::from("p")), PropertyType::String, false);
        p.status = status;
        ItemState::Property(p)
    }

    fn position(log: &[ItemState], id: &ItemId) -> usize {
        log.iter().position(|s| &s.id() == id).unwrap()
    }

    #[test]
    fn test_added_parents_first() {
        let root = NodeId::root();
        let a = NodeId::generate();
        let b = NodeId::generate();
        let c = NodeId::generate();
        // deliberately scrambled: grandchild, its property, child, parent
        let shadows = vec![
            node(c, b, ItemStatus::New),
            prop(c, ItemStatus::New),
            node(b, a, ItemStatus::New),
            node(a, root, ItemStatus::New),
        ];
        let log = ChangeLog::from_shadows(&shadows);
        assert_eq!(log.added.len(), 4);
        let pa = position(&log.added, &ItemId::Node(a));
        let pb = position(&log.added, &ItemId::Node(b));
        let pc = position(&log.added, &ItemId::Node(c));
        let pp = position(&log.added, &ItemId::Property(PropertyId::new(c, Name::from("p"))));
        assert!(pa < pb && pb < pc && pc < pp);
    }

    #[test]
    fn test_deleted_children_first() {
        let root = NodeId::root();
        let a = NodeId::generate();
        let b = NodeId::generate();
        let shadows = vec![
            node(a, root, ItemStatus::ExistingRemoved),
            prop(a, ItemStatus::ExistingRemoved),
            node(b, a, ItemStatus::ExistingRemoved),
        ];
        let log = ChangeLog::from_shadows(&shadows);
        let pa = position(&log.deleted, &ItemId::Node(a));
        let pb = position(&log.deleted, &ItemId::Node(b));
        let pp = position(&log.deleted, &ItemId::Property(PropertyId::new(a, Name::from("p"))));
        assert!(pb < pa);
        assert!(pp < pa);
        assert!(log.is_deleted(&ItemId::Node(b)));
    }

    #[test]
    fn test_clean_and_stale_states_are_skipped() {
        let root = NodeId::root();
        let shadows = vec![
            node(NodeId::generate(), root, ItemStatus::Existing),
            node(NodeId::generate(), root, ItemStatus::StaleModified),
            node(NodeId::generate(), root, ItemStatus::ExistingModified),
        ];
        let log = ChangeLog::from_shadows(&shadows);
        assert_eq!(log.len(), 1);
        assert_eq!(log.modified.len(), 1);
        assert_ne!(ChangeLog::new().id(), log.id());
    }
}
