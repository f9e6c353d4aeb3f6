//! Generic in-memory virtual subtree

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::VirtualItemStateProvider;
use crate::error::{Result, StateError};
use crate::id::{names, IdRange, ItemId, Name, NodeId, PropertyId};
use crate::listener::{ItemStateEvent, ItemStateListener, ListenerRegistry, Subscription};
use crate::manager::ItemStateManager;
use crate::state::{ItemState, ItemStatus, NodeReferences, NodeState, PropertyState};
use crate::value::{InternalValue, PropertyType};

/// A computed hierarchy held in memory.
///
/// The root is the first id of the reserved range and hangs below a
/// canonical parent. Content can be recomputed at any time with
/// [`set_property_values`](Self::set_property_values) and
/// [`remove_node`](Self::remove_node); every change is published to
/// listeners.
pub struct VirtualTreeProvider {
    range: IdRange,
    root_id: NodeId,
    next_seq: AtomicU64,
    items: RwLock<HashMap<ItemId, ItemState>>,
    references: RwLock<HashMap<NodeId, NodeReferences>>,
    listeners: ListenerRegistry,
    lookups: AtomicU64,
}

fn poisoned() -> StateError {
    StateError::InvalidState("virtual tree lock poisoned".into())
}

impl VirtualTreeProvider {
    /// A provider whose root node of type `root_type` sits below `parent`
    pub fn new(range: IdRange, parent: NodeId, root_type: Name) -> Self {
        let root_id = range.node_id(0);
        let mut items = HashMap::new();
        let mut root = NodeState::new(root_id, Some(parent), root_type.clone());
        root.status = ItemStatus::Existing;
        root.property_names.insert(Name::from(names::PRIMARY_TYPE));
        items.insert(ItemId::Node(root_id), ItemState::Node(root));
        let type_prop = primary_type_property(root_id, root_type);
        items.insert(ItemId::Property(type_prop.id.clone()), ItemState::Property(type_prop));

        Self {
            range,
            root_id,
            next_seq: AtomicU64::new(1),
            items: RwLock::new(items),
            references: RwLock::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
            lookups: AtomicU64::new(0),
        }
    }

    /// Number of item lookups served
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the values of an existing virtual property
    pub fn set_property_values(&self, id: &PropertyId, values: Vec<InternalValue>) -> Result<()> {
        let item = ItemId::Property(id.clone());
        {
            let mut items = self.items.write().map_err(|_| poisoned())?;
            let Some(ItemState::Property(prop)) = items.get_mut(&item) else {
                return Err(StateError::NotFound(item));
            };
            if !prop.multi_valued && values.len() != 1 {
                return Err(StateError::ConstraintViolation(format!(
                    "{} is single-valued, got {} values",
                    id,
                    values.len()
                )));
            }
            prop.values = values;
            prop.mod_count += 1;
        }
        self.listeners.notify(&ItemStateEvent::modified(item));
        Ok(())
    }

    /// Remove a node and its subtree
    pub fn remove_node(&self, id: &NodeId) -> Result<()> {
        if *id == self.root_id {
            return Err(StateError::ConstraintViolation("cannot remove a virtual root".into()));
        }

        let mut events = Vec::new();
        {
            let mut items = self.items.write().map_err(|_| poisoned())?;
            let node = match items.get(&ItemId::Node(*id)) {
                Some(ItemState::Node(node)) => node.clone(),
                _ => return Err(StateError::NotFound(ItemId::Node(*id))),
            };
            if let Some(parent_id) = node.parent_id {
                if let Some(ItemState::Node(parent)) = items.get_mut(&ItemId::Node(parent_id)) {
                    parent.remove_child_entry(id);
                    parent.mod_count += 1;
                    events.push(ItemStateEvent::modified(ItemId::Node(parent_id)));
                }
            }

            let mut pending = vec![node];
            while let Some(node) = pending.pop() {
                for name in &node.property_names {
                    let prop = ItemId::Property(node.property_id(name));
                    items.remove(&prop);
                    events.push(ItemStateEvent::destroyed(prop));
                }
                for child in &node.child_entries {
                    if let Some(ItemState::Node(child)) = items.get(&ItemId::Node(child.id)) {
                        pending.push(child.clone());
                    }
                }
                items.remove(&ItemId::Node(node.id));
                events.push(ItemStateEvent::destroyed(ItemId::Node(node.id)));
            }
        }

        if let Ok(mut references) = self.references.write() {
            references.remove(id);
        }
        for event in &events {
            self.listeners.notify(event);
        }
        Ok(())
    }

    fn node(&self, id: &NodeId) -> Result<NodeState> {
        let items = self.items.read().map_err(|_| poisoned())?;
        match items.get(&ItemId::Node(*id)) {
            Some(ItemState::Node(node)) => Ok(node.clone()),
            _ => Err(StateError::NotFound(ItemId::Node(*id))),
        }
    }
}

fn primary_type_property(node: NodeId, primary_type: Name) -> PropertyState {
    let mut prop = PropertyState::new(
        PropertyId::new(node, Name::from(names::PRIMARY_TYPE)),
        PropertyType::Name,
        false,
    );
    prop.values.push(InternalValue::Name(primary_type));
    prop.status = ItemStatus::Existing;
    prop
}

#[async_trait]
impl ItemStateManager for VirtualTreeProvider {
    async fn get_item_state(&self, id: &ItemId) -> Result<ItemState> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let items = self.items.read().map_err(|_| poisoned())?;
        items.get(id).cloned().ok_or_else(|| StateError::NotFound(id.clone()))
    }

    async fn has_item_state(&self, id: &ItemId) -> Result<bool> {
        let items = self.items.read().map_err(|_| poisoned())?;
        Ok(items.contains_key(id))
    }

    async fn get_node_references(&self, id: &NodeId) -> Result<NodeReferences> {
        let references = self.references.read().map_err(|_| poisoned())?;
        Ok(references.get(id).cloned().unwrap_or_else(|| NodeReferences::new(*id)))
    }
}

#[async_trait]
impl VirtualItemStateProvider for VirtualTreeProvider {
    fn virtual_root_id(&self) -> NodeId {
        self.root_id
    }

    fn reserved_range(&self) -> Option<IdRange> {
        Some(self.range)
    }

    async fn create_node_state(
        &self,
        parent: &NodeId,
        name: Name,
        id: Option<NodeId>,
        type_name: Name,
    ) -> Result<NodeState> {
        let id = match id {
            Some(id) if !self.range.contains(&id) => {
                return Err(StateError::Configuration(format!(
                    "{} lies outside the provider's reserved range",
                    id
                )));
            }
            Some(id) => id,
            None => self.range.node_id(self.next_seq.fetch_add(1, Ordering::SeqCst)),
        };

        let mut node = NodeState::new(id, Some(*parent), type_name.clone());
        node.status = ItemStatus::Existing;
        node.property_names.insert(Name::from(names::PRIMARY_TYPE));
        let type_prop = primary_type_property(id, type_name);

        {
            let mut items = self.items.write().map_err(|_| poisoned())?;
            if items.contains_key(&ItemId::Node(id)) {
                return Err(StateError::ItemExists(format!("virtual node {}", id)));
            }
            let Some(ItemState::Node(parent_state)) = items.get_mut(&ItemId::Node(*parent)) else {
                return Err(StateError::NotFound(ItemId::Node(*parent)));
            };
            parent_state.add_child_entry(name, id);
            parent_state.mod_count += 1;
            items.insert(ItemId::Node(id), ItemState::Node(node.clone()));
            items.insert(ItemId::Property(type_prop.id.clone()), ItemState::Property(type_prop));
        }

        self.listeners.notify(&ItemStateEvent::modified(ItemId::Node(*parent)));
        self.listeners.notify(&ItemStateEvent::created(ItemId::Node(id)));
        Ok(node)
    }

    async fn create_property_state(
        &self,
        parent: &NodeId,
        name: Name,
        property_type: PropertyType,
        multi_valued: bool,
    ) -> Result<PropertyState> {
        let mut prop = PropertyState::new(PropertyId::new(*parent, name.clone()), property_type, multi_valued);
        prop.status = ItemStatus::Existing;
        let item = ItemId::Property(prop.id.clone());

        {
            let mut items = self.items.write().map_err(|_| poisoned())?;
            if items.contains_key(&item) {
                return Err(StateError::ItemExists(format!("virtual property {}", prop.id)));
            }
            let Some(ItemState::Node(parent_state)) = items.get_mut(&ItemId::Node(*parent)) else {
                return Err(StateError::NotFound(ItemId::Node(*parent)));
            };
            parent_state.property_names.insert(name);
            parent_state.mod_count += 1;
            items.insert(item.clone(), ItemState::Property(prop.clone()));
        }

        self.listeners.notify(&ItemStateEvent::created(item));
        Ok(prop)
    }

    async fn set_node_references(&self, refs: &NodeReferences) -> Result<bool> {
        if !self.owns(&refs.target) || self.node(&refs.target).is_err() {
            return Ok(false);
        }
        let mut references = self.references.write().map_err(|_| poisoned())?;
        if refs.is_empty() {
            references.remove(&refs.target);
        } else {
            references.insert(refs.target, refs.clone());
        }
        Ok(true)
    }

    fn add_listener(&self, listener: Arc<dyn ItemStateListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ChangeKind;
    use std::sync::Mutex;

    fn provider() -> VirtualTreeProvider {
        let range = IdRange::new([0x5e, 0x11, 0, 0, 0, 0, 0x00, 0x01]).unwrap();
        VirtualTreeProvider::new(range, NodeId::ROOT, Name::from("system:folder"))
    }

    #[tokio::test]
    async fn test_root_and_minted_ids() {
        let vt = provider();
        let root = vt.virtual_root_id();
        assert!(vt.is_virtual_root(&ItemId::Node(root)));
        assert!(vt.owns(&root));
        assert!(!vt.owns(&NodeId::generate()));

        let child = vt
            .create_node_state(&root, Name::from("child"), None, Name::from("system:leaf"))
            .await
            .unwrap();
        assert!(vt.reserved_range().unwrap().contains(&child.id));
        assert_ne!(child.id, root);

        let root_state = vt.get_node_state(&root).await.unwrap();
        assert_eq!(root_state.child_entries[0].id, child.id);
        assert_eq!(root_state.parent_id, Some(NodeId::ROOT));
    }

    #[tokio::test]
    async fn test_foreign_id_rejected() {
        let vt = provider();
        let err = vt
            .create_node_state(&vt.virtual_root_id(), Name::from("x"), Some(NodeId::generate()), Name::from("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_recompute_notifies_until_cancelled() {
        let vt = provider();
        let root = vt.virtual_root_id();
        let prop = vt
            .create_property_state(&root, Name::from("count"), PropertyType::Long, false)
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = vt.add_listener(Arc::new(move |e: &ItemStateEvent| {
            sink.lock().unwrap().push(e.kind);
        }));

        vt.set_property_values(&prop.id, vec![InternalValue::Long(3)]).unwrap();
        sub.cancel();
        vt.set_property_values(&prop.id, vec![InternalValue::Long(4)]).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![ChangeKind::Modified]);
        let stored = vt.get_property_state(&prop.id).await.unwrap();
        assert_eq!(stored.values, vec![InternalValue::Long(4)]);
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let vt = provider();
        let root = vt.virtual_root_id();
        let a = vt.create_node_state(&root, Name::from("a"), None, Name::from("t")).await.unwrap();
        let b = vt.create_node_state(&a.id, Name::from("b"), None, Name::from("t")).await.unwrap();

        vt.remove_node(&a.id).unwrap();
        assert!(!vt.has_item_state(&ItemId::Node(a.id)).await.unwrap());
        assert!(!vt.has_item_state(&ItemId::Node(b.id)).await.unwrap());
        assert!(vt.get_node_state(&root).await.unwrap().child_entries.is_empty());
        assert!(vt.remove_node(&root).is_err());
    }

    #[tokio::test]
    async fn test_set_node_references_only_for_own_nodes() {
        let vt = provider();
        let mut refs = NodeReferences::new(vt.virtual_root_id());
        refs.add_reference(PropertyId::new(NodeId::ROOT, Name::from("link")), false);
        assert!(vt.set_node_references(&refs).await.unwrap());
        assert!(vt.has_node_references(&vt.virtual_root_id()).await.unwrap());

        let foreign = NodeReferences::new(NodeId::generate());
        assert!(!vt.set_node_references(&foreign).await.unwrap());
    }
}
