//! Batched item operations against a writable layer
//!
//! Combines a writable overlay with the schema registry: node creation with
//! auto-created properties, property creation bound to a definition,
//! validation, and readable item paths for error messages.

use std::collections::BTreeSet;

use crate::error::{Result, StateError};
use crate::id::{names, ItemId, Name, NodeId, PropertyId};
use crate::manager::{ItemStateManager, WritableStateManager};
use crate::schema::{self, EffectiveNodeType, NodeTypeRegistry, PropertyDefinition};
use crate::state::{ItemState, NodeState, PropertyState};
use crate::value::{InternalValue, PropertyType};

#[derive(Clone, Copy)]
pub struct ItemOps<'a> {
    states: &'a dyn WritableStateManager,
    registry: &'a dyn NodeTypeRegistry,
}

impl<'a> ItemOps<'a> {
    pub fn new(states: &'a dyn WritableStateManager, registry: &'a dyn NodeTypeRegistry) -> Self {
        Self { states, registry }
    }

    pub fn states(&self) -> &'a dyn WritableStateManager {
        self.states
    }

    pub fn registry(&self) -> &'a dyn NodeTypeRegistry {
        self.registry
    }

    pub async fn node_state(&self, id: &NodeId) -> Result<NodeState> {
        self.states.get_node_state(id).await
    }

    pub fn effective_node_type(&self, node: &NodeState) -> Result<EffectiveNodeType> {
        self.registry.effective_node_type(&node.primary_type, &node.mixins)
    }

    /// The property `name` of `node`, if present
    pub async fn property_state(&self, node: &NodeState, name: &Name) -> Result<Option<PropertyState>> {
        if !node.has_property_name(name) {
            return Ok(None);
        }
        match self.states.get_property_state(&node.property_id(name)).await {
            Ok(prop) => Ok(Some(prop)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn property_definition(&self, prop: &PropertyState) -> Result<PropertyDefinition> {
        let id = prop
            .definition
            .as_ref()
            .ok_or_else(|| StateError::ConstraintViolation(format!("{} has no property definition", prop.id)))?;
        self.registry.property_definition(id)
    }

    /// A transient property of `node` bound to `def`; not stored yet
    pub async fn create_property_state(
        &self,
        node: &NodeState,
        name: Name,
        property_type: PropertyType,
        def: &PropertyDefinition,
    ) -> Result<PropertyState> {
        let mut prop = self
            .states
            .create_property_state(&node.id, name, property_type, def.multiple)
            .await?;
        prop.definition = Some(def.id.clone());
        Ok(prop)
    }

    /// Check `prop` against the definition it is bound to
    pub fn validate(&self, prop: &PropertyState) -> Result<()> {
        let def = self.property_definition(prop)?;
        schema::validate(prop, &def)
    }

    pub async fn store(&self, prop: PropertyState) -> Result<()> {
        self.states.store(ItemState::Property(prop)).await
    }

    /// Create a node with its auto-created system properties
    pub async fn add_node(
        &self,
        parent: &NodeId,
        name: Name,
        primary_type: Name,
        mixins: BTreeSet<Name>,
        id: Option<NodeId>,
    ) -> Result<NodeState> {
        let ent = self.registry.effective_node_type(&primary_type, &mixins)?;
        let mut node = self
            .states
            .create_node_state(parent, name, primary_type.clone(), id)
            .await?;
        if !mixins.is_empty() {
            node.mixins = mixins.clone();
            self.states.store(ItemState::Node(node.clone())).await?;
        }

        self.add_system_property(
            &node,
            &ent,
            names::PRIMARY_TYPE,
            PropertyType::Name,
            vec![InternalValue::Name(primary_type)],
        )
        .await?;
        if !mixins.is_empty() {
            self.add_system_property(
                &node,
                &ent,
                names::MIXIN_TYPES,
                PropertyType::Name,
                mixins.into_iter().map(InternalValue::Name).collect(),
            )
            .await?;
        }
        if ent.includes(&Name::from(names::MIX_REFERENCEABLE)) {
            self.add_system_property(
                &node,
                &ent,
                names::UUID,
                PropertyType::String,
                vec![InternalValue::String(node.id.to_string())],
            )
            .await?;
        }

        self.states.get_node_state(&node.id).await
    }

    async fn add_system_property(
        &self,
        node: &NodeState,
        ent: &EffectiveNodeType,
        name: &str,
        property_type: PropertyType,
        values: Vec<InternalValue>,
    ) -> Result<()> {
        let name = Name::from(name);
        let multiple = Some(name.as_str() == names::MIXIN_TYPES);
        let def = ent.applicable_property_def(&name, property_type, multiple)?;
        let mut prop = PropertyState::new(PropertyId::new(node.id, name), property_type, def.multiple);
        prop.definition = Some(def.id.clone());
        prop.values = values;
        self.states.store(ItemState::Property(prop)).await
    }

    /// Readable path of `id` (`/a/b[2]/title`), or the raw id if it cannot be
    /// resolved
    pub async fn item_path(&self, id: &ItemId) -> String {
        match self.try_item_path(id).await {
            Ok(path) => path,
            Err(_) => id.to_string(),
        }
    }

    async fn try_item_path(&self, id: &ItemId) -> Result<String> {
        let (mut node_id, suffix) = match id {
            ItemId::Node(node) => (*node, None),
            ItemId::Property(prop) => (*prop.parent(), Some(prop.name().clone())),
        };

        let mut segments = Vec::new();
        loop {
            let node = self.states.get_node_state(&node_id).await?;
            let Some(parent_id) = node.parent_id else {
                break;
            };
            let parent = self.states.get_node_state(&parent_id).await?;
            let entry = parent
                .child_entry_by_id(&node_id)
                .ok_or_else(|| StateError::InvalidState(format!("{} is not linked below {}", node_id, parent_id)))?;
            segments.push(if entry.index > 1 {
                format!("{}[{}]", entry.name, entry.index)
            } else {
                entry.name.to_string()
            });
            node_id = parent_id;
        }
        segments.reverse();
        if let Some(name) = suffix {
            segments.push(name.to_string());
        }
        Ok(format!("/{}", segments.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalStore;
    use crate::config::StrataConfig;
    use crate::manager::ItemStateManager;
    use crate::persistence::MemoryPersistenceManager;
    use crate::schema::StaticNodeTypeRegistry;
    use crate::session::SessionOverlay;
    use std::sync::Arc;

    async fn session() -> SessionOverlay {
        let pm = Arc::new(MemoryPersistenceManager::new());
        let store = CanonicalStore::open(pm, &StrataConfig::default()).await.unwrap();
        store.initialize_root(Name::from(names::NT_UNSTRUCTURED)).await.unwrap();
        SessionOverlay::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_add_node_creates_system_properties() {
        let session = session().await;
        let registry = StaticNodeTypeRegistry::with_builtins();
        let ops = ItemOps::new(&session, &registry);

        let mixins = BTreeSet::from([Name::from(names::MIX_REFERENCEABLE)]);
        let node = ops
            .add_node(&NodeId::ROOT, Name::from("doc"), Name::from(names::NT_UNSTRUCTURED), mixins, None)
            .await
            .unwrap();
        assert!(node.has_property_name(&Name::from(names::PRIMARY_TYPE)));
        assert!(node.has_property_name(&Name::from(names::MIXIN_TYPES)));

        let uuid = ops
            .property_state(&node, &Name::from(names::UUID))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uuid.values, vec![InternalValue::String(node.id.to_string())]);
        ops.validate(&uuid).unwrap();

        session.save().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_node_rejects_mixin_as_primary() {
        let session = session().await;
        let registry = StaticNodeTypeRegistry::with_builtins();
        let ops = ItemOps::new(&session, &registry);
        let err = ops
            .add_node(
                &NodeId::ROOT,
                Name::from("bad"),
                Name::from(names::MIX_REFERENCEABLE),
                BTreeSet::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::ConstraintViolation(_)));
        assert!(!session.is_dirty().await);
    }

    #[tokio::test]
    async fn test_item_path_with_same_name_siblings() {
        let session = session().await;
        let registry = StaticNodeTypeRegistry::with_builtins();
        let ops = ItemOps::new(&session, &registry);
        let unstructured = Name::from(names::NT_UNSTRUCTURED);

        let a = ops
            .add_node(&NodeId::ROOT, Name::from("a"), unstructured.clone(), BTreeSet::new(), None)
            .await
            .unwrap();
        ops.add_node(&a.id, Name::from("item"), unstructured.clone(), BTreeSet::new(), None)
            .await
            .unwrap();
        let second = ops
            .add_node(&a.id, Name::from("item"), unstructured, BTreeSet::new(), None)
            .await
            .unwrap();

        assert_eq!(ops.item_path(&ItemId::Node(NodeId::ROOT)).await, "/");
        assert_eq!(ops.item_path(&ItemId::Node(second.id)).await, "/a/item[2]");
        let prop = PropertyId::new(second.id, Name::from(names::PRIMARY_TYPE));
        assert_eq!(ops.item_path(&ItemId::Property(prop)).await, "/a/item[2]/system:primaryType");
        assert!(session.has_item_state(&ItemId::Node(second.id)).await.unwrap());
    }
}
