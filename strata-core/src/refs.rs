//! Reference tracker
//!
//! Bulk construction may write reference values before their targets exist,
//! or in terms of identifiers that get replaced by freshly assigned ones.
//! The tracker remembers every reference property written during one
//! construction unit plus the provisional-to-final identifier mapping, and
//! rewrites the values once the unit is complete.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, StateError};
use crate::id::{ItemId, NodeId, PropertyId};
use crate::manager::{ItemStateManager, WritableStateManager};
use crate::ops::ItemOps;
use crate::state::{ItemState, PropertyState};
use crate::value::InternalValue;

/// What to do with strong references whose target never materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnresolvedPolicy {
    /// Fail the whole construction unit
    #[default]
    Fail,
    /// Remove the dangling values, and the property if none remain
    Drop,
}

#[derive(Debug, Default)]
pub struct ReferenceTracker {
    mapping: HashMap<NodeId, NodeId>,
    references: Vec<PropertyId>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the node known as `old` was created as `new`
    pub fn map_id(&mut self, old: NodeId, new: NodeId) {
        self.mapping.insert(old, new);
    }

    pub fn mapped_id(&self, old: &NodeId) -> Option<&NodeId> {
        self.mapping.get(old)
    }

    /// Remember a reference property for resolution; non-reference
    /// properties are ignored
    pub fn record_reference(&mut self, prop: &PropertyState) {
        if prop.property_type.is_reference() && !self.references.contains(&prop.id) {
            self.references.push(prop.id.clone());
        }
    }

    pub fn tracked(&self) -> &[PropertyId] {
        &self.references
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn clear(&mut self) {
        self.mapping.clear();
        self.references.clear();
    }

    fn final_target(&self, target: &NodeId) -> NodeId {
        self.mapping.get(target).copied().unwrap_or(*target)
    }

    /// Tracked properties holding a strong reference that, after mapping,
    /// points at no node visible through `states`.
    ///
    /// Weak references may dangle and are never reported.
    pub async fn resolve<S>(&self, states: &S) -> Result<Vec<PropertyId>>
    where
        S: ItemStateManager + ?Sized,
    {
        let mut unresolved = Vec::new();
        for id in &self.references {
            let prop = match states.get_property_state(id).await {
                Ok(prop) => prop,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            for value in &prop.values {
                if let InternalValue::Reference(target) = value {
                    let target = self.final_target(target);
                    if !states.has_item_state(&ItemId::Node(target)).await? {
                        unresolved.push(id.clone());
                        break;
                    }
                }
            }
        }
        Ok(unresolved)
    }

    /// Rewrite every tracked property through the identifier mapping.
    ///
    /// With [`UnresolvedPolicy::Fail`] nothing is written when a strong
    /// reference stays unresolved. With [`UnresolvedPolicy::Drop`] the
    /// dangling values are removed and the affected properties returned.
    /// The tracker is cleared on success.
    pub async fn apply_resolution(&mut self, ops: &ItemOps<'_>, policy: UnresolvedPolicy) -> Result<Vec<PropertyId>> {
        let states = ops.states();
        let unresolved = self.resolve(states).await?;
        if !unresolved.is_empty() && policy == UnresolvedPolicy::Fail {
            return Err(StateError::UnresolvedReference(unresolved));
        }
        let dangling: BTreeSet<PropertyId> = unresolved.iter().cloned().collect();

        for id in &self.references {
            let mut prop = match states.get_property_state(id).await {
                Ok(prop) => prop,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            let mut changed = false;
            let mut values = Vec::with_capacity(prop.values.len());
            for value in std::mem::take(&mut prop.values) {
                match &value {
                    InternalValue::Reference(target) => {
                        let mapped = self.final_target(target);
                        if dangling.contains(id) && !states.has_item_state(&ItemId::Node(mapped)).await? {
                            tracing::warn!("Dropping dangling reference {} -> {}", id, target);
                            changed = true;
                            continue;
                        }
                        changed |= mapped != *target;
                        values.push(InternalValue::Reference(mapped));
                    }
                    InternalValue::WeakReference(target) => {
                        let mapped = self.final_target(target);
                        changed |= mapped != *target;
                        values.push(InternalValue::WeakReference(mapped));
                    }
                    _ => values.push(value),
                }
            }

            if !changed {
                continue;
            }
            if values.is_empty() || (!prop.multi_valued && values.len() != 1) {
                states.destroy(&ItemId::Property(id.clone())).await?;
                continue;
            }
            prop.values = values;
            states.store(ItemState::Property(prop)).await?;
        }

        self.clear();
        Ok(unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalStore;
    use crate::config::StrataConfig;
    use crate::id::{names, Name};
    use crate::persistence::MemoryPersistenceManager;
    use crate::schema::StaticNodeTypeRegistry;
    use crate::session::SessionOverlay;
    use crate::value::PropertyType;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    async fn session() -> SessionOverlay {
        let pm = Arc::new(MemoryPersistenceManager::new());
        let store = CanonicalStore::open(pm, &StrataConfig::default()).await.unwrap();
        store.initialize_root(Name::from(names::NT_UNSTRUCTURED)).await.unwrap();
        SessionOverlay::new(Arc::new(store))
    }

    async fn reference(session: &SessionOverlay, name: &str, values: Vec<InternalValue>) -> PropertyState {
        let ty = values[0].property_type();
        let mut prop = session
            .create_property_state(&NodeId::ROOT, Name::from(name), ty, values.len() > 1)
            .await
            .unwrap();
        prop.values = values;
        session.store(ItemState::Property(prop.clone())).await.unwrap();
        prop
    }

    async fn add_node(ops: &ItemOps<'_>, name: &str, id: Option<NodeId>) -> NodeId {
        ops.add_node(&NodeId::ROOT, Name::from(name), Name::from(names::NT_UNSTRUCTURED), BTreeSet::new(), id)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_forward_reference_resolves_through_mapping() {
        let session = session().await;
        let registry = StaticNodeTypeRegistry::with_builtins();
        let ops = ItemOps::new(&session, &registry);
        let mut tracker = ReferenceTracker::new();

        let provisional = NodeId::generate();
        let prop = reference(&session, "link", vec![InternalValue::Reference(provisional)]).await;
        tracker.record_reference(&prop);
        assert_eq!(tracker.resolve(&session).await.unwrap(), vec![prop.id.clone()]);

        let created = add_node(&ops, "target", None).await;
        tracker.map_id(provisional, created);
        assert!(tracker.resolve(&session).await.unwrap().is_empty());

        let unresolved = tracker.apply_resolution(&ops, UnresolvedPolicy::Fail).await.unwrap();
        assert!(unresolved.is_empty());
        assert!(tracker.is_empty());
        let stored = session.get_property_state(&prop.id).await.unwrap();
        assert_eq!(stored.values, vec![InternalValue::Reference(created)]);
        session.save().await.unwrap();
    }

    #[tokio::test]
    async fn test_target_created_later_with_same_id() {
        let session = session().await;
        let registry = StaticNodeTypeRegistry::with_builtins();
        let ops = ItemOps::new(&session, &registry);
        let mut tracker = ReferenceTracker::new();

        let target = NodeId::generate();
        let prop = reference(&session, "link", vec![InternalValue::Reference(target)]).await;
        tracker.record_reference(&prop);
        add_node(&ops, "later", Some(target)).await;

        assert!(tracker.apply_resolution(&ops, UnresolvedPolicy::Fail).await.unwrap().is_empty());
        session.save().await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_policy_writes_nothing() {
        let session = session().await;
        let registry = StaticNodeTypeRegistry::with_builtins();
        let ops = ItemOps::new(&session, &registry);
        let mut tracker = ReferenceTracker::new();

        let known = add_node(&ops, "known", None).await;
        let missing = NodeId::generate();
        let renamed = NodeId::generate();
        let prop = reference(
            &session,
            "links",
            vec![InternalValue::Reference(renamed), InternalValue::Reference(missing)],
        )
        .await;
        tracker.record_reference(&prop);
        tracker.map_id(renamed, known);

        match tracker.apply_resolution(&ops, UnresolvedPolicy::Fail).await {
            Err(StateError::UnresolvedReference(ids)) => assert_eq!(ids, vec![prop.id.clone()]),
            other => panic!("unexpected result {:?}", other),
        }
        let untouched = session.get_property_state(&prop.id).await.unwrap();
        assert_eq!(untouched.values, prop.values);
        assert!(!tracker.is_empty());
    }

    #[tokio::test]
    async fn test_drop_policy_removes_dangling_values() {
        let session = session().await;
        let registry = StaticNodeTypeRegistry::with_builtins();
        let ops = ItemOps::new(&session, &registry);
        let mut tracker = ReferenceTracker::new();

        let known = add_node(&ops, "known", None).await;
        let multi = reference(
            &session,
            "links",
            vec![InternalValue::Reference(known), InternalValue::Reference(NodeId::generate())],
        )
        .await;
        let single = reference(&session, "link", vec![InternalValue::Reference(NodeId::generate())]).await;
        let weak = reference(&session, "weak", vec![InternalValue::WeakReference(NodeId::generate())]).await;
        for prop in [&multi, &single, &weak] {
            tracker.record_reference(prop);
        }

        let dropped = tracker.apply_resolution(&ops, UnresolvedPolicy::Drop).await.unwrap();
        assert_eq!(dropped.len(), 2);
        assert_eq!(
            session.get_property_state(&multi.id).await.unwrap().values,
            vec![InternalValue::Reference(known)]
        );
        assert!(session.get_property_state(&single.id).await.unwrap_err().is_not_found());
        // weak references may dangle
        assert_eq!(session.get_property_state(&weak.id).await.unwrap().values, weak.values);
        session.save().await.unwrap();
    }

    #[test]
    fn test_only_reference_properties_are_tracked() {
        let mut tracker = ReferenceTracker::new();
        let plain = PropertyState::new(
            PropertyId::new(NodeId::generate(), Name::from("title")),
            PropertyType::String,
            false,
        );
        tracker.record_reference(&plain);
        assert!(tracker.is_empty());
    }
}
