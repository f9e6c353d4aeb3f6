//! Live node handle
//!
//! Session-level setter API used when content is applied to a node the way
//! an interactive client would: each assignment resolves its own property
//! definition and is checked before anything is stored.

use crate::error::{Result, StateError};
use crate::id::{Name, NodeId};
use crate::ops::ItemOps;
use crate::schema::{self, PropertyDefinition};
use crate::state::PropertyState;
use crate::value::{InternalValue, PropertyType};

/// Why a scalar assignment was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The value cannot take the shape or type the property requires
    TypeMismatch,
    /// No applicable definition, or the value breaks the definition
    Constraint,
}

/// Outcome of [`LiveNode::set_scalar`]; a rejection leaves the node unchanged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalarAttempt {
    Assigned,
    Rejected(Rejection),
}

pub struct LiveNode<'a> {
    ops: ItemOps<'a>,
    id: NodeId,
}

impl<'a> LiveNode<'a> {
    pub fn new(ops: ItemOps<'a>, id: NodeId) -> Self {
        Self { ops, id }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn ops(&self) -> &ItemOps<'a> {
        &self.ops
    }

    pub async fn property(&self, name: &Name) -> Result<Option<PropertyState>> {
        let node = self.ops.node_state(&self.id).await?;
        self.ops.property_state(&node, name).await
    }

    /// Assign a single value
    pub async fn set_scalar(&self, name: &Name, value: InternalValue) -> Result<ScalarAttempt> {
        let node = self.ops.node_state(&self.id).await?;
        let existing = self.ops.property_state(&node, name).await?;
        if existing.as_ref().is_some_and(|p| p.multi_valued) {
            return Ok(ScalarAttempt::Rejected(Rejection::TypeMismatch));
        }

        let ent = self.ops.effective_node_type(&node)?;
        let def = match ent.applicable_property_def(name, value.property_type(), Some(false)) {
            Ok(def) if !def.protected => def.clone(),
            Ok(_) | Err(StateError::ConstraintViolation(_)) => {
                return Ok(ScalarAttempt::Rejected(Rejection::Constraint));
            }
            Err(e) => return Err(e),
        };

        let target = resolved_type(&def, value.property_type());
        let converted = match value.convert(target) {
            Ok(v) => v,
            Err(StateError::ValueFormat(_)) => return Ok(ScalarAttempt::Rejected(Rejection::TypeMismatch)),
            Err(e) => return Err(e),
        };

        let mut prop = match existing {
            Some(prop) => prop,
            None => self.ops.create_property_state(&node, name.clone(), target, &def).await?,
        };
        prop.property_type = target;
        prop.definition = Some(def.id.clone());
        prop.values = vec![converted];

        match schema::validate(&prop, &def) {
            Ok(()) => {}
            Err(StateError::ConstraintViolation(msg)) => {
                tracing::debug!("scalar assignment to {} rejected: {}", prop.id, msg);
                return Ok(ScalarAttempt::Rejected(Rejection::Constraint));
            }
            Err(e) => return Err(e),
        }
        self.ops.store(prop).await?;
        Ok(ScalarAttempt::Assigned)
    }

    /// Assign a value array of type `property_type`
    pub async fn set_array(&self, name: &Name, values: Vec<InternalValue>, property_type: PropertyType) -> Result<()> {
        let node = self.ops.node_state(&self.id).await?;
        let existing = self.ops.property_state(&node, name).await?;
        if let Some(prop) = existing.as_ref().filter(|p| !p.multi_valued) {
            return Err(StateError::ValueFormat(format!(
                "{} is single-valued and cannot hold an array",
                self.ops.item_path(&prop.id.clone().into()).await
            )));
        }

        let ent = self.ops.effective_node_type(&node)?;
        let def = ent.applicable_property_def(name, property_type, Some(true))?.clone();
        if def.protected {
            return Err(StateError::ConstraintViolation(format!(
                "{} is protected",
                node.property_id(name)
            )));
        }

        let nominal = match property_type {
            PropertyType::Undefined => values.first().map(|v| v.property_type()).unwrap_or(PropertyType::String),
            ty => ty,
        };
        let target = resolved_type(&def, nominal);
        let converted = values
            .iter()
            .map(|v| v.convert(target))
            .collect::<Result<Vec<_>>>()?;

        let mut prop = match existing {
            Some(prop) => prop,
            None => self.ops.create_property_state(&node, name.clone(), target, &def).await?,
        };
        prop.property_type = target;
        prop.definition = Some(def.id.clone());
        prop.values = converted;
        schema::validate(&prop, &def)?;
        self.ops.store(prop).await
    }
}

/// Required type of `def`, else `nominal`, else STRING
pub(crate) fn resolved_type(def: &PropertyDefinition, nominal: PropertyType) -> PropertyType {
    match (def.required_type, nominal) {
        (PropertyType::Undefined, PropertyType::Undefined) => PropertyType::String,
        (PropertyType::Undefined, nominal) => nominal,
        (required, _) => required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalStore;
    use crate::config::StrataConfig;
    use crate::id::names;
    use crate::manager::WritableStateManager;
    use crate::persistence::MemoryPersistenceManager;
    use crate::schema::{NodeTypeDefinition, StaticNodeTypeRegistry, ValueConstraint};
    use crate::session::SessionOverlay;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn registry() -> StaticNodeTypeRegistry {
        let registry = StaticNodeTypeRegistry::with_builtins();
        registry
            .register(
                NodeTypeDefinition::new("test:article")
                    .supertype(names::NT_BASE)
                    .property("count", PropertyType::Long, false)
                    .property("tags", PropertyType::String, true)
                    .property_with("status", PropertyType::String, false, |d| {
                        d.with_constraint(ValueConstraint::OneOf(vec!["draft".into(), "live".into()]))
                    }),
            )
            .unwrap();
        registry
    }

    async fn session() -> SessionOverlay {
        let pm = Arc::new(MemoryPersistenceManager::new());
        let store = CanonicalStore::open(pm, &StrataConfig::default()).await.unwrap();
        store.initialize_root(Name::from(names::NT_UNSTRUCTURED)).await.unwrap();
        SessionOverlay::new(Arc::new(store))
    }

    async fn article(ops: &ItemOps<'_>) -> NodeId {
        ops.add_node(&NodeId::ROOT, Name::from("a"), Name::from("test:article"), BTreeSet::new(), None)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_scalar_converted_to_required_type() {
        let session = session().await;
        let registry = registry();
        let ops = ItemOps::new(&session, &registry);
        let node = LiveNode::new(ops, article(&ops).await);

        let count = Name::from("count");
        let attempt = node.set_scalar(&count, InternalValue::String("7".into())).await.unwrap();
        assert_eq!(attempt, ScalarAttempt::Assigned);
        let prop = node.property(&count).await.unwrap().unwrap();
        assert_eq!(prop.values, vec![InternalValue::Long(7)]);
        assert!(!prop.multi_valued);
    }

    #[tokio::test]
    async fn test_scalar_rejections_leave_node_unchanged() {
        let session = session().await;
        let registry = registry();
        let ops = ItemOps::new(&session, &registry);
        let node = LiveNode::new(ops, article(&ops).await);

        let bad_long = node
            .set_scalar(&Name::from("count"), InternalValue::String("many".into()))
            .await
            .unwrap();
        assert_eq!(bad_long, ScalarAttempt::Rejected(Rejection::TypeMismatch));

        let multi_only = node
            .set_scalar(&Name::from("tags"), InternalValue::String("x".into()))
            .await
            .unwrap();
        assert_eq!(multi_only, ScalarAttempt::Rejected(Rejection::Constraint));

        let outside = node
            .set_scalar(&Name::from("status"), InternalValue::String("gone".into()))
            .await
            .unwrap();
        assert_eq!(outside, ScalarAttempt::Rejected(Rejection::Constraint));

        let protected = node
            .set_scalar(&Name::from(names::PRIMARY_TYPE), InternalValue::Name(Name::from("x")))
            .await
            .unwrap();
        assert_eq!(protected, ScalarAttempt::Rejected(Rejection::Constraint));

        for name in ["count", "tags", "status"] {
            assert!(node.property(&Name::from(name)).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_array_assignment() {
        let session = session().await;
        let registry = registry();
        let ops = ItemOps::new(&session, &registry);
        let node = LiveNode::new(ops, article(&ops).await);

        let tags = Name::from("tags");
        node.set_array(&tags, vec![InternalValue::String("a".into())], PropertyType::String)
            .await
            .unwrap();
        let prop = node.property(&tags).await.unwrap().unwrap();
        assert!(prop.multi_valued);

        // scalar into an existing array property is a shape mismatch
        let attempt = node.set_scalar(&tags, InternalValue::String("b".into())).await.unwrap();
        assert_eq!(attempt, ScalarAttempt::Rejected(Rejection::TypeMismatch));

        node.set_scalar(&Name::from("count"), InternalValue::Long(1)).await.unwrap();
        let err = node
            .set_array(&Name::from("count"), vec![InternalValue::Long(1)], PropertyType::Long)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::ValueFormat(_)));
        assert!(session.is_dirty().await);
    }
}
