//! Property reconciler
//!
//! Applies one externally supplied property (name, nominal type, raw text
//! values) to a node. Two paths exist:
//!
//! - [`PropertyReconciler::apply_live`] goes through a [`LiveNode`], the way
//!   an interactive client would set the property;
//! - [`PropertyReconciler::apply_state`] merges directly into node state,
//!   accepting an existing property only when it was auto-created with a
//!   compatible shape.
//!
//! Protected properties are system-managed: both paths skip them silently.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};
use crate::id::{Name, NodeId, PropertyId};
use crate::live::{resolved_type, LiveNode, Rejection, ScalarAttempt};
use crate::ops::ItemOps;
use crate::refs::ReferenceTracker;
use crate::schema::{EffectiveNodeType, PropertyDefinition};
use crate::state::PropertyState;
use crate::value::{InternalValue, PropertyType, RawValue};

/// Which scalar rejections fall back to a one-element array assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalarFallback {
    /// Type mismatches and constraint rejections both fall back
    #[default]
    OnAnyRejection,
    /// Only type mismatches fall back; a constraint rejection is an error
    OnTypeMismatchOnly,
}

impl ScalarFallback {
    fn allows(&self, rejection: Rejection) -> bool {
        match self {
            ScalarFallback::OnAnyRejection => true,
            ScalarFallback::OnTypeMismatchOnly => rejection == Rejection::TypeMismatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The property is protected; nothing was written
    Skipped,
    Stored(PropertyId),
}

/// One property as supplied by an external source
#[derive(Debug, Clone, PartialEq)]
pub struct PropInfo {
    pub name: Name,
    pub nominal_type: PropertyType,
    pub values: Vec<RawValue>,
}

impl PropInfo {
    pub fn new(name: impl Into<Name>, nominal_type: PropertyType, values: Vec<RawValue>) -> Self {
        Self {
            name: name.into(),
            nominal_type,
            values,
        }
    }

    pub async fn apply_live(&self, node: &LiveNode<'_>, tracker: &mut ReferenceTracker) -> Result<Reconciled> {
        PropertyReconciler::default().apply_live(self, node, tracker).await
    }

    pub async fn apply_state(
        &self,
        node: &NodeId,
        ops: &ItemOps<'_>,
        tracker: &mut ReferenceTracker,
    ) -> Result<Reconciled> {
        PropertyReconciler::default().apply_state(self, node, ops, tracker).await
    }

    /// A single value may be stored either way; any other count needs a
    /// multi-valued definition
    fn applicable_def<'e>(&self, ent: &'e EffectiveNodeType) -> Result<&'e PropertyDefinition> {
        let multiple = if self.values.len() == 1 { None } else { Some(true) };
        ent.applicable_property_def(&self.name, self.nominal_type, multiple)
    }

    fn coerce(&self, target: PropertyType) -> Result<Vec<InternalValue>> {
        self.values.iter().map(|v| v.coerce(target)).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyReconciler {
    fallback: ScalarFallback,
}

impl PropertyReconciler {
    pub fn new(fallback: ScalarFallback) -> Self {
        Self { fallback }
    }

    pub fn fallback(&self) -> ScalarFallback {
        self.fallback
    }

    /// Apply `info` through a live node handle
    pub async fn apply_live(
        &self,
        info: &PropInfo,
        node: &LiveNode<'_>,
        tracker: &mut ReferenceTracker,
    ) -> Result<Reconciled> {
        let ops = node.ops();
        let state = ops.node_state(node.id()).await?;
        let ent = ops.effective_node_type(&state)?;
        let def = info.applicable_def(&ent)?;
        if def.protected {
            tracing::debug!("skipping protected property {}", info.name);
            return Ok(Reconciled::Skipped);
        }

        let target = resolved_type(def, info.nominal_type);
        let mut values = info.coerce(target)?;

        if values.len() == 1 {
            let value = values.remove(0);
            match node.set_scalar(&info.name, value.clone()).await? {
                ScalarAttempt::Assigned => {}
                ScalarAttempt::Rejected(rejection) if self.fallback.allows(rejection) => {
                    tracing::debug!(
                        "scalar assignment of {} rejected ({:?}), assigning as array",
                        info.name,
                        rejection
                    );
                    node.set_array(&info.name, vec![value], target).await?;
                }
                ScalarAttempt::Rejected(rejection) => {
                    return Err(StateError::ConstraintViolation(format!(
                        "{} rejected a single value ({:?})",
                        state.property_id(&info.name),
                        rejection
                    )));
                }
            }
        } else {
            node.set_array(&info.name, values, target).await?;
        }

        let prop = node
            .property(&info.name)
            .await?
            .ok_or_else(|| StateError::NotFound(state.property_id(&info.name).into()))?;
        if prop.property_type.is_reference() {
            tracker.record_reference(&prop);
        }
        Ok(Reconciled::Stored(prop.id))
    }

    /// Merge `info` directly into the state of `node`
    pub async fn apply_state(
        &self,
        info: &PropInfo,
        node: &NodeId,
        ops: &ItemOps<'_>,
        tracker: &mut ReferenceTracker,
    ) -> Result<Reconciled> {
        let node = ops.node_state(node).await?;

        let (mut prop, def) = match ops.property_state(&node, &info.name).await? {
            Some(prop) => {
                let def = match ops.property_definition(&prop) {
                    Ok(def) => def,
                    Err(_) => ops
                        .effective_node_type(&node)?
                        .applicable_property_def(&info.name, prop.property_type, Some(prop.multi_valued))?
                        .clone(),
                };
                if def.protected {
                    let path = ops.item_path(&prop.id.clone().into()).await;
                    tracing::debug!("skipping protected property {}", path);
                    return Ok(Reconciled::Skipped);
                }
                let type_conflict =
                    info.nominal_type != PropertyType::Undefined && prop.property_type != info.nominal_type;
                if !def.auto_created || type_conflict || def.multiple != prop.multi_valued {
                    return Err(StateError::ItemExists(ops.item_path(&prop.id.clone().into()).await));
                }
                (prop, def)
            }
            None => {
                let def = info.applicable_def(&ops.effective_node_type(&node)?)?.clone();
                if def.protected {
                    tracing::debug!("skipping protected property {}", info.name);
                    return Ok(Reconciled::Skipped);
                }
                let target = resolved_type(&def, info.nominal_type);
                let prop = ops.create_property_state(&node, info.name.clone(), target, &def).await?;
                (prop, def)
            }
        };

        if info.values.len() != 1 && !def.multiple {
            return Err(StateError::ConstraintViolation(format!(
                "{} is not multi-valued",
                ops.item_path(&prop.id.clone().into()).await
            )));
        }

        let nominal = match info.nominal_type {
            PropertyType::Undefined => prop.property_type,
            ty => ty,
        };
        let target = resolved_type(&def, nominal);
        prop.values = info.coerce(target)?;
        prop.property_type = target;
        prop.definition = Some(def.id.clone());

        ops.validate(&prop)?;
        if prop.property_type.is_reference() {
            tracker.record_reference(&prop);
        }
        let id = prop.id.clone();
        ops.store(prop).await?;
        Ok(Reconciled::Stored(id))
    }
}

impl From<&PropertyState> for PropInfo {
    /// Text form of a stored property, as an exporter would write it
    fn from(prop: &PropertyState) -> Self {
        Self {
            name: prop.name().clone(),
            nominal_type: prop.property_type,
            values: prop.values.iter().map(|v| RawValue::new(v.to_text())).collect(),
        }
    }
}
