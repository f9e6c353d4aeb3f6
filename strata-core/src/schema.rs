//! Node type schema
//!
//! The schema is an external collaborator: the core only needs effective
//! node types and property definitions. [`StaticNodeTypeRegistry`] is an
//! in-memory registry with the built-in types the core itself relies on.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::RwLock;

use crate::error::{Result, StateError};
use crate::id::{names, Name};
use crate::state::PropertyState;
use crate::value::{InternalValue, PropertyType};

/// Stable identifier of a property definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropDefId(String);

impl PropDefId {
    fn for_definition(declaring: &Name, name: Option<&Name>, ty: PropertyType, multiple: bool) -> Self {
        let name = name.map(|n| n.as_str()).unwrap_or("*");
        Self(format!("{}/{}/{}/{}", declaring, name, ty.name(), if multiple { "m" } else { "s" }))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropDefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Restriction on individual values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueConstraint {
    /// Inclusive numeric bounds, for LONG, DOUBLE and DECIMAL values
    Range { min: Option<f64>, max: Option<f64> },
    /// Text form must be one of the listed values
    OneOf(Vec<String>),
    /// Maximum length of the text form
    MaxLength(usize),
}

impl ValueConstraint {
    fn check(&self, value: &InternalValue) -> std::result::Result<(), String> {
        match self {
            ValueConstraint::Range { min, max } => {
                let n = match value {
                    InternalValue::Long(v) => *v as f64,
                    InternalValue::Double(v) => *v,
                    InternalValue::Decimal(s) => s.parse::<f64>().map_err(|e| e.to_string())?,
                    _ => return Ok(()),
                };
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(format!("{} outside range {:?}..{:?}", n, min, max));
                }
                Ok(())
            }
            ValueConstraint::OneOf(allowed) => {
                let text = value.to_text();
                if allowed.iter().any(|a| a == &text) {
                    Ok(())
                } else {
                    Err(format!("'{}' not one of {:?}", text, allowed))
                }
            }
            ValueConstraint::MaxLength(max) => {
                let len = value.to_text().chars().count();
                if len > *max {
                    Err(format!("length {} exceeds {}", len, max))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub id: PropDefId,
    pub declaring_type: Name,
    /// `None` for a residual (`*`) definition
    pub name: Option<Name>,
    pub required_type: PropertyType,
    pub multiple: bool,
    pub protected: bool,
    pub auto_created: bool,
    pub mandatory: bool,
    pub constraints: Vec<ValueConstraint>,
}

impl PropertyDefinition {
    pub fn new(declaring_type: Name, name: Option<Name>, required_type: PropertyType, multiple: bool) -> Self {
        Self {
            id: PropDefId::for_definition(&declaring_type, name.as_ref(), required_type, multiple),
            declaring_type,
            name,
            required_type,
            multiple,
            protected: false,
            auto_created: false,
            mandatory: false,
            constraints: Vec::new(),
        }
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    pub fn auto_created(mut self) -> Self {
        self.auto_created = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn with_constraint(mut self, constraint: ValueConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn is_residual(&self) -> bool {
        self.name.is_none()
    }

    fn accepts_type(&self, ty: PropertyType) -> bool {
        self.required_type == PropertyType::Undefined
            || ty == PropertyType::Undefined
            || self.required_type == ty
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeDefinition {
    pub name: Name,
    pub supertypes: Vec<Name>,
    pub mixin: bool,
    pub property_defs: Vec<PropertyDefinition>,
}

impl NodeTypeDefinition {
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            supertypes: Vec::new(),
            mixin: false,
            property_defs: Vec::new(),
        }
    }

    pub fn mixin(mut self) -> Self {
        self.mixin = true;
        self
    }

    pub fn supertype(mut self, name: impl Into<Name>) -> Self {
        self.supertypes.push(name.into());
        self
    }

    /// Add a named property definition declared by this type
    pub fn property(self, name: &str, ty: PropertyType, multiple: bool) -> Self {
        self.property_with(name, ty, multiple, |d| d)
    }

    /// Add a named property definition and adjust it with `f`
    pub fn property_with(
        mut self,
        name: &str,
        ty: PropertyType,
        multiple: bool,
        f: impl FnOnce(PropertyDefinition) -> PropertyDefinition,
    ) -> Self {
        let def = PropertyDefinition::new(self.name.clone(), Some(Name::from(name)), ty, multiple);
        self.property_defs.push(f(def));
        self
    }

    /// Add a residual property definition
    pub fn residual(mut self, ty: PropertyType, multiple: bool) -> Self {
        let def = PropertyDefinition::new(self.name.clone(), None, ty, multiple);
        self.property_defs.push(def);
        self
    }
}

/// Inheritance-flattened view of a primary type plus its mixins
#[derive(Debug, Clone)]
pub struct EffectiveNodeType {
    names: BTreeSet<Name>,
    property_defs: Vec<PropertyDefinition>,
}

impl EffectiveNodeType {
    pub fn includes(&self, type_name: &Name) -> bool {
        self.names.contains(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &Name> {
        self.names.iter()
    }

    pub fn property_defs(&self) -> &[PropertyDefinition] {
        &self.property_defs
    }

    /// Find the definition applying to a property `name` of type `ty`.
    ///
    /// `multiple` restricts the multiplicity; `None` accepts either. Named
    /// definitions win over residual ones. Among candidates, a definition
    /// with a concrete required type beats an undefined one, and a
    /// single-valued one beats a multi-valued one.
    pub fn applicable_property_def(
        &self,
        name: &Name,
        ty: PropertyType,
        multiple: Option<bool>,
    ) -> Result<&PropertyDefinition> {
        let candidates = |residual: bool| {
            self.property_defs.iter().filter(move |d| {
                let name_matches = match &d.name {
                    Some(n) => !residual && n == name,
                    None => residual,
                };
                name_matches && d.accepts_type(ty) && multiple.is_none_or(|m| m == d.multiple)
            })
        };

        best_match(candidates(false))
            .or_else(|| best_match(candidates(true)))
            .ok_or_else(|| {
                StateError::ConstraintViolation(format!(
                    "no matching property definition found for {} (type {}, multiple {:?})",
                    name, ty, multiple
                ))
            })
    }

    /// Definitions whose properties must be created with every node
    pub fn auto_created_property_defs(&self) -> impl Iterator<Item = &PropertyDefinition> {
        self.property_defs.iter().filter(|d| d.auto_created)
    }
}

fn best_match<'a>(defs: impl Iterator<Item = &'a PropertyDefinition>) -> Option<&'a PropertyDefinition> {
    let mut best: Option<&PropertyDefinition> = None;
    for def in defs {
        best = match best {
            None => Some(def),
            Some(current) => {
                let better = if current.required_type != def.required_type {
                    current.required_type == PropertyType::Undefined
                } else {
                    current.multiple && !def.multiple
                };
                Some(if better { def } else { current })
            }
        };
        if let Some(b) = best {
            if b.required_type != PropertyType::Undefined && !b.multiple {
                break;
            }
        }
    }
    best
}

/// Check a property state against its definition
pub fn validate(prop: &PropertyState, def: &PropertyDefinition) -> Result<()> {
    let violation = |msg: String| Err(StateError::ConstraintViolation(format!("{}: {}", prop.id, msg)));

    if def.required_type != PropertyType::Undefined && prop.property_type != def.required_type {
        return violation(format!(
            "type {} does not match required type {}",
            prop.property_type, def.required_type
        ));
    }
    if prop.multi_valued != def.multiple {
        return violation(if def.multiple {
            "must be multi-valued".to_string()
        } else {
            "is not multi-valued".to_string()
        });
    }
    if !prop.multi_valued && prop.values.len() != 1 {
        return violation(format!("single-valued property holds {} values", prop.values.len()));
    }
    if def.mandatory && prop.values.is_empty() {
        return violation("mandatory property has no value".to_string());
    }
    for value in &prop.values {
        if value.property_type() != prop.property_type {
            return violation(format!(
                "value of type {} in property of type {}",
                value.property_type(),
                prop.property_type
            ));
        }
        for constraint in &def.constraints {
            if let Err(msg) = constraint.check(value) {
                return violation(msg);
            }
        }
    }
    Ok(())
}

/// Source of effective node types and property definitions
pub trait NodeTypeRegistry: Send + Sync {
    fn effective_node_type(&self, primary: &Name, mixins: &BTreeSet<Name>) -> Result<EffectiveNodeType>;

    fn property_definition(&self, id: &PropDefId) -> Result<PropertyDefinition>;

    fn node_types(&self) -> Vec<NodeTypeDefinition>;

    fn has_node_type(&self, name: &Name) -> bool {
        self.node_types().iter().any(|t| &t.name == name)
    }
}

/// In-memory node type registry
pub struct StaticNodeTypeRegistry {
    types: RwLock<HashMap<Name, NodeTypeDefinition>>,
}

impl StaticNodeTypeRegistry {
    /// Registry holding `nt:base`, `nt:unstructured` and `mix:referenceable`
    pub fn with_builtins() -> Self {
        let registry = Self {
            types: RwLock::new(HashMap::new()),
        };
        let builtins = [
            NodeTypeDefinition::new(names::NT_BASE)
                .property_with(names::PRIMARY_TYPE, PropertyType::Name, false, |d| {
                    d.protected().auto_created().mandatory()
                })
                .property_with(names::MIXIN_TYPES, PropertyType::Name, true, |d| d.protected()),
            NodeTypeDefinition::new(names::MIX_REFERENCEABLE)
                .mixin()
                .property_with(names::UUID, PropertyType::String, false, |d| {
                    d.protected().auto_created().mandatory()
                }),
            NodeTypeDefinition::new(names::NT_UNSTRUCTURED)
                .supertype(names::NT_BASE)
                .residual(PropertyType::Undefined, false)
                .residual(PropertyType::Undefined, true),
        ];
        for def in builtins {
            if let Ok(mut types) = registry.types.write() {
                types.insert(def.name.clone(), def);
            }
        }
        registry
    }

    /// Register a node type; every supertype must already be known
    pub fn register(&self, def: NodeTypeDefinition) -> Result<()> {
        let mut types = self
            .types
            .write()
            .map_err(|_| StateError::InvalidState("node type registry poisoned".into()))?;
        if types.contains_key(&def.name) {
            return Err(StateError::ItemExists(format!("node type {}", def.name)));
        }
        if let Some(missing) = def.supertypes.iter().find(|s| !types.contains_key(*s)) {
            return Err(StateError::ConstraintViolation(format!(
                "{} extends unknown node type {}",
                def.name, missing
            )));
        }
        tracing::debug!("registered node type {}", def.name);
        types.insert(def.name.clone(), def);
        Ok(())
    }

    fn collect(
        types: &HashMap<Name, NodeTypeDefinition>,
        name: &Name,
        seen: &mut BTreeSet<Name>,
        defs: &mut Vec<PropertyDefinition>,
    ) -> Result<()> {
        if !seen.insert(name.clone()) {
            return Ok(());
        }
        let def = types
            .get(name)
            .ok_or_else(|| StateError::ConstraintViolation(format!("unknown node type {}", name)))?;
        defs.extend(def.property_defs.iter().cloned());
        for supertype in &def.supertypes {
            Self::collect(types, supertype, seen, defs)?;
        }
        Ok(())
    }
}

impl Default for StaticNodeTypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl NodeTypeRegistry for StaticNodeTypeRegistry {
    fn effective_node_type(&self, primary: &Name, mixins: &BTreeSet<Name>) -> Result<EffectiveNodeType> {
        let types = self
            .types
            .read()
            .map_err(|_| StateError::InvalidState("node type registry poisoned".into()))?;
        let mut names = BTreeSet::new();
        let mut property_defs = Vec::new();
        if types.get(primary).is_some_and(|t| t.mixin) {
            return Err(StateError::ConstraintViolation(format!(
                "{} is a mixin and cannot be a primary type",
                primary
            )));
        }
        Self::collect(&types, primary, &mut names, &mut property_defs)?;
        for mixin in mixins {
            Self::collect(&types, mixin, &mut names, &mut property_defs)?;
        }
        Ok(EffectiveNodeType { names, property_defs })
    }

    fn property_definition(&self, id: &PropDefId) -> Result<PropertyDefinition> {
        let types = self
            .types
            .read()
            .map_err(|_| StateError::InvalidState("node type registry poisoned".into()))?;
        types
            .values()
            .flat_map(|t| t.property_defs.iter())
            .find(|d| &d.id == id)
            .cloned()
            .ok_or_else(|| StateError::ConstraintViolation(format!("unknown property definition {}", id)))
    }

    fn node_types(&self) -> Vec<NodeTypeDefinition> {
        let mut all: Vec<_> = self
            .types
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{NodeId, PropertyId};

    fn registry() -> StaticNodeTypeRegistry {
        let registry = StaticNodeTypeRegistry::with_builtins();
        registry
            .register(
                NodeTypeDefinition::new("test:doc")
                    .supertype(names::NT_BASE)
                    .property("title", PropertyType::String, false)
                    .property("tags", PropertyType::String, true)
                    .property_with("rank", PropertyType::Long, false, |d| {
                        d.with_constraint(ValueConstraint::Range { min: Some(0.0), max: Some(10.0) })
                    })
                    .residual(PropertyType::Undefined, false),
            )
            .unwrap();
        registry
    }

    fn doc_type(registry: &StaticNodeTypeRegistry) -> EffectiveNodeType {
        registry
            .effective_node_type(&Name::from("test:doc"), &BTreeSet::new())
            .unwrap()
    }

    #[test]
    fn test_named_definition_beats_residual() {
        let registry = registry();
        let ent = doc_type(&registry);
        let def = ent
            .applicable_property_def(&Name::from("title"), PropertyType::String, None)
            .unwrap();
        assert_eq!(def.name, Some(Name::from("title")));

        let residual = ent
            .applicable_property_def(&Name::from("other"), PropertyType::Long, None)
            .unwrap();
        assert!(residual.is_residual());
    }

    #[test]
    fn test_multiplicity_filter() {
        let registry = registry();
        let ent = doc_type(&registry);
        let tags = Name::from("tags");
        assert!(ent.applicable_property_def(&tags, PropertyType::String, None).unwrap().multiple);
        assert!(ent.applicable_property_def(&tags, PropertyType::String, Some(true)).is_ok());
        // falls through to the single-valued residual definition
        let single = ent
            .applicable_property_def(&tags, PropertyType::String, Some(false))
            .unwrap();
        assert!(single.is_residual());
    }

    #[test]
    fn test_unstructured_prefers_single_valued() {
        let registry = registry();
        let ent = registry
            .effective_node_type(&Name::from(names::NT_UNSTRUCTURED), &BTreeSet::new())
            .unwrap();
        let def = ent
            .applicable_property_def(&Name::from("x"), PropertyType::String, None)
            .unwrap();
        assert!(!def.multiple);
        assert!(ent.includes(&Name::from(names::NT_BASE)));
    }

    #[test]
    fn test_no_match_is_constraint_violation() {
        let registry = StaticNodeTypeRegistry::with_builtins();
        let ent = registry
            .effective_node_type(&Name::from(names::NT_BASE), &BTreeSet::new())
            .unwrap();
        let err = ent
            .applicable_property_def(&Name::from("free"), PropertyType::String, None)
            .unwrap_err();
        assert!(matches!(err, StateError::ConstraintViolation(_)));
    }

    #[test]
    fn test_protected_builtin() {
        let registry = StaticNodeTypeRegistry::with_builtins();
        let ent = registry
            .effective_node_type(&Name::from(names::NT_UNSTRUCTURED), &BTreeSet::new())
            .unwrap();
        let def = ent
            .applicable_property_def(&Name::from(names::PRIMARY_TYPE), PropertyType::Name, None)
            .unwrap();
        assert!(def.protected);
        assert_eq!(ent.auto_created_property_defs().count(), 1);
    }

    #[test]
    fn test_mixins_extend_definitions() {
        let registry = StaticNodeTypeRegistry::with_builtins();
        let mixins = BTreeSet::from([Name::from(names::MIX_REFERENCEABLE)]);
        let ent = registry
            .effective_node_type(&Name::from(names::NT_UNSTRUCTURED), &mixins)
            .unwrap();
        assert!(ent.includes(&Name::from(names::MIX_REFERENCEABLE)));
        assert!(registry
            .effective_node_type(&Name::from(names::MIX_REFERENCEABLE), &BTreeSet::new())
            .is_err());
    }

    #[test]
    fn test_register_rejects_unknown_supertype() {
        let registry = StaticNodeTypeRegistry::with_builtins();
        let err = registry
            .register(NodeTypeDefinition::new("test:orphan").supertype("test:missing"))
            .unwrap_err();
        assert!(matches!(err, StateError::ConstraintViolation(_)));
    }

    #[test]
    fn test_validate() {
        let registry = registry();
        let ent = doc_type(&registry);
        let rank = ent
            .applicable_property_def(&Name::from("rank"), PropertyType::Long, None)
            .unwrap()
            .clone();
        assert_eq!(registry.property_definition(&rank.id).unwrap(), rank);

        let mut prop = PropertyState::new(
            PropertyId::new(NodeId::generate(), Name::from("rank")),
            PropertyType::Long,
            false,
        );
        prop.values = vec![InternalValue::Long(5)];
        assert!(validate(&prop, &rank).is_ok());

        prop.values = vec![InternalValue::Long(11)];
        assert!(matches!(validate(&prop, &rank), Err(StateError::ConstraintViolation(_))));

        prop.values = vec![InternalValue::Long(1), InternalValue::Long(2)];
        let err = validate(&prop, &rank).unwrap_err();
        assert!(err.to_string().contains("values"), "got: {}", err);
    }
}
