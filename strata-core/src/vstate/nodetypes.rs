//! Read-only view of the node type registry as a virtual subtree

use super::{VirtualItemStateProvider, VirtualTreeProvider};
use crate::error::Result;
use crate::id::{IdRange, Name, NodeId};
use crate::schema::NodeTypeRegistry;
use crate::value::{InternalValue, PropertyType};

const NODE_TYPES: &str = "system:nodeTypes";
const NODE_TYPE: &str = "system:nodeType";
const PROPERTY_DEFINITION: &str = "system:propertyDefinition";

/// Render every registered node type as a child of a new virtual root:
///
/// ```text
/// <root> (system:nodeTypes)
///   nt:unstructured (system:nodeType)
///     system:supertypes, system:isMixin
///     system:propertyDefinition[1..n]
///       system:name, system:requiredType, system:multiple, system:protected, ...
/// ```
pub async fn node_type_tree(
    registry: &dyn NodeTypeRegistry,
    range: IdRange,
    parent: NodeId,
) -> Result<VirtualTreeProvider> {
    let tree = VirtualTreeProvider::new(range, parent, Name::from(NODE_TYPES));
    let root = tree.virtual_root_id();

    let mut types = registry.node_types();
    types.sort_by(|a, b| a.name.cmp(&b.name));

    for node_type in &types {
        let type_node = tree
            .create_node_state(&root, node_type.name.clone(), None, Name::from(NODE_TYPE))
            .await?;
        set(
            &tree,
            type_node.id,
            "system:supertypes",
            PropertyType::Name,
            true,
            node_type.supertypes.iter().cloned().map(InternalValue::Name).collect(),
        )
        .await?;
        set(
            &tree,
            type_node.id,
            "system:isMixin",
            PropertyType::Boolean,
            false,
            vec![InternalValue::Boolean(node_type.mixin)],
        )
        .await?;

        for def in &node_type.property_defs {
            let def_node = tree
                .create_node_state(
                    &type_node.id,
                    Name::from(PROPERTY_DEFINITION),
                    None,
                    Name::from(PROPERTY_DEFINITION),
                )
                .await?;
            let name = def.name.clone().unwrap_or_else(|| Name::from("*"));
            set(&tree, def_node.id, "system:name", PropertyType::Name, false, vec![InternalValue::Name(name)])
                .await?;
            set(
                &tree,
                def_node.id,
                "system:requiredType",
                PropertyType::String,
                false,
                vec![InternalValue::String(def.required_type.name().to_string())],
            )
            .await?;
            for (flag, value) in [
                ("system:multiple", def.multiple),
                ("system:protected", def.protected),
                ("system:autoCreated", def.auto_created),
                ("system:mandatory", def.mandatory),
            ] {
                set(&tree, def_node.id, flag, PropertyType::Boolean, false, vec![InternalValue::Boolean(value)])
                    .await?;
            }
        }
    }

    tracing::debug!("Rendered {} node types into virtual tree {}", types.len(), root);
    Ok(tree)
}

async fn set(
    tree: &VirtualTreeProvider,
    node: NodeId,
    name: &str,
    ty: PropertyType,
    multi_valued: bool,
    values: Vec<InternalValue>,
) -> Result<()> {
    let prop = tree.create_property_state(&node, Name::from(name), ty, multi_valued).await?;
    tree.set_property_values(&prop.id, values)
}
