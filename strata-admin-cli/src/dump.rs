//! Export stored or virtual subtrees as system view documents

use anyhow::Result;
use std::sync::Arc;
use strata_core::import::sysview;
use strata_core::{
    node_type_tree, IdRange, ItemStateManager, NodeId, NodeInfo, StaticNodeTypeRegistry,
    VirtualFederation, VirtualItemStateProvider,
};

use crate::Store;

/// Reserved id range of the node type tree
const NODE_TYPES_RANGE: [u8; 8] = [0x7e, 0x5e, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00];

/// Export the subtree rooted at `node` (the root node when `None`)
pub async fn dump_subtree(store: &Store, node: Option<&str>) -> Result<String> {
    let id = match node {
        Some(id) => NodeId::parse(id)?,
        None => NodeId::ROOT,
    };
    let name = subtree_name(store.canonical.as_ref(), &id).await?;
    let info = NodeInfo::from_state(store.canonical.as_ref(), id, name).await?;
    Ok(sysview::to_xml(&info)?)
}

/// Export the registered node types, as exposed by the virtual node type tree
pub async fn dump_node_types(store: &Store) -> Result<String> {
    let registry = StaticNodeTypeRegistry::with_builtins();
    let provider = Arc::new(node_type_tree(&registry, IdRange::new(NODE_TYPES_RANGE)?, NodeId::ROOT).await?);
    let root = provider.virtual_root_id();

    let federation = VirtualFederation::new(store.canonical.clone());
    federation.mount(provider).await?;
    let info = NodeInfo::from_state(&federation, root, "system:nodeTypes".into()).await?;
    Ok(sysview::to_xml(&info)?)
}

async fn subtree_name(states: &dyn ItemStateManager, id: &NodeId) -> Result<strata_core::Name> {
    let node = states.get_node_state(id).await?;
    let Some(parent) = node.parent_id else {
        return Ok(strata_core::Name::from(strata_core::names::ROOT));
    };
    let parent = states.get_node_state(&parent).await?;
    Ok(parent
        .child_entry_by_id(id)
        .map(|e| e.name.clone())
        .unwrap_or_else(|| strata_core::Name::from(id.to_string())))
}
