//! Bulk import of content subtrees
//!
//! An [`Importer`] builds a whole subtree inside one session overlay:
//! nodes depth-first, each node's properties through the property
//! reconciler, then reference resolution over the complete unit, then one
//! save. Any failure discards the overlay, so an import is all or nothing.

pub mod sysview;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::StrataConfig;
use crate::error::{Result, StateError};
use crate::id::{names, ItemId, Name, NodeId, PropertyId};
use crate::live::LiveNode;
use crate::manager::{ItemStateManager, WritableStateManager};
use crate::ops::ItemOps;
use crate::reconcile::{PropInfo, PropertyReconciler, Reconciled, ScalarFallback};
use crate::refs::{ReferenceTracker, UnresolvedPolicy};
use crate::schema::NodeTypeRegistry;
use crate::session::SessionOverlay;

/// How identifiers carried by the imported content are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdBehavior {
    /// Assign fresh identifiers and rewrite references to them
    #[default]
    CreateNew,
    /// Keep the supplied identifiers; an identifier already in use fails the import
    KeepIds,
}

/// Which reconciliation path properties take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportMode {
    /// Through live node handles
    #[default]
    Live,
    /// Directly into node state
    State,
}

/// One node of an imported subtree
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: Name,
    pub primary_type: Name,
    pub mixins: BTreeSet<Name>,
    /// Identifier carried by the source, if any
    pub id: Option<NodeId>,
    pub props: Vec<PropInfo>,
    pub children: Vec<NodeInfo>,
}

impl NodeInfo {
    pub fn new(name: impl Into<Name>, primary_type: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            primary_type: primary_type.into(),
            mixins: BTreeSet::new(),
            id: None,
            props: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_mixin(mut self, mixin: impl Into<Name>) -> Self {
        self.mixins.insert(mixin.into());
        self
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_prop(mut self, prop: PropInfo) -> Self {
        self.props.push(prop);
        self
    }

    pub fn with_child(mut self, child: NodeInfo) -> Self {
        self.children.push(child);
        self
    }

    /// Number of nodes in this subtree
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(NodeInfo::node_count).sum::<usize>()
    }

    /// Snapshot of the stored subtree below `id`, named `name`
    pub fn from_state<'a, S>(
        states: &'a S,
        id: NodeId,
        name: Name,
    ) -> Pin<Box<dyn Future<Output = Result<NodeInfo>> + Send + 'a>>
    where
        S: ItemStateManager + ?Sized,
    {
        Box::pin(async move {
            let node = states.get_node_state(&id).await?;
            let mut info = NodeInfo::new(name, node.primary_type.clone());
            info.mixins = node.mixins.clone();
            info.id = Some(node.id);

            for prop_name in &node.property_names {
                if matches!(prop_name.as_str(), names::PRIMARY_TYPE | names::MIXIN_TYPES | names::UUID) {
                    continue;
                }
                let prop = states.get_property_state(&node.property_id(prop_name)).await?;
                info.props.push(PropInfo::from(&prop));
            }
            for entry in &node.child_entries {
                if entry.mounted && !states.has_item_state(&ItemId::Node(entry.id)).await? {
                    tracing::debug!("skipping unmounted virtual subtree {} at {}", entry.name, entry.id);
                    continue;
                }
                info.children
                    .push(NodeInfo::from_state(states, entry.id, entry.name.clone()).await?);
            }
            Ok(info)
        })
    }
}

/// Outcome of a completed import
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    /// Identifier of the imported subtree's root node
    pub root: Option<NodeId>,
    pub nodes: usize,
    pub properties: usize,
    /// Protected properties ignored
    pub skipped: usize,
    /// Properties that lost dangling reference values
    pub dropped_references: Vec<PropertyId>,
}

pub struct Importer {
    registry: Arc<dyn NodeTypeRegistry>,
    reconciler: PropertyReconciler,
    id_behavior: IdBehavior,
    unresolved: UnresolvedPolicy,
    mode: ImportMode,
}

impl Importer {
    pub fn new(registry: Arc<dyn NodeTypeRegistry>) -> Self {
        Self {
            registry,
            reconciler: PropertyReconciler::default(),
            id_behavior: IdBehavior::default(),
            unresolved: UnresolvedPolicy::default(),
            mode: ImportMode::default(),
        }
    }

    pub fn from_config(registry: Arc<dyn NodeTypeRegistry>, config: &StrataConfig) -> Self {
        Self::new(registry)
            .with_fallback(config.scalar_fallback)
            .with_id_behavior(config.id_behavior)
            .with_unresolved_policy(config.unresolved_references)
    }

    pub fn with_fallback(mut self, fallback: ScalarFallback) -> Self {
        self.reconciler = PropertyReconciler::new(fallback);
        self
    }

    pub fn with_id_behavior(mut self, id_behavior: IdBehavior) -> Self {
        self.id_behavior = id_behavior;
        self
    }

    pub fn with_unresolved_policy(mut self, policy: UnresolvedPolicy) -> Self {
        self.unresolved = policy;
        self
    }

    pub fn with_mode(mut self, mode: ImportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Import `tree` below `parent` and save.
    ///
    /// The session must have no pending changes; on failure it is left
    /// discarded and the base is unchanged.
    pub async fn import(&self, session: &SessionOverlay, parent: &NodeId, tree: &NodeInfo) -> Result<ImportReport> {
        if session.is_dirty().await {
            return Err(StateError::InvalidState(
                "import requires a session without pending changes".into(),
            ));
        }

        let result = match self.build(session, parent, tree).await {
            Ok(report) => session.save().await.map(|()| report),
            Err(e) => Err(e),
        };
        match result {
            Ok(report) => {
                tracing::info!(
                    "Imported {} nodes and {} properties below {}",
                    report.nodes,
                    report.properties,
                    parent
                );
                Ok(report)
            }
            Err(e) => {
                tracing::warn!("Import below {} failed: {}", parent, e);
                session.discard().await;
                Err(e)
            }
        }
    }

    async fn build(&self, session: &SessionOverlay, parent: &NodeId, tree: &NodeInfo) -> Result<ImportReport> {
        let ops = ItemOps::new(session, self.registry.as_ref());
        let mut tracker = ReferenceTracker::new();
        let mut report = ImportReport::default();

        let mut pending: Vec<(NodeId, &NodeInfo)> = vec![(*parent, tree)];
        while let Some((parent_id, info)) = pending.pop() {
            let id = self.create_node(&ops, &parent_id, info, &mut tracker).await?;
            report.root.get_or_insert(id);
            report.nodes += 1;

            for prop in &info.props {
                let outcome = match self.mode {
                    ImportMode::Live => {
                        let live = LiveNode::new(ops, id);
                        self.reconciler.apply_live(prop, &live, &mut tracker).await
                    }
                    ImportMode::State => self.reconciler.apply_state(prop, &id, &ops, &mut tracker).await,
                };
                match outcome? {
                    Reconciled::Stored(_) => report.properties += 1,
                    Reconciled::Skipped => report.skipped += 1,
                }
            }
            // reversed so siblings are created in document order
            pending.extend(info.children.iter().rev().map(|child| (id, child)));
        }

        report.dropped_references = tracker.apply_resolution(&ops, self.unresolved).await?;
        Ok(report)
    }

    async fn create_node(
        &self,
        ops: &ItemOps<'_>,
        parent: &NodeId,
        info: &NodeInfo,
        tracker: &mut ReferenceTracker,
    ) -> Result<NodeId> {
        let requested = match (info.id, self.id_behavior) {
            (Some(id), IdBehavior::KeepIds) => {
                if ops.states().has_item_state(&ItemId::Node(id)).await? {
                    return Err(StateError::ItemExists(format!(
                        "node {} already exists ({})",
                        id,
                        ops.item_path(&ItemId::Node(id)).await
                    )));
                }
                Some(id)
            }
            _ => None,
        };

        let node = ops
            .add_node(
                parent,
                info.name.clone(),
                info.primary_type.clone(),
                info.mixins.clone(),
                requested,
            )
            .await?;
        if let (Some(old), IdBehavior::CreateNew) = (info.id, self.id_behavior) {
            tracker.map_id(old, node.id);
        }
        Ok(node.id)
    }
}
