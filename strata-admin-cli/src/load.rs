//! Load a system view document into the item store

use anyhow::{Context, Result};
use std::sync::Arc;
use strata_core::import::sysview;
use strata_core::{
    IdBehavior, ImportMode, ImportReport, Importer, NodeId, SessionOverlay, StaticNodeTypeRegistry,
    UnresolvedPolicy,
};

use crate::Store;

#[derive(Debug, Default)]
pub struct LoadOptions {
    pub parent: Option<String>,
    pub keep_ids: bool,
    pub drop_unresolved: bool,
    pub state_mode: bool,
}

/// Parse `xml` and import it below the requested parent in one save
pub async fn load_system_view(store: &Store, xml: &str, options: &LoadOptions) -> Result<ImportReport> {
    let tree = sysview::parse(xml).context("parsing system view")?;
    let parent = match &options.parent {
        Some(id) => NodeId::parse(id)?,
        None => NodeId::ROOT,
    };
    tracing::info!("Loading {} nodes below {}", tree.node_count(), parent);

    let mut importer = Importer::from_config(Arc::new(StaticNodeTypeRegistry::with_builtins()), &store.config);
    if options.keep_ids {
        importer = importer.with_id_behavior(IdBehavior::KeepIds);
    }
    if options.drop_unresolved {
        importer = importer.with_unresolved_policy(UnresolvedPolicy::Drop);
    }
    if options.state_mode {
        importer = importer.with_mode(ImportMode::State);
    }

    let session = SessionOverlay::new(store.canonical.clone());
    let report = importer.import(&session, &parent, &tree).await?;
    Ok(report)
}
