//! Verify structural integrity of the persisted item states

use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use strata_core::{ItemState, NodeId, NodeState, PropertyId, PropertyState};

use crate::Store;

#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    pub nodes: usize,
    pub properties: usize,
    pub references: usize,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check parent/child links, property ownership and strong reference targets
pub fn verify_store(store: &Store, quiet: bool) -> Result<VerifyReport> {
    let states = store.persistence.scan_states()?;
    let report = check_states(&states);

    if !quiet {
        println!("Verified {} nodes, {} properties", report.nodes, report.properties);
        println!("  References: {}", report.references);
        for error in &report.errors {
            eprintln!("  ERROR: {}", error);
        }
        if report.is_clean() {
            println!("Item store is consistent");
        }
    }
    Ok(report)
}

fn check_states(states: &[ItemState]) -> VerifyReport {
    let nodes: HashMap<NodeId, &NodeState> = states
        .iter()
        .filter_map(ItemState::as_node)
        .map(|n| (n.id, n))
        .collect();
    let properties: HashMap<&PropertyId, &PropertyState> = states
        .iter()
        .filter_map(ItemState::as_property)
        .map(|p| (&p.id, p))
        .collect();

    let mut report = VerifyReport {
        nodes: nodes.len(),
        properties: properties.len(),
        ..Default::default()
    };

    for node in nodes.values() {
        if let Some(parent_id) = node.parent_id {
            match nodes.get(&parent_id) {
                Some(parent) if parent.child_entry_by_id(&node.id).is_some() => {}
                Some(_) => report
                    .errors
                    .push(format!("{} is not listed by its parent {}", node.id, parent_id)),
                None => report
                    .errors
                    .push(format!("{} has missing parent {}", node.id, parent_id)),
            }
        }
        let mut seen = HashSet::new();
        for entry in &node.child_entries {
            if !seen.insert(entry.id) {
                report
                    .errors
                    .push(format!("{} lists child {} twice", node.id, entry.id));
            }
            // mounted entries link virtual roots, which are never persisted
            if entry.mounted {
                continue;
            }
            match nodes.get(&entry.id) {
                Some(child) if child.parent_id != Some(node.id) => report
                    .errors
                    .push(format!("child {} of {} names another parent", entry.id, node.id)),
                Some(_) => {}
                None => report
                    .errors
                    .push(format!("{} lists missing child {}", node.id, entry.id)),
            }
        }
        for name in &node.property_names {
            if !properties.contains_key(&node.property_id(name)) {
                report
                    .errors
                    .push(format!("{} lists missing property {}", node.id, name));
            }
        }
    }

    for prop in properties.values() {
        match nodes.get(prop.parent_id()) {
            Some(parent) if parent.has_property_name(prop.name()) => {}
            Some(_) => report.errors.push(format!("{} is not listed by its node", prop.id)),
            None => report.errors.push(format!("{} has missing node", prop.id)),
        }
        for value in &prop.values {
            if let strata_core::InternalValue::Reference(target) = value {
                report.references += 1;
                if !nodes.contains_key(target) {
                    report
                        .errors
                        .push(format!("{} references missing node {}", prop.id, target));
                }
            }
        }
    }

    report.errors.sort();
    report
}
