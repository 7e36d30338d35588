//! Flow validation and step planning.
//!
//! Step order is fixed when an execution is requested and never recomputed:
//! enabled TRIGGER nodes first, then every other enabled node, each group in
//! the flow's stored node order, numbered from 1 without gaps.

use std::collections::HashSet;

use crate::db::models::{Flow, NewStep};
use crate::error::{AppError, AppResult};

/// Check the graph invariants a flow must satisfy before it may run.
pub fn validate_flow(flow: &Flow) -> AppResult<()> {
    let mut ids = HashSet::with_capacity(flow.nodes.len());
    for node in &flow.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(AppError::Validation(format!(
                "Flow {} has duplicate node id '{}'",
                flow.id, node.id
            )));
        }
    }

    if !flow.nodes.iter().any(|n| n.is_trigger()) {
        return Err(AppError::Validation(format!(
            "Flow {} has no TRIGGER node",
            flow.id
        )));
    }

    for edge in &flow.edges {
        for end in [&edge.source, &edge.target] {
            if !ids.contains(end.as_str()) {
                return Err(AppError::Validation(format!(
                    "Edge '{}' of flow {} references unknown node '{}'",
                    edge.id, flow.id, end
                )));
            }
        }
    }

    Ok(())
}

/// Plan one step per enabled node.
pub fn plan_steps(flow: &Flow) -> Vec<NewStep> {
    let (triggers, others): (Vec<_>, Vec<_>) =
        flow.enabled_nodes().partition(|node| node.is_trigger());

    triggers
        .into_iter()
        .chain(others)
        .enumerate()
        .map(|(index, node)| NewStep {
            step_number: index as i32 + 1,
            node: node.clone(),
        })
        .collect()
}
