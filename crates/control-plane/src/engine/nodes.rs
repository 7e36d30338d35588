//! Node dispatch.
//!
//! A node executor maps `(node, accumulated data)` to the keys the node
//! contributes to the run, or fails. The orchestrator merges the returned
//! map into the run's data by shallow key overwrite.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::db::models::FlowNode;

/// Delay applied by a DELAY node without `config.delayMs`.
pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Supported node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Trigger,
    Action,
    Condition,
    Delay,
    Ai,
    Webhook,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "TRIGGER",
            NodeKind::Action => "ACTION",
            NodeKind::Condition => "CONDITION",
            NodeKind::Delay => "DELAY",
            NodeKind::Ai => "AI",
            NodeKind::Webhook => "WEBHOOK",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeKind {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRIGGER" => Ok(NodeKind::Trigger),
            "ACTION" => Ok(NodeKind::Action),
            "CONDITION" => Ok(NodeKind::Condition),
            "DELAY" => Ok(NodeKind::Delay),
            "AI" => Ok(NodeKind::Ai),
            "WEBHOOK" => Ok(NodeKind::Webhook),
            _ => Err(NodeError::UnknownNodeType(s.to_string())),
        }
    }
}

/// Failure of a single node.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    /// Human-readable failure, recorded verbatim on the step
    #[error("{0}")]
    Execution(String),

    #[error("Node execution cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn execution(message: impl Into<String>) -> Self {
        NodeError::Execution(message.into())
    }
}

/// Partial result a node contributes to the run's data.
pub type NodeOutput = Map<String, Value>;

/// Executes one node against the run's accumulated data.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &FlowNode,
        input: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<NodeOutput, NodeError>;
}

/// Built-in executor.
///
/// ACTION, AI and WEBHOOK are placeholders until the integration layer is
/// wired in. DELAY awaits a timer: the worker thread is free while it waits,
/// but the job keeps its concurrency slot for the whole delay.
#[derive(Debug, Clone, Default)]
pub struct DefaultNodeExecutor;

impl DefaultNodeExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeExecutor for DefaultNodeExecutor {
    async fn execute(
        &self,
        node: &FlowNode,
        input: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<NodeOutput, NodeError> {
        let kind: NodeKind = node.node_type.parse()?;

        match kind {
            NodeKind::Trigger => Ok(input.clone()),
            NodeKind::Action => Ok(action_result(node)),
            NodeKind::Condition => {
                let passed = evaluate_condition(node.config.get("condition"));
                Ok(object(json!({ "conditionResult": passed, "passed": passed })))
            }
            NodeKind::Delay => {
                let delay_ms = delay_ms(node)?;
                tracing::debug!(node_id = %node.id, delay_ms, "Delaying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = cancel.cancelled() => return Err(NodeError::Cancelled),
                }
                Ok(object(json!({ "delayed": delay_ms })))
            }
            NodeKind::Ai => Ok(object(json!({ "aiProcessed": true }))),
            NodeKind::Webhook => Ok(object(json!({ "webhookSent": true }))),
        }
    }
}

fn action_result(node: &FlowNode) -> NodeOutput {
    let mut result = object(json!({
        "nodeId": node.id,
        "nodeName": node.name,
        "executed": true,
        "timestamp": Utc::now().to_rfc3339(),
    }));
    for (key, value) in &node.config {
        result.insert(key.clone(), value.clone());
    }
    result
}

/// Conditions carry no expression language yet: every condition passes and
/// the outcome only flows through the run's data.
fn evaluate_condition(condition: Option<&Value>) -> bool {
    tracing::trace!(condition = ?condition, "Evaluating condition");
    true
}

fn delay_ms(node: &FlowNode) -> Result<u64, NodeError> {
    match node.config.get("delayMs") {
        None | Some(Value::Null) => Ok(DEFAULT_DELAY_MS),
        Some(value) => value.as_u64().ok_or_else(|| {
            NodeError::execution(format!(
                "Invalid delayMs on node '{}': {}",
                node.id, value
            ))
        }),
    }
}

fn object(value: Value) -> NodeOutput {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: &str, config: Value) -> FlowNode {
        FlowNode {
            id: "n1".to_string(),
            node_type: node_type.to_string(),
            name: "Node One".to_string(),
            config: object(config),
            enabled: true,
            integration_id: None,
        }
    }

    fn input() -> Map<String, Value> {
        object(json!({ "email": "a@b.c" }))
    }

    #[tokio::test]
    async fn test_trigger_passes_input_through() {
        let out = DefaultNodeExecutor
            .execute(&node("TRIGGER", json!({})), &input(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, input());
    }

    #[tokio::test]
    async fn test_action_merges_config() {
        let out = DefaultNodeExecutor
            .execute(
                &node("action", json!({ "channel": "#ops" })),
                &input(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["executed"], json!(true));
        assert_eq!(out["nodeId"], json!("n1"));
        assert_eq!(out["nodeName"], json!("Node One"));
        assert_eq!(out["channel"], json!("#ops"));
        assert!(out.contains_key("timestamp"));
        assert!(!out.contains_key("email"));
    }

    #[tokio::test]
    async fn test_condition_always_passes() {
        let out = DefaultNodeExecutor
            .execute(
                &node("CONDITION", json!({ "condition": "amount > 100" })),
                &input(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["conditionResult"], json!(true));
        assert_eq!(out["passed"], json!(true));
    }

    #[tokio::test]
    async fn test_delay_reports_duration() {
        let out = DefaultNodeExecutor
            .execute(
                &node("DELAY", json!({ "delayMs": 5 })),
                &input(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["delayed"], json!(5));
    }

    #[tokio::test]
    async fn test_delay_rejects_negative() {
        let err = DefaultNodeExecutor
            .execute(
                &node("DELAY", json!({ "delayMs": -1 })),
                &input(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Execution(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_default_is_one_second() {
        let out = DefaultNodeExecutor
            .execute(&node("DELAY", json!({})), &input(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["delayed"], json!(DEFAULT_DELAY_MS));
    }

    #[tokio::test]
    async fn test_delay_interrupted_by_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = DefaultNodeExecutor
            .execute(&node("DELAY", json!({ "delayMs": 60_000 })), &input(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::Cancelled);
    }

    #[tokio::test]
    async fn test_placeholders() {
        let cancel = CancellationToken::new();
        let ai = DefaultNodeExecutor
            .execute(&node("AI", json!({})), &input(), &cancel)
            .await
            .unwrap();
        assert_eq!(ai["aiProcessed"], json!(true));
        let webhook = DefaultNodeExecutor
            .execute(&node("WEBHOOK", json!({})), &input(), &cancel)
            .await
            .unwrap();
        assert_eq!(webhook["webhookSent"], json!(true));
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let err = DefaultNodeExecutor
            .execute(&node("teleport", json!({})), &input(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::UnknownNodeType("teleport".to_string()));
        assert_eq!(err.to_string(), "Unknown node type: teleport");
    }
}
