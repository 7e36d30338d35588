//! Flow model: a user's automation graph and its run counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::engine::nodes::NodeKind;
use crate::error::AppError;

/// How a flow gets started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Webhook,
    Schedule,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Webhook => "WEBHOOK",
            TriggerType::Schedule => "SCHEDULE",
            TriggerType::Manual => "MANUAL",
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WEBHOOK" => Ok(TriggerType::Webhook),
            "SCHEDULE" => Ok(TriggerType::Schedule),
            "MANUAL" => Ok(TriggerType::Manual),
            other => Err(AppError::Internal(format!("Unknown trigger type: {}", other))),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// One vertex of a flow graph.
///
/// `node_type` is kept as the stored text; it is only interpreted when the
/// node is dispatched, so a corrupt type fails its own step instead of the
/// whole flow load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: String,

    pub name: String,

    #[serde(default)]
    pub config: Map<String, Value>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<String>,
}

impl FlowNode {
    /// Parsed node kind, if the stored type is a supported one.
    pub fn kind(&self) -> Option<NodeKind> {
        self.node_type.parse().ok()
    }

    pub fn is_trigger(&self) -> bool {
        self.kind() == Some(NodeKind::Trigger)
    }
}

/// Directed edge between two nodes of the same flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

/// A stored flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub trigger_type: TriggerType,
    pub version: i32,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Build an active flow with zeroed counters.
    pub fn new(user_id: Uuid, name: impl Into<String>, nodes: Vec<FlowNode>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            description: None,
            is_active: true,
            trigger_type: TriggerType::Manual,
            version: 1,
            nodes,
            edges: Vec::new(),
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
            last_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn enabled_nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.iter().filter(|n| n.enabled)
    }
}

/// The `{id, name}` of a flow, attached to execution details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct FlowSummary {
    pub id: Uuid,
    pub name: String,
}

/// Row of `flowrun.flow`.
#[derive(Debug, Clone, FromRow)]
pub struct FlowRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub trigger_type: String,
    pub version: i32,
    pub nodes: Json<Vec<FlowNode>>,
    pub edges: Json<Vec<FlowEdge>>,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<FlowRow> for Flow {
    type Error = AppError;

    fn try_from(row: FlowRow) -> Result<Self, Self::Error> {
        Ok(Flow {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            description: row.description,
            is_active: row.is_active,
            trigger_type: row.trigger_type.parse()?,
            version: row.version,
            nodes: row.nodes.0,
            edges: row.edges.0,
            total_runs: row.total_runs,
            successful_runs: row.successful_runs,
            failed_runs: row.failed_runs,
            last_run: row.last_run,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
