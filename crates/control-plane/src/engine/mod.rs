//! Flow execution engine.
//!
//! - **Plan**: validates a flow and fixes its step order
//! - **Nodes**: dispatches a single node to its behaviour
//! - **Orchestrator**: requests executions and runs them step by step
//! - **State**: execution and step status machines

pub mod nodes;
pub mod orchestrator;
pub mod plan;
pub mod state;

pub use nodes::{DefaultNodeExecutor, NodeError, NodeExecutor, NodeKind, NodeOutput};
pub use orchestrator::{ExecutionJob, ExecutionOrchestrator, OrchestratorSettings, RunOutcome};
pub use plan::{plan_steps, validate_flow};
pub use state::{ExecutionStatus, StepStatus};
