//! flowrun Control Plane Library
//!
//! The flow execution engine of flowrun:
//!
//! - **Orchestration**: turn a stored flow into an ordered, durable,
//!   retryable execution and run it step by step
//! - **Node dispatch**: one behaviour per node kind
//! - **Job queue**: at-least-once hand-off of runs to workers
//! - **Execution queries**: read and retry executions over HTTP
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: Postgres models, queries and schema
//! - [`store`]: The flow store seen by the engine
//! - [`queue`]: Job queue abstraction and its implementations
//! - [`engine`]: Orchestrator, node executor and state machines
//! - [`services`]: Execution query service
//! - [`error`]: Custom error types with Axum integration
//! - [`handlers`] / [`router`]: HTTP surface
//! - [`state`]: Shared application state
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flowrun_control_plane::{
//!     engine::{DefaultNodeExecutor, ExecutionOrchestrator, OrchestratorSettings},
//!     queue::MemoryJobQueue,
//!     store::MemoryFlowStore,
//! };
//!
//! let orchestrator = ExecutionOrchestrator::new(
//!     Arc::new(MemoryFlowStore::new()),
//!     Arc::new(MemoryJobQueue::new()),
//!     Arc::new(DefaultNodeExecutor),
//!     OrchestratorSettings::default(),
//! );
//! let execution = orchestrator.request_execution(flow_id, user_id, None).await?;
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod queue;
pub mod router;
pub mod services;
pub mod state;
pub mod store;

pub use error::{AppError, AppResult};
pub use router::build_router;
