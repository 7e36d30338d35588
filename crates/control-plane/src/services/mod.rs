//! Service layer for the flowrun Control Plane.
//!
//! Services hold the read-side logic the HTTP handlers call into; the write
//! side lives in the engine's orchestrator.

pub mod execution;

pub use execution::{ExecutionDetail, ExecutionService, DEFAULT_LOG_LIMIT, MAX_LOG_LIMIT};
