//! flowrun Worker Pool
//!
//! Pulls flow execution jobs off the queue and runs them through the
//! execution orchestrator, a bounded number at a time.

pub mod config;
pub mod handler;
pub mod worker;

pub use config::WorkerConfig;
pub use handler::{ExecutionJobHandler, HandlerError, JobHandler};
pub use worker::Worker;
