//! Configuration module for the flowrun Control Plane.
//!
//! Configuration is loaded from environment variables using the `envy`
//! crate. Every struct has a `Default` so a missing variable never stops
//! the process from starting.

mod app;
mod database;
mod queue;

pub use app::AppConfig;
pub use database::DatabaseConfig;
pub use queue::QueueConfig;
