//! HTTP handlers for the flowrun Control Plane API.
//!
//! Every route except `/health` acts on behalf of the user named by the
//! `X-User-Id` header.

pub mod auth;
pub mod database;
pub mod execute;
pub mod executions;
pub mod health;
pub mod jobs;

pub use auth::CurrentUser;
pub use execute::execute;
pub use health::health_check;
