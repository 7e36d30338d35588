//! Data model for flows, executions and execution steps.
//!
//! Domain types are store-agnostic and serialize to the JSON shapes exposed
//! over HTTP. The `*Row` types are the SQLx projections of the Postgres
//! tables and convert into the domain types.

pub mod execution;
pub mod flow;

pub use execution::*;
pub use flow::*;
