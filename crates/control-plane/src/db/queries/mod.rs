//! SQL for the flowrun schema, organized by table.

pub mod execution;
pub mod flow;
