//! Postgres persistence for flows, executions and execution steps.
//!
//! `models` holds the domain types and their row projections, `queries`
//! the SQL. The schema lives in `migrations/0001_init.sql` and is applied
//! with [`init_schema`].

pub mod models;
pub mod pool;
pub mod queries;

pub use pool::{create_pool, health_check, DbPool};

/// DDL for the `flowrun` schema.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Create the `flowrun` schema and tables if they do not exist.
pub async fn init_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    tracing::info!("Database schema initialized");
    Ok(())
}
