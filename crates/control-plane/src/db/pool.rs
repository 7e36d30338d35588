//! Postgres pool for the flow store.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;

/// Pool shared by the store and the health endpoint.
pub type DbPool = PgPool;

/// Pool sizing and timeouts taken from `config`.
///
/// # Arguments
///
/// * `config` - Database configuration
///
/// # Returns
///
/// Options ready to connect with.
pub fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout))
}

/// Connect the pool the flow store runs on.
///
/// # Arguments
///
/// * `config` - Database configuration; `DATABASE_URL` wins over the
///   individual `POSTGRES_*` settings
///
/// # Returns
///
/// A connected pool holding at least `min_connections` connections.
///
/// # Errors
///
/// Returns an error if the URL does not parse or the server cannot be
/// reached within the acquire timeout.
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let pool = pool_options(config)
        .connect_with(config.connect_options()?)
        .await?;

    tracing::info!(
        url = %config.redacted_url(),
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Flow store pool ready"
    );

    Ok(pool)
}

/// Round-trip a trivial query.
///
/// # Returns
///
/// `true` if the database answered, `false` otherwise.
pub async fn health_check(pool: &DbPool) -> bool {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_options_follow_config() {
        let config = DatabaseConfig {
            max_connections: 7,
            min_connections: 2,
            acquire_timeout: 3,
            ..Default::default()
        };
        let options = pool_options(&config);
        assert_eq!(options.get_max_connections(), 7);
        assert_eq!(options.get_min_connections(), 2);
        assert_eq!(options.get_acquire_timeout(), Duration::from_secs(3));
    }
}
