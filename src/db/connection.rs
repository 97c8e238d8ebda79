//! Database connection management using sqlx

use crate::config::DatabaseSettings;
use crate::error::{Result, TeleSqlError};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use tracing::info;

/// Initialize the warehouse connection pool. Every session starts read-only.
pub async fn init_pool(settings: &DatabaseSettings) -> Result<PgPool> {
    let url = settings
        .url
        .as_deref()
        .ok_or_else(|| TeleSqlError::Config("DATABASE_URL or POSTGRES_HOST is not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET default_transaction_read_only = on")
                    .await?;
                Ok(())
            })
        })
        .connect(url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!(
        max_connections = settings.max_connections,
        "Connected to warehouse"
    );
    Ok(pool)
}
