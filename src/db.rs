use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::AppConfig;

pub async fn connect(config: &AppConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(config.store_timeout())
        .connect(&config.database_url)
        .await
        .context("connect to database")
}

/// Applies pending migrations. Uniqueness of emails and Google ids lives in the
/// schema, so a failure here aborts startup.
pub async fn migrate(db: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(db)
        .await
        .context("run database migrations")?;
    tracing::info!("database migrations applied");
    Ok(())
}
