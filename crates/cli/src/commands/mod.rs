//! CLI command implementations.

pub mod cart;
pub mod migrate;
pub mod orders;

use coursecart_storefront::config::{ConfigError, StorefrontConfig};
use coursecart_storefront::db::{self, RepositoryError};
use sqlx::PgPool;
use thiserror::Error;

/// Errors shared by the database-backed commands.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No database URL is configured.
    #[error("Missing environment variable: STOREFRONT_DATABASE_URL (or DATABASE_URL)")]
    MissingDatabaseUrl,

    /// Database connection error.
    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] RepositoryError),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Output could not be serialized.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Load configuration from `.env` and the environment and connect.
async fn connect() -> Result<PgPool, CommandError> {
    dotenvy::dotenv().ok();

    let config = StorefrontConfig::from_env()?;
    let database_url = config
        .database_url
        .ok_or(CommandError::MissingDatabaseUrl)?;

    tracing::info!("Connecting to storefront database...");
    Ok(db::create_pool(&database_url).await?)
}
