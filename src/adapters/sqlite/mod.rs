//! SQLite document-store adapter.

pub mod connection;
pub mod document_store;
pub mod migrations;

pub use connection::{create_pool, create_test_pool, database_url, ConnectionError, PoolConfig};
pub use document_store::SqliteDocumentStore;
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};

use crate::domain::errors::{StorageError, StorageResult};
use crate::domain::models::DatabaseConfig;

impl From<ConnectionError> for StorageError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::InvalidDatabaseUrl(url) => {
                Self::Configuration(format!("invalid database URL: {url}"))
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<MigrationError> for StorageError {
    fn from(err: MigrationError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl SqliteDocumentStore {
    /// Open (creating if needed) the configured database file and migrate it.
    pub async fn open(config: DatabaseConfig) -> StorageResult<Self> {
        if config.path.is_empty() {
            return Err(StorageError::Configuration(
                "database.path is required for the sqlite store".to_string(),
            ));
        }
        let pool = create_pool(&database_url(&config.path), Some(PoolConfig::from(&config))).await?;
        Migrator::new(pool.clone())
            .run_embedded_migrations(all_embedded_migrations())
            .await?;
        tracing::debug!(path = %config.path, "opened sqlite document store");
        Ok(Self::new(pool))
    }

    /// Fresh private in-memory database.
    pub async fn in_memory() -> StorageResult<Self> {
        let pool = create_test_pool().await?;
        Migrator::new(pool.clone())
            .run_embedded_migrations(all_embedded_migrations())
            .await?;
        Ok(Self::new(pool))
    }
}
