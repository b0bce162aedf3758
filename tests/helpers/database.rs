use std::path::Path;
use std::sync::Arc;

use trialstore::domain::models::DatabaseConfig;
use trialstore::{LegacyProtocol, MemoryDocumentStore, SqliteDocumentStore, StorageProtocol};

/// Create an in-memory SQLite document store for testing
///
/// Each call creates a completely isolated database with migrations applied.
pub async fn setup_test_store() -> Arc<SqliteDocumentStore> {
    Arc::new(
        SqliteDocumentStore::in_memory()
            .await
            .expect("failed to create test database"),
    )
}

/// Legacy protocol over a fresh in-memory SQLite database
pub async fn setup_sqlite_protocol() -> Arc<dyn StorageProtocol> {
    let protocol = LegacyProtocol::new(setup_test_store().await)
        .await
        .expect("failed to set up indexes");
    Arc::new(protocol)
}

/// Legacy protocol over a fresh in-memory document store
pub async fn setup_memory_protocol() -> Arc<dyn StorageProtocol> {
    let protocol = LegacyProtocol::new(Arc::new(MemoryDocumentStore::new()))
        .await
        .expect("failed to set up indexes");
    Arc::new(protocol)
}

/// Open an independent connection pool on a database file, as a separate
/// worker process would.
pub async fn open_file_protocol(path: &Path) -> Arc<dyn StorageProtocol> {
    let config = DatabaseConfig {
        path: path.display().to_string(),
        max_connections: 2,
        ..DatabaseConfig::default()
    };
    let store = SqliteDocumentStore::open(config)
        .await
        .expect("failed to open database file");
    Arc::new(
        LegacyProtocol::new(Arc::new(store))
            .await
            .expect("failed to set up indexes"),
    )
}

