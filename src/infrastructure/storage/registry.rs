//! Backend registry
//!
//! Maps a configured backend name to a constructor producing a concrete
//! [`StorageProtocol`] implementation.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::adapters::{MemoryDocumentStore, SqliteDocumentStore};
use crate::domain::models::{Config, DatabaseKind};
use crate::domain::ports::{DocumentStore, StorageProtocol};
use crate::domain::{StorageError, StorageResult};
use crate::services::LegacyProtocol;

/// Name of the document-store backed protocol.
pub const LEGACY_BACKEND: &str = "legacy";

type BackendFuture = BoxFuture<'static, StorageResult<Arc<dyn StorageProtocol>>>;
type BackendConstructor = Box<dyn Fn(Config) -> BackendFuture + Send + Sync>;

/// Registry of storage backends keyed by name
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Create a registry with the built-in backends registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(LEGACY_BACKEND, |config: Config| legacy_backend(config).boxed());
        registry
    }

    /// Register a backend constructor, replacing any previous one with the same name
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(Config) -> BackendFuture + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    /// Registered backend names, sorted
    pub fn available_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the backend named by `config.storage.backend`
    pub async fn create(&self, config: &Config) -> StorageResult<Arc<dyn StorageProtocol>> {
        let name = config.storage.backend.as_str();
        let constructor = self.constructors.get(name).ok_or_else(|| {
            StorageError::Configuration(format!(
                "Unknown storage backend '{name}'. Available backends: {}",
                self.available_backends().join(", ")
            ))
        })?;

        let storage = constructor(config.clone()).await?;
        info!(backend = name, "storage backend initialized");
        Ok(storage)
    }
}

async fn legacy_backend(config: Config) -> StorageResult<Arc<dyn StorageProtocol>> {
    let store: Arc<dyn DocumentStore> = match config.database.kind {
        DatabaseKind::Sqlite => Arc::new(SqliteDocumentStore::open(config.database).await?),
        DatabaseKind::Memory => Arc::new(MemoryDocumentStore::new()),
    };
    let protocol = LegacyProtocol::new(store).await?;
    Ok(Arc::new(protocol))
}
