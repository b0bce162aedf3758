//! Storage selection and the process-wide default handle.
//!
//! Components take an `Arc<dyn StorageProtocol>` explicitly. The default
//! handle exists for call sites such as the CLI that want one backend for the
//! whole process; it is installed once and never replaced.

pub mod registry;

use std::sync::{Arc, OnceLock};

use crate::domain::models::Config;
use crate::domain::ports::StorageProtocol;
use crate::domain::{StorageError, StorageResult};

pub use registry::{BackendRegistry, LEGACY_BACKEND};

static STORAGE: OnceLock<Arc<dyn StorageProtocol>> = OnceLock::new();

/// Build the configured backend without installing it anywhere.
pub async fn create_storage(config: &Config) -> StorageResult<Arc<dyn StorageProtocol>> {
    BackendRegistry::with_defaults().create(config).await
}

/// Build the configured backend and install it as the process default.
pub async fn setup_storage(config: &Config) -> StorageResult<Arc<dyn StorageProtocol>> {
    if STORAGE.get().is_some() {
        return Err(already_initialized());
    }
    let storage = create_storage(config).await?;
    install_storage(Arc::clone(&storage))?;
    Ok(storage)
}

/// Install an already constructed backend as the process default.
pub fn install_storage(storage: Arc<dyn StorageProtocol>) -> StorageResult<()> {
    STORAGE.set(storage).map_err(|_| already_initialized())
}

/// The process default installed by [`setup_storage`] or [`install_storage`].
pub fn get_storage() -> StorageResult<Arc<dyn StorageProtocol>> {
    STORAGE.get().cloned().ok_or(StorageError::NotInitialized)
}

fn already_initialized() -> StorageError {
    StorageError::Configuration("storage has already been initialized for this process".to_string())
}
