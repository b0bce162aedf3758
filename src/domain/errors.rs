//! Domain errors for the trialstore bookkeeping layer.

use thiserror::Error;

/// Errors surfaced by the storage protocol and its document-store adapters.
///
/// "Nothing reservable" and "lost update" are not errors: those operations
/// return `Ok(None)` and callers re-fetch or move on.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage has not been initialized; call setup_storage first")]
    NotInitialized,

    #[error("Experiment '{name}' (user '{user}', version {version}) already exists")]
    DuplicateExperiment { name: String, user: String, version: u32 },

    #[error("Trial with fingerprint {fingerprint} already registered in experiment {experiment}")]
    DuplicateTrial { experiment: String, fingerprint: String },

    #[error("Unique index violated in collection '{collection}': {index}")]
    DuplicateKey { collection: String, index: String },

    #[error("Malformed result artifact: {0}")]
    MalformedResult(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Search space of experiment {0} is locked: trials are already registered")]
    SpaceLocked(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether a caller may retry the failed operation after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Whether the error signals an existing record the caller can resume.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Self::DuplicateExperiment { .. } | Self::DuplicateTrial { .. } | Self::DuplicateKey { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => Self::DuplicateKey {
                collection: "documents".to_string(),
                index: db_err.message().to_string(),
            },
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
