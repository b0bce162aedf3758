//! Trialstore - experiment and trial bookkeeping for distributed search
//!
//! Workers running a hyperparameter search share one store. Trialstore records
//! experiments and their trials, hands each reservable trial to at most one
//! worker at a time, and applies status and result updates as conditional
//! writes so concurrent workers never overwrite each other.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors, and the storage ports
//! - **Service Layer** (`services`): experiment records, trial lifecycle,
//!   result ingestion and reporting, written against [`DocumentStore`]
//! - **Adapters** (`adapters`): SQLite and in-memory document stores
//! - **Infrastructure Layer** (`infrastructure`): configuration, logging,
//!   retries and backend selection
//! - **CLI Layer** (`cli`): operator command-line interface
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use trialstore::{create_storage, Config, Experiment, Query};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let storage = create_storage(&Config::default()).await?;
//! let id = storage.create_experiment(&Experiment::new("mnist", "bob")).await?;
//! storage.register_trial(&id, BTreeMap::new()).await?;
//!
//! let query = Query::new().eq("experiment", id.as_str());
//! if let Some(trial) = storage.reserve_trial(&query, "worker-1").await? {
//!     println!("running {}", trial.id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use adapters::{MemoryDocumentStore, SqliteDocumentStore};
pub use domain::models::{
    Config, DatabaseConfig, DatabaseKind, Direction, Experiment, ExperimentPatch,
    ExperimentReport, LoggingConfig, Query, RetryConfig, SortOrder, Trial, TrialPatch,
    TrialResult, TrialStatus,
};
pub use domain::ports::{DocumentStore, StorageProtocol, WriteOutcome};
pub use domain::{StorageError, StorageResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use infrastructure::{create_storage, get_storage, install_storage, setup_storage};
pub use services::{ExperimentRecords, LegacyProtocol, TrialLifecycle};
