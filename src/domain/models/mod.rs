//! Domain models for experiments, trials, queries, and configuration.

pub mod config;
pub mod document;
pub mod experiment;
pub mod query;
pub mod report;
pub mod timestamp;
pub mod trial;

pub use config::{
    Config, DatabaseConfig, DatabaseKind, LogFormat, LoggingConfig, RetryConfig, RotationPolicy,
    StorageConfig,
};
pub use document::{Document, ID_FIELD};
pub use experiment::{Direction, Experiment, ExperimentMetadata, ExperimentPatch};
pub use query::{Matcher, Query, Sort, SortOrder};
pub use report::{ExperimentReport, ObjectivePoint};
pub use trial::{ResultType, Trial, TrialPatch, TrialResult, TrialStatus};
