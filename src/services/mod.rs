//! Services layer: the storage core, programmed only against the ports.

pub mod experiment_records;
pub mod legacy_protocol;
pub mod reporting;
pub mod result_ingestion;
pub mod trial_lifecycle;

pub use experiment_records::{ExperimentRecords, EXPERIMENTS};
pub use legacy_protocol::LegacyProtocol;
pub use reporting::{best_so_far, build_report};
pub use result_ingestion::parse_results;
pub use trial_lifecycle::{TrialLifecycle, TRIALS};
