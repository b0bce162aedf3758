use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value;

use crate::domain::errors::StorageResult;
use crate::domain::models::{
    Experiment, ExperimentPatch, ExperimentReport, Query, Trial, TrialPatch,
};

/// Capability set of a storage backend.
///
/// `Ok(None)` from `reserve_trial`, `update_trial`, `update_experiment` and
/// `update_heartbeat` is a control-flow signal, not a failure: nothing was
/// reservable, or the conditional write lost to a concurrent writer and the
/// caller should re-fetch.
#[async_trait]
pub trait StorageProtocol: Send + Sync {
    /// Register a new experiment and return its id.
    async fn create_experiment(&self, experiment: &Experiment) -> StorageResult<String>;

    /// Apply `patch` to `experiment`, conditioned on its id plus `condition`.
    async fn update_experiment(
        &self,
        experiment: &Experiment,
        patch: &ExperimentPatch,
        condition: Option<Query>,
    ) -> StorageResult<Option<Experiment>>;

    async fn fetch_experiments(&self, query: &Query) -> StorageResult<Vec<Experiment>>;

    /// Insert a trial in status `new` and return it with its assigned id.
    async fn register_trial(
        &self,
        experiment_id: &str,
        params: BTreeMap<String, Value>,
    ) -> StorageResult<Trial>;

    /// Claim one reservable trial matching `query` for `worker`.
    async fn reserve_trial(&self, query: &Query, worker: &str) -> StorageResult<Option<Trial>>;

    async fn fetch_trials(&self, query: &Query) -> StorageResult<Vec<Trial>>;

    /// Apply `patch` to `trial`, conditioned on its id, its current status
    /// when the patch changes status, and `condition`.
    async fn update_trial(
        &self,
        trial: &Trial,
        patch: &TrialPatch,
        condition: Option<Query>,
    ) -> StorageResult<Option<Trial>>;

    /// Parse the result artifact at `artifact` and replace the results of the
    /// returned copy of `trial`. Nothing is persisted.
    async fn retrieve_result(&self, trial: &Trial, artifact: &Path) -> StorageResult<Trial>;

    /// Refresh the heartbeat of a trial still held by its worker.
    async fn update_heartbeat(&self, trial: &Trial) -> StorageResult<Option<Trial>>;

    /// Held trials of `experiment_id` whose heartbeat is older than `threshold`.
    async fn fetch_lost_trials(
        &self,
        experiment_id: &str,
        threshold: Duration,
    ) -> StorageResult<Vec<Trial>>;

    /// Counts by status and the best-so-far trajectory.
    async fn experiment_report(&self, experiment: &Experiment) -> StorageResult<ExperimentReport>;
}
