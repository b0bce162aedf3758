//! The `legacy` storage backend: the protocol over a document store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value;

use crate::domain::errors::StorageResult;
use crate::domain::models::{
    Experiment, ExperimentPatch, ExperimentReport, Query, Trial, TrialPatch,
};
use crate::domain::ports::{DocumentStore, StorageProtocol};
use crate::services::{reporting, result_ingestion, ExperimentRecords, TrialLifecycle};

pub struct LegacyProtocol<S: DocumentStore + ?Sized> {
    experiments: ExperimentRecords<S>,
    trials: TrialLifecycle<S>,
}

impl<S: DocumentStore + ?Sized> LegacyProtocol<S> {
    /// Wrap `store`, creating the indexes the protocol relies on.
    pub async fn new(store: Arc<S>) -> StorageResult<Self> {
        let protocol = Self {
            experiments: ExperimentRecords::new(Arc::clone(&store)),
            trials: TrialLifecycle::new(store),
        };
        protocol.experiments.ensure_indexes().await?;
        protocol.trials.ensure_indexes().await?;
        Ok(protocol)
    }

    pub fn experiments(&self) -> &ExperimentRecords<S> {
        &self.experiments
    }

    pub fn trials(&self) -> &TrialLifecycle<S> {
        &self.trials
    }
}

#[async_trait]
impl<S: DocumentStore + ?Sized + 'static> StorageProtocol for LegacyProtocol<S> {
    async fn create_experiment(&self, experiment: &Experiment) -> StorageResult<String> {
        self.experiments.create(experiment).await
    }

    async fn update_experiment(
        &self,
        experiment: &Experiment,
        patch: &ExperimentPatch,
        condition: Option<Query>,
    ) -> StorageResult<Option<Experiment>> {
        self.experiments.update(experiment, patch, condition).await
    }

    async fn fetch_experiments(&self, query: &Query) -> StorageResult<Vec<Experiment>> {
        self.experiments.fetch(query).await
    }

    async fn register_trial(
        &self,
        experiment_id: &str,
        params: BTreeMap<String, Value>,
    ) -> StorageResult<Trial> {
        self.trials.register(experiment_id, params).await
    }

    async fn reserve_trial(&self, query: &Query, worker: &str) -> StorageResult<Option<Trial>> {
        self.trials.reserve(query, worker).await
    }

    async fn fetch_trials(&self, query: &Query) -> StorageResult<Vec<Trial>> {
        self.trials.fetch(query).await
    }

    async fn update_trial(
        &self,
        trial: &Trial,
        patch: &TrialPatch,
        condition: Option<Query>,
    ) -> StorageResult<Option<Trial>> {
        self.trials.update(trial, patch, condition).await
    }

    async fn retrieve_result(&self, trial: &Trial, artifact: &Path) -> StorageResult<Trial> {
        result_ingestion::retrieve_result(trial, artifact).await
    }

    async fn update_heartbeat(&self, trial: &Trial) -> StorageResult<Option<Trial>> {
        self.trials.heartbeat(trial).await
    }

    async fn fetch_lost_trials(
        &self,
        experiment_id: &str,
        threshold: Duration,
    ) -> StorageResult<Vec<Trial>> {
        self.trials.fetch_lost(experiment_id, threshold).await
    }

    async fn experiment_report(&self, experiment: &Experiment) -> StorageResult<ExperimentReport> {
        let trials = self.trials.fetch_for_experiment(&experiment.id).await?;
        Ok(reporting::build_report(experiment, &trials))
    }
}
