//! Experiment records: creation under the `(name, user, version)` uniqueness
//! invariant, conditional metadata updates, and lookups.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::errors::{StorageError, StorageResult};
use crate::domain::models::document::{from_document, has_null_member, to_document};
use crate::domain::models::{Experiment, ExperimentPatch, Query, SortOrder, ID_FIELD};
use crate::domain::ports::{DocumentStore, WriteOutcome};
use crate::services::trial_lifecycle::TRIALS;

/// Collection holding experiment records.
pub const EXPERIMENTS: &str = "experiments";

/// Flag stamped on an experiment by its first trial registration.
pub const SPACE_LOCKED: &str = "space_locked";

pub struct ExperimentRecords<S: DocumentStore + ?Sized> {
    store: Arc<S>,
}

impl<S: DocumentStore + ?Sized> Clone for ExperimentRecords<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: DocumentStore + ?Sized> ExperimentRecords<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Indexes enforcing experiment uniqueness. Idempotent.
    pub async fn ensure_indexes(&self) -> StorageResult<()> {
        self.store
            .ensure_index(EXPERIMENTS, &["name", "metadata.user", "version"], true)
            .await?;
        self.store
            .ensure_index(EXPERIMENTS, &["metadata.datetime"], false)
            .await
    }

    /// Register `experiment` and return its id.
    ///
    /// Fails with `DuplicateExperiment` when the `(name, user, version)` line
    /// already exists; bump `version` to branch a new one.
    pub async fn create(&self, experiment: &Experiment) -> StorageResult<String> {
        validate(experiment)?;

        let mut doc = to_document(experiment)?;
        doc.remove(ID_FIELD);
        let outcome = match self.store.write(EXPERIMENTS, doc, None).await {
            Ok(outcome) => outcome,
            Err(StorageError::DuplicateKey { .. }) => {
                return Err(StorageError::DuplicateExperiment {
                    name: experiment.name.clone(),
                    user: experiment.user().to_string(),
                    version: experiment.version,
                })
            }
            Err(e) => return Err(e),
        };
        let WriteOutcome::Inserted(id) = outcome else {
            return Err(StorageError::Backend(
                "insert did not report an assigned id".to_string(),
            ));
        };

        info!(
            experiment_id = %id,
            name = %experiment.name,
            user = %experiment.user(),
            version = experiment.version,
            "created experiment"
        );
        Ok(id)
    }

    /// Apply `patch` to `experiment`, conditioned on its id and `condition`.
    ///
    /// The search space is frozen once the experiment has trials: a space
    /// change is conditioned on the lock flag still being unset, so it cannot
    /// interleave with a first registration. `None` means the conditional
    /// write matched nothing.
    pub async fn update(
        &self,
        experiment: &Experiment,
        patch: &ExperimentPatch,
        condition: Option<Query>,
    ) -> StorageResult<Option<Experiment>> {
        if experiment.id.is_empty() {
            return Err(StorageError::Validation(
                "cannot update an unregistered experiment".to_string(),
            ));
        }

        if let Some(algorithms) = &patch.algorithms {
            validate_algorithms(algorithms)?;
        }

        let changes_space = patch.changes_space(experiment);
        let mut query = Query::by_id(&experiment.id);
        if changes_space {
            if experiment.space_locked {
                return Err(StorageError::SpaceLocked(experiment.id.clone()));
            }
            // Records written before the flag existed only have their trials.
            let trials = self
                .store
                .count(TRIALS, &Query::new().eq("experiment", experiment.id.as_str()))
                .await?;
            if trials > 0 {
                return Err(StorageError::SpaceLocked(experiment.id.clone()));
            }
            query = query.eq(SPACE_LOCKED, Value::Null);
        }
        if let Some(condition) = condition {
            query = query.and(condition);
        }

        if patch.is_empty() {
            return Ok(self.fetch(&query).await?.into_iter().next());
        }

        match self
            .store
            .read_and_write(EXPERIMENTS, &query, patch.to_document(experiment))
            .await?
        {
            Some(doc) => {
                debug!(experiment_id = %experiment.id, "updated experiment");
                Ok(Some(from_document(doc)?))
            }
            None => {
                if changes_space && self.get(&experiment.id).await?.space_locked {
                    return Err(StorageError::SpaceLocked(experiment.id.clone()));
                }
                warn!(experiment_id = %experiment.id, "experiment update lost");
                Ok(None)
            }
        }
    }

    pub async fn fetch(&self, query: &Query) -> StorageResult<Vec<Experiment>> {
        self.store
            .read(EXPERIMENTS, query, None)
            .await?
            .into_iter()
            .map(from_document::<Experiment>)
            .collect()
    }

    /// Experiment by id.
    pub async fn get(&self, id: &str) -> StorageResult<Experiment> {
        self.fetch(&Query::by_id(id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::ExperimentNotFound(id.to_string()))
    }

    /// Highest version of `name`, optionally restricted to one user.
    pub async fn fetch_latest(
        &self,
        name: &str,
        user: Option<&str>,
    ) -> StorageResult<Option<Experiment>> {
        let mut query = Query::new().eq("name", name);
        if let Some(user) = user {
            query = query.eq("metadata.user", user);
        }
        let query = query.sort_by("version", SortOrder::Descending).limit(1);
        Ok(self.fetch(&query).await?.into_iter().next())
    }
}

fn validate(experiment: &Experiment) -> StorageResult<()> {
    if experiment.name.trim().is_empty() {
        return Err(StorageError::Validation("experiment name cannot be empty".to_string()));
    }
    if experiment.user().trim().is_empty() {
        return Err(StorageError::Validation("experiment user cannot be empty".to_string()));
    }
    if experiment.version == 0 {
        return Err(StorageError::Validation("experiment version starts at 1".to_string()));
    }
    validate_algorithms(&experiment.algorithms)
}

fn validate_algorithms(algorithms: &Value) -> StorageResult<()> {
    if has_null_member(algorithms) {
        return Err(StorageError::Validation(
            "algorithm configuration cannot contain null values".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryDocumentStore;
    use crate::domain::models::Direction;
    use crate::services::TrialLifecycle;
    use std::collections::BTreeMap;

    async fn setup() -> (ExperimentRecords<MemoryDocumentStore>, TrialLifecycle<MemoryDocumentStore>) {
        let store = Arc::new(MemoryDocumentStore::new());
        let records = ExperimentRecords::new(Arc::clone(&store));
        records.ensure_indexes().await.unwrap();
        (records, TrialLifecycle::new(store))
    }

    #[tokio::test]
    async fn test_duplicate_experiment_is_rejected() {
        let (records, _) = setup().await;
        records.create(&Experiment::new("exp1", "u1")).await.unwrap();

        let err = records.create(&Experiment::new("exp1", "u1")).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::DuplicateExperiment { ref name, ref user, version: 1 }
                if name == "exp1" && user == "u1"
        ));

        records.create(&Experiment::new("exp1", "u2")).await.unwrap();
        records
            .create(&Experiment::new("exp1", "u1").with_version(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_latest_version() {
        let (records, _) = setup().await;
        for version in [1, 3, 2] {
            records
                .create(&Experiment::new("exp1", "u1").with_version(version))
                .await
                .unwrap();
        }

        let latest = records.fetch_latest("exp1", Some("u1")).await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert!(records.fetch_latest("exp1", Some("u9")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_and_space_lock() {
        let (records, trials) = setup().await;
        let id = records
            .create(&Experiment::new("exp1", "u1").with_dimension("x", "uniform(0, 1)"))
            .await
            .unwrap();
        let experiment = records.get(&id).await.unwrap();

        let updated = records
            .update(
                &experiment,
                &ExperimentPatch::new()
                    .with_max_trials(50)
                    .with_direction(Direction::Maximize),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.max_trials, Some(50));
        assert_eq!(updated.direction, Direction::Maximize);

        trials.register(&id, BTreeMap::new()).await.unwrap();
        let err = records
            .update(
                &updated,
                &ExperimentPatch::new().with_space(BTreeMap::from([(
                    "y".to_string(),
                    "uniform(0, 2)".to_string(),
                )])),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SpaceLocked(_)));
    }

    #[tokio::test]
    async fn test_first_registration_locks_space() {
        let (records, trials) = setup().await;
        let id = records.create(&Experiment::new("exp1", "u1")).await.unwrap();
        assert!(!records.get(&id).await.unwrap().space_locked);

        trials.register(&id, BTreeMap::new()).await.unwrap();
        assert!(records.get(&id).await.unwrap().space_locked);
    }

    #[tokio::test]
    async fn test_space_change_loses_to_registration_in_flight() {
        let store = Arc::new(MemoryDocumentStore::new());
        let records = ExperimentRecords::new(Arc::clone(&store));
        let id = records.create(&Experiment::new("exp1", "u1")).await.unwrap();
        let before = records.get(&id).await.unwrap();

        // A registration has stamped the experiment but not yet inserted its trial.
        let mut stamp = serde_json::Map::new();
        stamp.insert(SPACE_LOCKED.to_string(), Value::Bool(true));
        store
            .read_and_write(EXPERIMENTS, &Query::by_id(&id), stamp)
            .await
            .unwrap()
            .unwrap();

        let err = records
            .update(
                &before,
                &ExperimentPatch::new().with_space(BTreeMap::from([(
                    "x".to_string(),
                    "uniform(0, 1)".to_string(),
                )])),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SpaceLocked(_)));
        assert!(records.get(&id).await.unwrap().space.is_empty());
    }

    #[tokio::test]
    async fn test_conditional_update_lost() {
        let (records, _) = setup().await;
        let id = records.create(&Experiment::new("exp1", "u1")).await.unwrap();
        let experiment = records.get(&id).await.unwrap();

        let lost = records
            .update(
                &experiment,
                &ExperimentPatch::new().with_max_trials(10),
                Some(Query::new().eq("version", 7)),
            )
            .await
            .unwrap();
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn test_algorithms_with_null_members_are_rejected() {
        let (records, _) = setup().await;
        let err = records
            .create(&Experiment::new("exp1", "u1").with_algorithms(serde_json::json!({"tpe": {"seed": null}})))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));

        let id = records.create(&Experiment::new("exp1", "u1")).await.unwrap();
        let experiment = records.get(&id).await.unwrap();
        let err = records
            .update(
                &experiment,
                &ExperimentPatch::new().with_algorithms(serde_json::json!({"random": {"seed": null}})),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_get_missing_experiment() {
        let (records, _) = setup().await;
        let err = records.get("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::ExperimentNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_validates_fields() {
        let (records, _) = setup().await;
        let err = records.create(&Experiment::new(" ", "u1")).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }
}
