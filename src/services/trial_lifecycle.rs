//! Trial lifecycle: registration, reservation, and optimistic updates.
//!
//! Every mutation here is a single conditional write on one trial record.
//! Reservation is a compare-and-swap on `(id, status)`. Updates are
//! conditioned on the status the caller last observed and, while the trial
//! is held, on the holder's worker tag and start time, so a stale caller
//! loses instead of overwriting a newer state or another worker's claim.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::domain::errors::{StorageError, StorageResult};
use crate::domain::models::document::{from_document, to_document};
use crate::domain::models::{timestamp, Query, SortOrder, Trial, TrialPatch, TrialStatus, ID_FIELD};
use crate::domain::ports::{DocumentStore, WriteOutcome};
use crate::services::experiment_records::{EXPERIMENTS, SPACE_LOCKED};

/// Collection holding trial records.
pub const TRIALS: &str = "trials";

fn status_values(statuses: &[TrialStatus]) -> Vec<Value> {
    statuses
        .iter()
        .map(|s| Value::String(s.as_str().to_string()))
        .collect()
}

pub struct TrialLifecycle<S: DocumentStore + ?Sized> {
    store: Arc<S>,
}

impl<S: DocumentStore + ?Sized> Clone for TrialLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: DocumentStore + ?Sized> TrialLifecycle<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Indexes backing trial lookups and duplicate detection. Idempotent.
    pub async fn ensure_indexes(&self) -> StorageResult<()> {
        self.store
            .ensure_index(TRIALS, &["experiment", "fingerprint"], true)
            .await?;
        for field in ["experiment", "status", "submit_time", "end_time"] {
            self.store.ensure_index(TRIALS, &[field], false).await?;
        }
        Ok(())
    }

    /// Insert a new trial in status `new`.
    ///
    /// Registering the same parameters twice for one experiment fails with
    /// `DuplicateTrial`, which makes retrying a registration safe.
    pub async fn register(
        &self,
        experiment_id: &str,
        params: BTreeMap<String, Value>,
    ) -> StorageResult<Trial> {
        if experiment_id.is_empty() {
            return Err(StorageError::Validation(
                "trial must belong to an experiment".to_string(),
            ));
        }

        self.lock_space(experiment_id).await?;

        let mut trial = Trial::new(experiment_id, params);
        let outcome = match self.store.write(TRIALS, to_document(&trial)?, None).await {
            Ok(outcome) => outcome,
            Err(StorageError::DuplicateKey { .. }) => {
                return Err(StorageError::DuplicateTrial {
                    experiment: trial.experiment,
                    fingerprint: trial.fingerprint,
                })
            }
            Err(e) => return Err(e),
        };
        let WriteOutcome::Inserted(id) = outcome else {
            return Err(StorageError::Backend(
                "insert did not report an assigned id".to_string(),
            ));
        };

        trial.id = id;
        debug!(trial_id = %trial.id, experiment = %trial.experiment, "registered trial");
        Ok(trial)
    }

    /// Stamp the experiment's space as frozen. Only the first registration
    /// writes; later ones match nothing.
    async fn lock_space(&self, experiment_id: &str) -> StorageResult<()> {
        let unlocked = Query::by_id(experiment_id).eq(SPACE_LOCKED, Value::Null);
        let mut stamp = Map::new();
        stamp.insert(SPACE_LOCKED.to_string(), Value::Bool(true));
        if self
            .store
            .read_and_write(EXPERIMENTS, &unlocked, stamp)
            .await?
            .is_some()
        {
            debug!(experiment = experiment_id, "locked experiment space");
        }
        Ok(())
    }

    /// Claim one reservable trial matching `query` for `worker`.
    ///
    /// Candidates are tried oldest submission first (ties by id). Each claim
    /// only succeeds if the candidate still has the status it was read with;
    /// a candidate lost to another worker is skipped. Returns `None` when no
    /// candidate could be claimed.
    pub async fn reserve(&self, query: &Query, worker: &str) -> StorageResult<Option<Trial>> {
        if worker.is_empty() {
            return Err(StorageError::Validation("worker tag cannot be empty".to_string()));
        }

        let candidates_query = query
            .filters_only()
            .is_in("status", status_values(&TrialStatus::RESERVABLE))
            .sort_by("submit_time", SortOrder::Ascending);
        let candidates = self
            .store
            .read(TRIALS, &candidates_query, Some(&["status"]))
            .await?;

        let now = timestamp::now();
        let claim = TrialPatch::new()
            .with_status(TrialStatus::Reserved)
            .with_worker(worker)
            .with_start_time(now)
            .with_heartbeat(now)
            .to_document();

        for candidate in &candidates {
            let (Some(id), Some(observed)) = (
                candidate.get(ID_FIELD).and_then(Value::as_str),
                candidate.get("status").cloned(),
            ) else {
                continue;
            };

            let cas = Query::by_id(id).eq("status", observed);
            if let Some(doc) = self.store.read_and_write(TRIALS, &cas, claim.clone()).await? {
                let trial: Trial = from_document(doc)?;
                info!(trial_id = %trial.id, worker, "reserved trial");
                return Ok(Some(trial));
            }
            debug!(trial_id = id, worker, "lost reservation race, trying next candidate");
        }

        debug!(worker, candidates = candidates.len(), "no trial reserved");
        Ok(None)
    }

    pub async fn fetch(&self, query: &Query) -> StorageResult<Vec<Trial>> {
        self.store
            .read(TRIALS, query, None)
            .await?
            .into_iter()
            .map(from_document::<Trial>)
            .collect()
    }

    /// All trials of one experiment.
    pub async fn fetch_for_experiment(&self, experiment_id: &str) -> StorageResult<Vec<Trial>> {
        self.fetch(&Query::new().eq("experiment", experiment_id)).await
    }

    pub async fn count(&self, query: &Query) -> StorageResult<u64> {
        self.store.count(TRIALS, query).await
    }

    /// Apply `patch` to the stored record of `trial`.
    ///
    /// A status change must be a valid transition from `trial.status`. The
    /// write is conditioned on the record still having that status and, for
    /// a held trial, the same reservation (`worker`, `start_time`). Moving to
    /// a terminal status stamps `end_time` unless the patch sets one. `None`
    /// means the conditional write matched nothing: re-fetch and retry.
    pub async fn update(
        &self,
        trial: &Trial,
        patch: &TrialPatch,
        condition: Option<Query>,
    ) -> StorageResult<Option<Trial>> {
        if trial.id.is_empty() {
            return Err(StorageError::Validation(
                "cannot update an unregistered trial".to_string(),
            ));
        }

        let mut patch = patch.clone();
        if let Some(next) = patch.status {
            if next != trial.status {
                if !trial.status.can_transition_to(next) {
                    return Err(StorageError::InvalidStateTransition {
                        from: trial.status.to_string(),
                        to: next.to_string(),
                    });
                }
                if next.is_terminal() && patch.end_time.is_none() {
                    patch.end_time = Some(timestamp::now());
                }
            }
        }
        let mut query = ownership_guard(trial);
        if let Some(condition) = condition {
            query = query.and(condition);
        }

        if patch.is_empty() {
            return Ok(self.fetch(&query).await?.into_iter().next());
        }

        match self
            .store
            .read_and_write(TRIALS, &query, patch.to_document())
            .await?
        {
            Some(doc) => {
                let updated: Trial = from_document(doc)?;
                debug!(trial_id = %updated.id, status = %updated.status, "updated trial");
                Ok(Some(updated))
            }
            None => {
                warn!(
                    trial_id = %trial.id,
                    expected_status = %trial.status,
                    "trial update lost: record changed or no longer matches"
                );
                Ok(None)
            }
        }
    }

    /// Refresh the heartbeat while the reservation behind `trial` is still held.
    pub async fn heartbeat(&self, trial: &Trial) -> StorageResult<Option<Trial>> {
        let Some(worker) = trial.worker.as_deref() else {
            return Err(StorageError::Validation(format!(
                "trial {} is not held by a worker",
                trial.id
            )));
        };

        let query = Query::by_id(&trial.id)
            .is_in("status", status_values(&TrialStatus::HELD))
            .eq("worker", worker)
            .eq("start_time", reservation_start(trial));
        let patch = TrialPatch::new().with_heartbeat(timestamp::now());

        let Some(doc) = self
            .store
            .read_and_write(TRIALS, &query, patch.to_document())
            .await?
        else {
            warn!(trial_id = %trial.id, worker, "heartbeat lost: reservation no longer held");
            return Ok(None);
        };
        Ok(Some(from_document(doc)?))
    }

    /// Held trials whose last heartbeat is older than `threshold`.
    pub async fn fetch_lost(
        &self,
        experiment_id: &str,
        threshold: Duration,
    ) -> StorageResult<Vec<Trial>> {
        let cutoff = timestamp::format(&(timestamp::now() - threshold));
        let query = Query::new()
            .eq("experiment", experiment_id)
            .is_in("status", status_values(&TrialStatus::HELD))
            .lt("heartbeat", cutoff)
            .sort_by("heartbeat", SortOrder::Ascending);
        self.fetch(&query).await
    }
}

/// Conditions matching `trial` only while it is in the state the caller saw.
///
/// Status alone repeats (`reserved -> interrupted -> reserved`), so a held
/// trial is also pinned to the reservation that produced it.
fn ownership_guard(trial: &Trial) -> Query {
    let query = Query::by_id(&trial.id).eq("status", trial.status.as_str());
    if !trial.status.is_held() {
        return query;
    }
    query
        .eq("worker", trial.worker.clone().map_or(Value::Null, Value::String))
        .eq("start_time", reservation_start(trial))
}

fn reservation_start(trial: &Trial) -> Value {
    trial
        .start_time
        .map_or(Value::Null, |at| Value::String(timestamp::format(&at)))
}
