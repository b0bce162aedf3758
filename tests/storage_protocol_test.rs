mod helpers;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use trialstore::{
    Experiment, ExperimentPatch, Query, StorageError, StorageProtocol, Trial, TrialPatch,
    TrialResult, TrialStatus,
};

use helpers::database::{setup_memory_protocol, setup_sqlite_protocol};

/// Run a scenario against every backend.
macro_rules! backend_tests {
    ($($name:ident),* $(,)?) => {
        mod sqlite {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(super::setup_sqlite_protocol().await).await;
                }
            )*
        }

        mod memory {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(super::setup_memory_protocol().await).await;
                }
            )*
        }
    };
}

backend_tests!(
    duplicate_experiment_is_rejected,
    branched_version_is_accepted,
    reserve_hands_out_distinct_trials,
    reserve_prefers_oldest_submission,
    reserve_returns_none_when_exhausted,
    interrupted_trial_is_reservable_again,
    best_so_far_trajectory,
    full_update_is_idempotent,
    register_fetch_round_trip,
    duplicate_trial_is_rejected,
    update_with_stale_status_is_lost,
    stale_holder_loses_rereserved_trial,
    terminal_status_cannot_be_left,
    space_is_locked_after_first_trial,
    algorithms_update_replaces_configuration,
    heartbeat_and_lost_trials,
    malformed_result_leaves_trial_untouched,
);

fn params(x: i64) -> BTreeMap<String, Value> {
    BTreeMap::from([("x".to_string(), json!(x))])
}

async fn create_experiment(storage: &Arc<dyn StorageProtocol>) -> String {
    storage
        .create_experiment(&Experiment::new("exp1", "u1").with_dimension("x", "uniform(0, 10)"))
        .await
        .unwrap()
}

fn trials_of(experiment_id: &str) -> Query {
    Query::new().eq("experiment", experiment_id)
}

/// Register trials with strictly increasing submit times.
async fn register_sequence(
    storage: &Arc<dyn StorageProtocol>,
    experiment_id: &str,
    count: i64,
) -> Vec<Trial> {
    let mut trials = Vec::new();
    for x in 0..count {
        trials.push(storage.register_trial(experiment_id, params(x)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    trials
}

async fn complete(storage: &Arc<dyn StorageProtocol>, trial: &Trial, objective: f64) -> Trial {
    let running = storage
        .update_trial(trial, &TrialPatch::new().with_status(TrialStatus::Running), None)
        .await
        .unwrap()
        .unwrap();
    storage
        .update_trial(
            &running,
            &TrialPatch::new()
                .with_status(TrialStatus::Completed)
                .with_results(vec![TrialResult::objective("loss", objective)]),
            None,
        )
        .await
        .unwrap()
        .unwrap()
}

async fn duplicate_experiment_is_rejected(storage: Arc<dyn StorageProtocol>) {
    create_experiment(&storage).await;

    let err = storage
        .create_experiment(&Experiment::new("exp1", "u1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::DuplicateExperiment { ref name, ref user, version: 1 }
            if name == "exp1" && user == "u1"
    ));
    assert!(err.is_duplicate());

    // Same name under another owner is a different line.
    assert!(storage
        .create_experiment(&Experiment::new("exp1", "u2"))
        .await
        .is_ok());
}

async fn branched_version_is_accepted(storage: Arc<dyn StorageProtocol>) {
    create_experiment(&storage).await;
    storage
        .create_experiment(&Experiment::new("exp1", "u1").with_version(2))
        .await
        .unwrap();

    let versions = storage
        .fetch_experiments(&Query::new().eq("name", "exp1").eq("metadata.user", "u1"))
        .await
        .unwrap();
    let mut numbers: Vec<u32> = versions.iter().map(|e| e.version).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![1, 2]);
}

async fn reserve_hands_out_distinct_trials(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    let registered = register_sequence(&storage, &experiment_id, 3).await;

    let first = storage
        .reserve_trial(&trials_of(&experiment_id), "w1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, TrialStatus::Reserved);
    assert_eq!(first.worker.as_deref(), Some("w1"));
    assert!(first.start_time.is_some());

    let second = storage
        .reserve_trial(&trials_of(&experiment_id), "w2")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.worker.as_deref(), Some("w2"));
    assert!(registered.iter().any(|t| t.id == second.id));

    let stored_first = storage
        .fetch_trials(&Query::by_id(&first.id))
        .await
        .unwrap();
    assert_eq!(stored_first[0].worker.as_deref(), Some("w1"));
}

async fn reserve_prefers_oldest_submission(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    let registered = register_sequence(&storage, &experiment_id, 3).await;

    for expected in &registered {
        let reserved = storage
            .reserve_trial(&trials_of(&experiment_id), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reserved.id, expected.id);
    }
}

async fn reserve_returns_none_when_exhausted(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    assert!(storage
        .reserve_trial(&trials_of(&experiment_id), "w1")
        .await
        .unwrap()
        .is_none());

    register_sequence(&storage, &experiment_id, 1).await;
    assert!(storage
        .reserve_trial(&trials_of(&experiment_id), "w1")
        .await
        .unwrap()
        .is_some());
    assert!(storage
        .reserve_trial(&trials_of(&experiment_id), "w2")
        .await
        .unwrap()
        .is_none());

    // Starvation is told apart from exhaustion through the counts.
    let experiment = storage
        .fetch_experiments(&Query::by_id(&experiment_id))
        .await
        .unwrap()
        .remove(0);
    let report = storage.experiment_report(&experiment).await.unwrap();
    assert_eq!(report.reservable(), 0);
    assert_eq!(report.in_progress(), 1);
}

async fn interrupted_trial_is_reservable_again(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    register_sequence(&storage, &experiment_id, 1).await;

    let reserved = storage
        .reserve_trial(&trials_of(&experiment_id), "w1")
        .await
        .unwrap()
        .unwrap();
    storage
        .update_trial(
            &reserved,
            &TrialPatch::new()
                .with_status(TrialStatus::Interrupted)
                .clear_worker(),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let again = storage
        .reserve_trial(&trials_of(&experiment_id), "w2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, reserved.id);
    assert_eq!(again.worker.as_deref(), Some("w2"));
}

async fn best_so_far_trajectory(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    let registered = register_sequence(&storage, &experiment_id, 5).await;

    for (trial, objective) in registered.iter().zip([3.0, 1.0, 4.0, 1.0, 2.0]) {
        let reserved = storage
            .reserve_trial(&Query::by_id(&trial.id), "w1")
            .await
            .unwrap()
            .unwrap();
        complete(&storage, &reserved, objective).await;
    }

    let experiment = storage
        .fetch_experiments(&Query::by_id(&experiment_id))
        .await
        .unwrap()
        .remove(0);
    let report = storage.experiment_report(&experiment).await.unwrap();

    assert_eq!(report.count(TrialStatus::Completed), 5);
    assert_eq!(report.trajectory, vec![3.0, 1.0, 1.0, 1.0, 1.0]);
    assert_eq!(report.best(), Some(1.0));
    let objectives: Vec<f64> = report.objectives.iter().map(|p| p.objective).collect();
    assert_eq!(objectives, vec![3.0, 1.0, 4.0, 1.0, 2.0]);
}

async fn full_update_is_idempotent(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    register_sequence(&storage, &experiment_id, 1).await;
    let reserved = storage
        .reserve_trial(&trials_of(&experiment_id), "w1")
        .await
        .unwrap()
        .unwrap();
    let completed = complete(&storage, &reserved, 0.5).await;

    let end_time = completed.end_time.unwrap();
    let patch = TrialPatch::new()
        .with_status(TrialStatus::Completed)
        .with_results(vec![TrialResult::objective("loss", 0.25)])
        .with_end_time(end_time);

    let once = storage
        .update_trial(&completed, &patch, None)
        .await
        .unwrap()
        .unwrap();
    let twice = storage
        .update_trial(&once, &patch, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(once, twice);
    assert_eq!(twice.objective_value(), Some(0.25));
}

async fn register_fetch_round_trip(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    let assignment = BTreeMap::from([
        ("x".to_string(), json!(1.5)),
        ("optimizer".to_string(), json!("adam")),
        ("layers".to_string(), json!([64, 32])),
    ]);
    let registered = storage
        .register_trial(&experiment_id, assignment)
        .await
        .unwrap();
    assert_eq!(registered.status, TrialStatus::New);
    assert!(!registered.id.is_empty());

    let fetched = storage
        .fetch_trials(&Query::by_id(&registered.id))
        .await
        .unwrap();
    assert_eq!(fetched, vec![registered]);
}

async fn duplicate_trial_is_rejected(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    storage.register_trial(&experiment_id, params(7)).await.unwrap();

    let err = storage
        .register_trial(&experiment_id, params(7))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateTrial { .. }));

    let count = storage
        .fetch_trials(&trials_of(&experiment_id))
        .await
        .unwrap()
        .len();
    assert_eq!(count, 1);
}

async fn update_with_stale_status_is_lost(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    let registered = register_sequence(&storage, &experiment_id, 1).await.remove(0);

    // Another worker claims it after `registered` was read.
    storage
        .reserve_trial(&trials_of(&experiment_id), "w1")
        .await
        .unwrap()
        .unwrap();

    let lost = storage
        .update_trial(
            &registered,
            &TrialPatch::new().with_status(TrialStatus::Suspended),
            None,
        )
        .await
        .unwrap();
    assert!(lost.is_none());

    let stored = storage
        .fetch_trials(&Query::by_id(&registered.id))
        .await
        .unwrap();
    assert_eq!(stored[0].status, TrialStatus::Reserved);
}

async fn stale_holder_loses_rereserved_trial(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    register_sequence(&storage, &experiment_id, 1).await;

    let first = storage
        .reserve_trial(&trials_of(&experiment_id), "w1")
        .await
        .unwrap()
        .unwrap();

    // The liveness monitor releases it and w2 picks it up.
    storage
        .update_trial(
            &first,
            &TrialPatch::new()
                .with_status(TrialStatus::Interrupted)
                .clear_worker(),
            None,
        )
        .await
        .unwrap()
        .unwrap();
    let second = storage
        .reserve_trial(&trials_of(&experiment_id), "w2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, first.status);

    // w1 still holds a copy that says `reserved`.
    let stale_start = storage
        .update_trial(&first, &TrialPatch::new().with_status(TrialStatus::Running), None)
        .await
        .unwrap();
    assert!(stale_start.is_none());

    let stale_results = storage
        .update_trial(
            &first,
            &TrialPatch::new().with_results(vec![TrialResult::objective("loss", 9.0)]),
            None,
        )
        .await
        .unwrap();
    assert!(stale_results.is_none());

    let stored = storage
        .fetch_trials(&Query::by_id(&first.id))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(stored.status, TrialStatus::Reserved);
    assert_eq!(stored.worker.as_deref(), Some("w2"));
    assert!(stored.results.is_empty());

    let running = storage
        .update_trial(&second, &TrialPatch::new().with_status(TrialStatus::Running), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(running.worker.as_deref(), Some("w2"));
}

async fn terminal_status_cannot_be_left(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    register_sequence(&storage, &experiment_id, 1).await;
    let reserved = storage
        .reserve_trial(&trials_of(&experiment_id), "w1")
        .await
        .unwrap()
        .unwrap();
    let broken = storage
        .update_trial(&reserved, &TrialPatch::new().with_status(TrialStatus::Broken), None)
        .await
        .unwrap()
        .unwrap();
    assert!(broken.end_time.is_some());

    for next in [TrialStatus::New, TrialStatus::Interrupted, TrialStatus::Completed] {
        let err = storage
            .update_trial(&broken, &TrialPatch::new().with_status(next), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidStateTransition { .. }));
    }

    assert!(storage
        .reserve_trial(&trials_of(&experiment_id), "w2")
        .await
        .unwrap()
        .is_none());
}

async fn space_is_locked_after_first_trial(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    let experiment = storage
        .fetch_experiments(&Query::by_id(&experiment_id))
        .await
        .unwrap()
        .remove(0);

    let updated = storage
        .update_experiment(&experiment, &ExperimentPatch::new().with_max_trials(20), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.max_trials, Some(20));

    storage.register_trial(&experiment_id, params(1)).await.unwrap();

    let new_space = BTreeMap::from([("y".to_string(), "uniform(0, 1)".to_string())]);
    let err = storage
        .update_experiment(&updated, &ExperimentPatch::new().with_space(new_space), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::SpaceLocked(_)));

    // A condition that no longer holds makes the write a no-op.
    let stale = storage
        .update_experiment(
            &updated,
            &ExperimentPatch::new().with_max_trials(30),
            Some(Query::new().eq("max_trials", 10)),
        )
        .await
        .unwrap();
    assert!(stale.is_none());
}

async fn algorithms_update_replaces_configuration(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = storage
        .create_experiment(
            &Experiment::new("exp1", "u1").with_algorithms(json!({"tpe": {"seed": 1, "n_initial": 5}})),
        )
        .await
        .unwrap();
    let experiment = storage
        .fetch_experiments(&Query::by_id(&experiment_id))
        .await
        .unwrap()
        .remove(0);

    let updated = storage
        .update_experiment(
            &experiment,
            &ExperimentPatch::new().with_algorithms(json!({"random": {"seed": 2}})),
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.algorithms, json!({"random": {"seed": 2}}));

    let stored = storage
        .fetch_experiments(&Query::by_id(&experiment_id))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(stored.algorithms, json!({"random": {"seed": 2}}));
}

async fn heartbeat_and_lost_trials(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    register_sequence(&storage, &experiment_id, 2).await;

    let held = storage
        .reserve_trial(&trials_of(&experiment_id), "w1")
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let lost = storage
        .fetch_lost_trials(&experiment_id, chrono::Duration::milliseconds(10))
        .await
        .unwrap();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].id, held.id);

    let refreshed = storage.update_heartbeat(&held).await.unwrap().unwrap();
    assert!(refreshed.heartbeat > held.heartbeat);
    assert!(storage
        .fetch_lost_trials(&experiment_id, chrono::Duration::seconds(60))
        .await
        .unwrap()
        .is_empty());

    // The monitor releases it; the old holder's heartbeat is then refused.
    storage
        .update_trial(
            &refreshed,
            &TrialPatch::new()
                .with_status(TrialStatus::Interrupted)
                .clear_worker(),
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert!(storage.update_heartbeat(&held).await.unwrap().is_none());
}

async fn malformed_result_leaves_trial_untouched(storage: Arc<dyn StorageProtocol>) {
    let experiment_id = create_experiment(&storage).await;
    let trial = register_sequence(&storage, &experiment_id, 1).await.remove(0);

    let mut artifact = tempfile::NamedTempFile::new().unwrap();
    write!(
        artifact,
        r#"[{{"name": "loss", "type": "objective", "value": 1.0}}, {{"name": "", "type": "statistic", "value": 2}}]"#
    )
    .unwrap();

    let err = storage
        .retrieve_result(&trial, artifact.path())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::MalformedResult(_)));

    let stored = storage.fetch_trials(&Query::by_id(&trial.id)).await.unwrap();
    assert!(stored[0].results.is_empty());

    let mut valid = tempfile::NamedTempFile::new().unwrap();
    write!(
        valid,
        r#"[{{"name": "loss", "type": "objective", "value": 1.0}}, {{"name": "grad", "type": "gradient", "value": [0.1, 0.2]}}]"#
    )
    .unwrap();
    let parsed = storage.retrieve_result(&trial, valid.path()).await.unwrap();
    assert_eq!(parsed.results.len(), 2);
    assert_eq!(parsed.objective_value(), Some(1.0));
}
