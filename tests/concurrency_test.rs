//! Concurrent reservation tests
//!
//! Several workers race for fewer trials than there are workers. Each trial
//! must be handed out exactly once and every surplus worker must get `None`.

mod helpers;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;
use trialstore::infrastructure::RetryPolicy;
use trialstore::{Experiment, Query, StorageProtocol, TrialStatus};

use helpers::database::{open_file_protocol, setup_memory_protocol};

const TRIALS: i64 = 8;
const WORKERS: usize = 12;

async fn seed(storage: &Arc<dyn StorageProtocol>) -> String {
    let experiment_id = storage
        .create_experiment(&Experiment::new("race", "u1"))
        .await
        .unwrap();
    for x in 0..TRIALS {
        storage
            .register_trial(&experiment_id, BTreeMap::from([("x".to_string(), json!(x))]))
            .await
            .unwrap();
    }
    experiment_id
}

/// Reserve once per worker concurrently; returns the reserved trial ids.
async fn race(workers: Vec<Arc<dyn StorageProtocol>>, experiment_id: &str) -> Vec<Option<String>> {
    let mut set = JoinSet::new();
    for (n, storage) in workers.into_iter().enumerate() {
        let query = Query::new().eq("experiment", experiment_id);
        set.spawn(async move {
            let worker = format!("w{n}");
            let retry = RetryPolicy::new(5, 10, 200);
            let (client, query_ref, tag) = (storage.as_ref(), &query, worker.as_str());
            let reserved = retry
                .execute(move || client.reserve_trial(query_ref, tag))
                .await
                .unwrap();
            if let Some(trial) = &reserved {
                assert_eq!(trial.worker.as_deref(), Some(worker.as_str()));
            }
            reserved.map(|trial| trial.id)
        });
    }

    let mut outcomes = Vec::new();
    while let Some(outcome) = set.join_next().await {
        outcomes.push(outcome.unwrap());
    }
    outcomes
}

async fn assert_each_trial_reserved_once(
    storage: &Arc<dyn StorageProtocol>,
    experiment_id: &str,
    outcomes: &[Option<String>],
) {
    let reserved: Vec<&String> = outcomes.iter().flatten().collect();
    let distinct: HashSet<&String> = reserved.iter().copied().collect();

    assert_eq!(reserved.len(), TRIALS as usize);
    assert_eq!(distinct.len(), TRIALS as usize);
    assert_eq!(
        outcomes.iter().filter(|o| o.is_none()).count(),
        WORKERS - TRIALS as usize
    );

    let stored = storage
        .fetch_trials(&Query::new().eq("experiment", experiment_id))
        .await
        .unwrap();
    assert!(stored.iter().all(|t| t.status == TrialStatus::Reserved));
    assert!(stored.iter().all(|t| distinct.contains(&t.id)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservation_across_connection_pools() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");

    let admin = open_file_protocol(&path).await;
    let experiment_id = seed(&admin).await;

    // One pool per worker, as separate processes would have.
    let mut workers = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        workers.push(open_file_protocol(&path).await);
    }

    let outcomes = race(workers, &experiment_id).await;
    assert_each_trial_reserved_once(&admin, &experiment_id, &outcomes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservation_in_memory() {
    let storage = setup_memory_protocol().await;
    let experiment_id = seed(&storage).await;

    let workers = (0..WORKERS).map(|_| Arc::clone(&storage)).collect();
    let outcomes = race(workers, &experiment_id).await;
    assert_each_trial_reserved_once(&storage, &experiment_id, &outcomes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_of_same_params() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("register.db");

    let admin = open_file_protocol(&path).await;
    let experiment_id = admin
        .create_experiment(&Experiment::new("dupes", "u1"))
        .await
        .unwrap();

    let mut set = JoinSet::new();
    for _ in 0..4 {
        let storage = open_file_protocol(&path).await;
        let experiment_id = experiment_id.clone();
        set.spawn(async move {
            let retry = RetryPolicy::new(5, 10, 200);
            let (client, experiment_id) = (storage.as_ref(), experiment_id.as_str());
            retry
                .execute(move || {
                    client.register_trial(
                        experiment_id,
                        BTreeMap::from([("x".to_string(), json!(42))]),
                    )
                })
                .await
        });
    }

    let mut created = 0;
    while let Some(outcome) = set.join_next().await {
        match outcome.unwrap() {
            Ok(_) => created += 1,
            Err(err) => assert!(err.is_duplicate(), "unexpected error: {err}"),
        }
    }
    assert_eq!(created, 1);
}
