//! Aggregate view of an experiment for completion checks and analysis.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::experiment::Direction;
use super::timestamp;
use super::trial::TrialStatus;

/// One completed trial's objective, in completion-order position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectivePoint {
    pub trial_id: String,
    #[serde(with = "timestamp")]
    pub submit_time: DateTime<Utc>,
    #[serde(with = "timestamp::option")]
    pub end_time: Option<DateTime<Utc>>,
    pub objective: f64,
}

/// Trial counts by status plus the best-so-far trajectory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentReport {
    pub experiment_id: String,
    pub name: String,
    pub version: u32,
    pub direction: Direction,
    pub max_trials: Option<u64>,
    /// Every status is present, zero when no trial holds it
    pub counts: BTreeMap<TrialStatus, u64>,
    /// Completed-trial objectives ordered by submission
    pub objectives: Vec<ObjectivePoint>,
    /// Running best of `objectives`, same length
    pub trajectory: Vec<f64>,
}

impl ExperimentReport {
    pub fn count(&self, status: TrialStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Trials a worker could claim right now.
    pub fn reservable(&self) -> u64 {
        TrialStatus::RESERVABLE.iter().map(|s| self.count(*s)).sum()
    }

    /// Trials currently held by a worker.
    pub fn in_progress(&self) -> u64 {
        TrialStatus::HELD.iter().map(|s| self.count(*s)).sum()
    }

    /// Current best objective.
    pub fn best(&self) -> Option<f64> {
        self.trajectory.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_helpers() {
        let mut counts: BTreeMap<TrialStatus, u64> =
            TrialStatus::ALL.iter().map(|s| (*s, 0)).collect();
        counts.insert(TrialStatus::New, 2);
        counts.insert(TrialStatus::Interrupted, 1);
        counts.insert(TrialStatus::Running, 3);

        let report = ExperimentReport {
            experiment_id: "e1".into(),
            name: "exp1".into(),
            version: 1,
            direction: Direction::Minimize,
            max_trials: Some(10),
            counts,
            objectives: Vec::new(),
            trajectory: vec![3.0, 1.0],
        };

        assert_eq!(report.total(), 6);
        assert_eq!(report.reservable(), 3);
        assert_eq!(report.in_progress(), 3);
        assert_eq!(report.count(TrialStatus::Broken), 0);
        assert_eq!(report.best(), Some(1.0));
    }

    #[test]
    fn test_serializes_status_keys_as_strings() {
        let report = ExperimentReport {
            experiment_id: "e1".into(),
            name: "exp1".into(),
            version: 1,
            direction: Direction::Maximize,
            max_trials: None,
            counts: BTreeMap::from([(TrialStatus::Completed, 1)]),
            objectives: Vec::new(),
            trajectory: Vec::new(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["counts"]["completed"], 1);
        assert_eq!(json["direction"], "maximize");
    }
}
