//! Aggregate reporting over an experiment's trials.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::domain::models::{
    Direction, Experiment, ExperimentReport, ObjectivePoint, Trial, TrialStatus,
};

/// Running best of `objectives`: position `i` holds the best value among
/// positions `0..=i`, by `direction`.
///
/// NaN values never become the incumbent.
pub fn best_so_far(objectives: &[f64], direction: Direction) -> Vec<f64> {
    let mut trajectory = Vec::with_capacity(objectives.len());
    let mut best: Option<f64> = None;
    for &value in objectives {
        best = match best {
            None if value.is_nan() => None,
            None => Some(value),
            Some(current) if direction.improves(value, current) => Some(value),
            keep => keep,
        };
        trajectory.push(best.unwrap_or(value));
    }
    trajectory
}

/// Completed trials with a numeric objective, ordered by submission, then
/// completion, then id.
pub fn completed_objectives(trials: &[Trial]) -> Vec<ObjectivePoint> {
    let mut completed: Vec<&Trial> = trials
        .iter()
        .filter(|t| t.status == TrialStatus::Completed)
        .collect();
    completed.sort_by(|a, b| {
        a.submit_time
            .cmp(&b.submit_time)
            .then_with(|| a.end_time.cmp(&b.end_time))
            .then_with(|| a.id.cmp(&b.id))
    });

    completed
        .into_iter()
        .filter_map(|t| {
            t.objective_value().map(|objective| ObjectivePoint {
                trial_id: t.id.clone(),
                submit_time: t.submit_time,
                end_time: t.end_time,
                objective,
            })
        })
        .collect()
}

/// Count trials by status; every status appears, possibly with zero.
pub fn status_counts(trials: &[Trial]) -> BTreeMap<TrialStatus, u64> {
    let mut counts: BTreeMap<TrialStatus, u64> =
        TrialStatus::ALL.iter().map(|s| (*s, 0)).collect();
    for trial in trials {
        *counts.entry(trial.status).or_insert(0) += 1;
    }
    counts
}

/// Build the report for `experiment` from all of its trials.
pub fn build_report(experiment: &Experiment, trials: &[Trial]) -> ExperimentReport {
    let objectives = completed_objectives(trials);
    let values: Vec<f64> = objectives.iter().map(|p| p.objective).collect();
    let trajectory = best_so_far(&values, experiment.direction);

    ExperimentReport {
        experiment_id: experiment.id.clone(),
        name: experiment.name.clone(),
        version: experiment.version,
        direction: experiment.direction,
        max_trials: experiment.max_trials,
        counts: status_counts(trials),
        objectives,
        trajectory,
    }
}

/// Best objective among `points`, by `direction`.
pub fn best_objective(points: &[ObjectivePoint], direction: Direction) -> Option<f64> {
    points
        .iter()
        .map(|p| p.objective)
        .filter(|v| !v.is_nan())
        .max_by(|a, b| {
            let ord = a.partial_cmp(b).unwrap_or(Ordering::Equal);
            match direction {
                Direction::Minimize => ord.reverse(),
                Direction::Maximize => ord,
            }
        })
}
