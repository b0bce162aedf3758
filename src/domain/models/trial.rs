//! Trial domain model.
//!
//! A trial is one concrete parameter assignment proposed for an experiment,
//! together with its execution status and the measurements it produced.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::document::Document;
use super::timestamp;

/// Status of a trial in the reservation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Proposed and waiting for a worker
    New,
    /// Claimed by a worker, not yet started
    Reserved,
    /// Being executed by the reserving worker
    Running,
    /// Paused by an operator; not reservable until resumed
    Suspended,
    /// Released without completion; reservable again
    Interrupted,
    /// Finished with results
    Completed,
    /// Failed; never retried
    Broken,
}

impl Default for TrialStatus {
    fn default() -> Self {
        Self::New
    }
}

impl TrialStatus {
    pub const ALL: [Self; 7] = [
        Self::New,
        Self::Reserved,
        Self::Running,
        Self::Suspended,
        Self::Interrupted,
        Self::Completed,
        Self::Broken,
    ];

    /// Statuses a worker may claim.
    pub const RESERVABLE: [Self; 2] = [Self::New, Self::Interrupted];

    /// Statuses held by exactly one worker.
    pub const HELD: [Self; 2] = [Self::Reserved, Self::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reserved => "reserved",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
            Self::Broken => "broken",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "new" => Some(Self::New),
            "reserved" => Some(Self::Reserved),
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            "interrupted" => Some(Self::Interrupted),
            "completed" | "complete" => Some(Self::Completed),
            "broken" => Some(Self::Broken),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Broken)
    }

    pub fn is_reservable(&self) -> bool {
        Self::RESERVABLE.contains(self)
    }

    pub fn is_held(&self) -> bool {
        Self::HELD.contains(self)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::New => vec![Self::Reserved, Self::Suspended],
            Self::Reserved => vec![Self::Running, Self::Interrupted, Self::Broken],
            Self::Running => vec![Self::Completed, Self::Broken, Self::Interrupted],
            Self::Interrupted => vec![Self::Reserved, Self::Suspended],
            Self::Suspended => vec![Self::New],
            Self::Completed | Self::Broken => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a reported measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Objective,
    Constraint,
    Statistic,
    Gradient,
    /// Placeholder objective assigned by parallel strategies to pending trials
    Lie,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Objective => "objective",
            Self::Constraint => "constraint",
            Self::Statistic => "statistic",
            Self::Gradient => "gradient",
            Self::Lie => "lie",
        }
    }
}

/// A named, typed measurement attached to a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub name: String,
    #[serde(rename = "type")]
    pub result_type: ResultType,
    pub value: Value,
}

impl TrialResult {
    pub fn new(name: impl Into<String>, result_type: ResultType, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            result_type,
            value: value.into(),
        }
    }

    pub fn objective(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, ResultType::Objective, value)
    }
}

/// One unit of work: a parameter assignment and its execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    /// Store-assigned identifier; empty until registered
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Owning experiment id
    pub experiment: String,
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub status: TrialStatus,
    /// Worker currently holding the reservation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(with = "timestamp")]
    pub submit_time: DateTime<Utc>,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Vec<TrialResult>,
    /// Digest of experiment and params; unique per experiment
    pub fingerprint: String,
}

impl Trial {
    /// Create an unregistered trial in status `new`.
    pub fn new(experiment: impl Into<String>, params: BTreeMap<String, Value>) -> Self {
        let experiment = experiment.into();
        let fingerprint = fingerprint(&experiment, &params);
        Self {
            id: String::new(),
            experiment,
            params,
            status: TrialStatus::New,
            worker: None,
            submit_time: timestamp::now(),
            start_time: None,
            end_time: None,
            heartbeat: None,
            results: Vec::new(),
            fingerprint,
        }
    }

    /// The single objective result, if one was reported.
    pub fn objective(&self) -> Option<&TrialResult> {
        self.results
            .iter()
            .find(|r| r.result_type == ResultType::Objective)
    }

    /// Numeric value of the objective.
    pub fn objective_value(&self) -> Option<f64> {
        self.objective().and_then(|r| r.value.as_f64())
    }
}

/// Deterministic identity of a parameter assignment within an experiment.
///
/// `BTreeMap` and `serde_json::Map` both serialize with sorted keys, so the
/// JSON encoding is canonical.
pub fn fingerprint(experiment: &str, params: &BTreeMap<String, Value>) -> String {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(experiment.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Typed partial update of a trial.
///
/// Unset fields are left untouched. `worker: Some(None)` clears the worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialPatch {
    pub status: Option<TrialStatus>,
    pub worker: Option<Option<String>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub results: Option<Vec<TrialResult>>,
}

impl TrialPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TrialStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(Some(worker.into()));
        self
    }

    pub fn clear_worker(mut self) -> Self {
        self.worker = Some(None);
        self
    }

    pub fn with_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn with_end_time(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn with_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.heartbeat = Some(at);
        self
    }

    pub fn with_results(mut self, results: Vec<TrialResult>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge-patch document for the set fields.
    pub fn to_document(&self) -> Document {
        let mut doc = Map::new();
        if let Some(status) = self.status {
            doc.insert("status".into(), Value::String(status.as_str().into()));
        }
        if let Some(worker) = &self.worker {
            doc.insert(
                "worker".into(),
                worker.clone().map_or(Value::Null, Value::String),
            );
        }
        for (key, at) in [
            ("start_time", self.start_time),
            ("end_time", self.end_time),
            ("heartbeat", self.heartbeat),
        ] {
            if let Some(at) = at {
                doc.insert(key.into(), Value::String(timestamp::format(&at)));
            }
        }
        if let Some(results) = &self.results {
            let encoded = results
                .iter()
                .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                .collect();
            doc.insert("results".into(), Value::Array(encoded));
        }
        doc
    }

    /// Apply the patch to an in-memory copy.
    pub fn apply_to(&self, trial: &mut Trial) {
        if let Some(status) = self.status {
            trial.status = status;
        }
        if let Some(worker) = &self.worker {
            trial.worker.clone_from(worker);
        }
        if self.start_time.is_some() {
            trial.start_time = self.start_time;
        }
        if self.end_time.is_some() {
            trial.end_time = self.end_time;
        }
        if self.heartbeat.is_some() {
            trial.heartbeat = self.heartbeat;
        }
        if let Some(results) = &self.results {
            trial.results.clone_from(results);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::document::{from_document, merge_patch, to_document};
    use serde_json::json;

    fn params(x: f64, y: &str) -> BTreeMap<String, Value> {
        BTreeMap::from([("x".to_string(), json!(x)), ("y".to_string(), json!(y))])
    }

    #[test]
    fn test_status_round_trip() {
        for status in TrialStatus::ALL {
            assert_eq!(TrialStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TrialStatus::from_str("COMPLETE"), Some(TrialStatus::Completed));
        assert_eq!(TrialStatus::from_str("unknown"), None);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for status in TrialStatus::ALL {
            if status.is_terminal() {
                assert!(status.valid_transitions().is_empty(), "{status} must be final");
            }
        }
        assert!(TrialStatus::New.can_transition_to(TrialStatus::Reserved));
        assert!(TrialStatus::Interrupted.can_transition_to(TrialStatus::Reserved));
        assert!(!TrialStatus::New.can_transition_to(TrialStatus::Completed));
        assert!(!TrialStatus::Completed.can_transition_to(TrialStatus::New));
        assert!(TrialStatus::Suspended.can_transition_to(TrialStatus::New));
        assert!(!TrialStatus::Suspended.is_reservable());
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Trial::new("exp", params(0.5, "relu"));
        let b = Trial::new("exp", params(0.5, "relu"));
        let c = Trial::new("exp", params(0.25, "relu"));
        let d = Trial::new("other", params(0.5, "relu"));

        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
        assert_ne!(a.fingerprint, d.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn test_document_round_trip_omits_empty_fields() {
        let trial = Trial::new("exp", params(1.0, "tanh"));
        let doc = to_document(&trial).unwrap();

        assert!(!doc.contains_key("_id"));
        assert!(!doc.contains_key("worker"));
        assert_eq!(doc["status"], json!("new"));

        let back: Trial = from_document(doc).unwrap();
        assert_eq!(back, trial);
    }

    #[test]
    fn test_patch_document_matches_in_memory_apply() {
        let mut trial = Trial::new("exp", params(1.0, "tanh"));
        trial.id = "t1".into();
        trial.worker = Some("w1".into());

        let patch = TrialPatch::new()
            .with_status(TrialStatus::Interrupted)
            .clear_worker()
            .with_results(vec![TrialResult::objective("loss", 0.5)]);

        let mut doc = to_document(&trial).unwrap();
        merge_patch(&mut doc, &patch.to_document());
        let via_document: Trial = from_document(doc).unwrap();

        patch.apply_to(&mut trial);
        assert_eq!(via_document, trial);
        assert_eq!(trial.worker, None);
        assert_eq!(trial.objective_value(), Some(0.5));
    }

    #[test]
    fn test_result_type_serializes_lowercase() {
        let r = TrialResult::new("lie", ResultType::Lie, 1.0);
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            json!({"name": "lie", "type": "lie", "value": 1.0})
        );
    }
}
