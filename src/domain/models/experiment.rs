//! Experiment domain model.
//!
//! An experiment is one search-space and algorithm configuration, owned by a
//! user and versioned per `(name, user)`. Its trial history lives in the
//! trials collection, keyed by the experiment id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::document::{replacement_patch, Document};
use super::timestamp;

/// Whether lower or higher objective values are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Minimize,
    Maximize,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Minimize
    }
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "minimize" | "min" => Some(Self::Minimize),
            "maximize" | "max" => Some(Self::Maximize),
            _ => None,
        }
    }

    /// Whether `candidate` improves on `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Minimize => candidate < incumbent,
            Self::Maximize => candidate > incumbent,
        }
    }
}

/// Ownership and creation details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub user: String,
    #[serde(with = "timestamp")]
    pub datetime: DateTime<Utc>,
}

/// A search experiment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Store-assigned identifier; empty until created
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub metadata: ExperimentMetadata,
    /// Parameter name to prior definition, e.g. `x: uniform(0, 1)`
    #[serde(default)]
    pub space: BTreeMap<String, String>,
    /// Opaque algorithm configuration
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub algorithms: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_trials: Option<u64>,
    #[serde(default)]
    pub direction: Direction,
    /// Set when the first trial is registered; the space is frozen from then on
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub space_locked: bool,
}

const fn default_version() -> u32 {
    1
}

impl Experiment {
    /// Create an unregistered experiment, version 1.
    pub fn new(name: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            version: default_version(),
            metadata: ExperimentMetadata {
                user: user.into(),
                datetime: timestamp::now(),
            },
            space: BTreeMap::new(),
            algorithms: Value::Null,
            max_trials: None,
            direction: Direction::default(),
            space_locked: false,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_space(mut self, space: BTreeMap<String, String>) -> Self {
        self.space = space;
        self
    }

    pub fn with_dimension(mut self, name: impl Into<String>, prior: impl Into<String>) -> Self {
        self.space.insert(name.into(), prior.into());
        self
    }

    pub fn with_algorithms(mut self, algorithms: Value) -> Self {
        self.algorithms = algorithms;
        self
    }

    pub fn with_max_trials(mut self, max_trials: u64) -> Self {
        self.max_trials = Some(max_trials);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn user(&self) -> &str {
        &self.metadata.user
    }
}

/// Typed partial update of an experiment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentPatch {
    pub max_trials: Option<u64>,
    pub algorithms: Option<Value>,
    pub space: Option<BTreeMap<String, String>>,
    pub direction: Option<Direction>,
}

impl ExperimentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_trials(mut self, max_trials: u64) -> Self {
        self.max_trials = Some(max_trials);
        self
    }

    pub fn with_algorithms(mut self, algorithms: Value) -> Self {
        self.algorithms = Some(algorithms);
        self
    }

    pub fn with_space(mut self, space: BTreeMap<String, String>) -> Self {
        self.space = Some(space);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether applying the patch would change the search space.
    pub fn changes_space(&self, current: &Experiment) -> bool {
        self.space.as_ref().is_some_and(|s| *s != current.space)
    }

    /// Merge-patch document for the set fields.
    ///
    /// The space and the algorithm configuration are replaced wholesale:
    /// keys missing from the new value are nulled out so the merge removes
    /// them.
    pub fn to_document(&self, current: &Experiment) -> Document {
        let mut doc = Map::new();
        if let Some(max_trials) = self.max_trials {
            doc.insert("max_trials".into(), Value::from(max_trials));
        }
        if let Some(algorithms) = &self.algorithms {
            doc.insert(
                "algorithms".into(),
                replacement_patch(&current.algorithms, algorithms),
            );
        }
        if let Some(direction) = self.direction {
            doc.insert("direction".into(), Value::String(direction.as_str().into()));
        }
        if let Some(space) = &self.space {
            let mut encoded: Map<String, Value> = current
                .space
                .keys()
                .map(|k| (k.clone(), Value::Null))
                .collect();
            for (name, prior) in space {
                encoded.insert(name.clone(), Value::String(prior.clone()));
            }
            doc.insert("space".into(), Value::Object(encoded));
        }
        doc
    }
}
