//! Result artifact parsing.
//!
//! An artifact is a JSON array of `{"name", "type", "value"}` records, with
//! `type` one of `objective`, `constraint`, `statistic`, `gradient`, `lie`.
//! Parsing is all-or-nothing: any bad record rejects the whole artifact.

use std::path::Path;

use serde_json::Value;

use crate::domain::errors::{StorageError, StorageResult};
use crate::domain::models::{ResultType, Trial, TrialResult};

/// Parse artifact bytes into a result set.
pub fn parse_results(bytes: &[u8]) -> StorageResult<Vec<TrialResult>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(StorageError::MalformedResult("artifact is empty".to_string()));
    }

    let records: Vec<Value> = match serde_json::from_slice(bytes) {
        Ok(Value::Array(records)) => records,
        Ok(other) => {
            return Err(StorageError::MalformedResult(format!(
                "expected a list of results, got {}",
                json_kind(&other)
            )))
        }
        Err(e) => return Err(StorageError::MalformedResult(e.to_string())),
    };

    let mut results = Vec::with_capacity(records.len());
    for (position, record) in records.into_iter().enumerate() {
        let result: TrialResult = serde_json::from_value(record).map_err(|e| {
            StorageError::MalformedResult(format!("result #{position}: {e}"))
        })?;
        if result.name.is_empty() {
            return Err(StorageError::MalformedResult(format!(
                "result #{position}: name is empty"
            )));
        }
        if result.result_type == ResultType::Objective && !result.value.is_number() {
            return Err(StorageError::MalformedResult(format!(
                "result #{position}: objective '{}' is not numeric",
                result.name
            )));
        }
        results.push(result);
    }

    let objectives = results
        .iter()
        .filter(|r| r.result_type == ResultType::Objective)
        .count();
    if objectives > 1 {
        return Err(StorageError::MalformedResult(format!(
            "{objectives} objectives reported, at most one allowed"
        )));
    }

    Ok(results)
}

/// Read and parse the artifact at `path`.
pub async fn read_artifact(path: &Path) -> StorageResult<Vec<TrialResult>> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        StorageError::MalformedResult(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_results(&bytes)
}

/// Copy of `trial` whose result set is replaced by the artifact's.
pub async fn retrieve_result(trial: &Trial, path: &Path) -> StorageResult<Trial> {
    let results = read_artifact(path).await?;
    tracing::debug!(
        trial_id = %trial.id,
        results = results.len(),
        artifact = %path.display(),
        "parsed result artifact"
    );
    let mut updated = trial.clone();
    updated.results = results;
    Ok(updated)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
