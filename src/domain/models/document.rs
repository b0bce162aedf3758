//! Raw document representation shared by every document-store adapter.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::domain::errors::{StorageError, StorageResult};

/// A stored record: a JSON object whose `_id` key is the store-assigned id.
pub type Document = Map<String, Value>;

/// Key holding the store-assigned identifier.
pub const ID_FIELD: &str = "_id";

/// Serialize a typed record into a document.
pub fn to_document<T: Serialize>(value: &T) -> StorageResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::Serialization(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Deserialize a document into a typed record.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> StorageResult<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Resolve a dotted field path (`metadata.user`) inside a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Apply an RFC 7396 JSON merge patch in place.
///
/// Objects merge recursively, `null` removes a key, anything else replaces.
pub fn merge_patch(target: &mut Document, patch: &Document) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(inner) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(existing) = slot {
                    merge_patch(existing, inner);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Merge patch that turns `current` into exactly `target`.
///
/// Keys absent from `target` are nulled, changed objects are diffed
/// recursively and every other changed value is replaced. Exact only when
/// `target` has no null object members (see [`has_null_member`]).
pub fn replacement_patch(current: &Value, target: &Value) -> Value {
    let (Value::Object(current), Value::Object(target)) = (current, target) else {
        return target.clone();
    };

    let mut patch: Map<String, Value> = current
        .keys()
        .filter(|key| !target.contains_key(*key))
        .map(|key| (key.clone(), Value::Null))
        .collect();
    for (key, value) in target {
        match current.get(key) {
            Some(existing) if existing == value => {}
            Some(existing) => {
                patch.insert(key.clone(), replacement_patch(existing, value));
            }
            None => {
                patch.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(patch)
}

/// Whether any object member, at any depth, is `null`.
///
/// Merge patches read such members as deletions, so they cannot be stored
/// through an update.
pub fn has_null_member(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.values().any(|v| v.is_null() || has_null_member(v)))
}

/// Keep only `_id` plus the selected top-level fields.
pub fn project(doc: Document, selection: &[&str]) -> Document {
    doc.into_iter()
        .filter(|(key, _)| key == ID_FIELD || selection.contains(&key.as_str()))
        .collect()
}
