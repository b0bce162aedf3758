//! In-process document store.
//!
//! A single `RwLock` guards all collections, so every write is atomic with
//! respect to every other call on the same handle. State is lost when the
//! last handle is dropped.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{StorageError, StorageResult};
use crate::domain::models::document::{lookup, merge_patch, project};
use crate::domain::models::query::values_equal;
use crate::domain::models::{Document, Query, ID_FIELD};
use crate::domain::ports::{DocumentStore, WriteOutcome};

#[derive(Debug)]
struct Index {
    fields: Vec<String>,
    unique: bool,
}

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<Index>,
}

impl Collection {
    /// Values of a unique index for `doc`; `None` when any field is missing,
    /// since such documents never collide.
    fn key(index: &Index, doc: &Document) -> Option<Vec<Value>> {
        index
            .fields
            .iter()
            .map(|f| lookup(doc, f).filter(|v| !v.is_null()).cloned())
            .collect()
    }

    /// Check `candidate` against every unique index over `documents`,
    /// ignoring the document at position `skip`.
    fn check_unique(
        indexes: &[Index],
        name: &str,
        documents: &[Document],
        candidate: &Document,
        skip: Option<usize>,
    ) -> StorageResult<()> {
        for index in indexes.iter().filter(|i| i.unique) {
            let Some(key) = Self::key(index, candidate) else {
                continue;
            };
            let collides = documents
                .iter()
                .enumerate()
                .filter(|(pos, _)| Some(*pos) != skip)
                .any(|(_, doc)| {
                    Self::key(index, doc).is_some_and(|other| {
                        other.iter().zip(&key).all(|(a, b)| values_equal(a, b))
                    })
                });
            if collides {
                return Err(StorageError::DuplicateKey {
                    collection: name.to_string(),
                    index: index.fields.join(", "),
                });
            }
        }
        Ok(())
    }

    fn matching(&self, query: &Query) -> Vec<usize> {
        let mut positions: Vec<usize> = self
            .documents
            .iter()
            .enumerate()
            .filter(|(_, doc)| query.matches(doc))
            .map(|(pos, _)| pos)
            .collect();
        positions.sort_by(|a, b| query.compare(&self.documents[*a], &self.documents[*b]));
        if let Some(limit) = query.limit {
            positions.truncate(limit);
        }
        positions
    }
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn ensure_index(
        &self,
        collection: &str,
        fields: &[&str],
        unique: bool,
    ) -> StorageResult<()> {
        if fields.is_empty() {
            return Err(StorageError::Validation(
                "an index needs at least one field".to_string(),
            ));
        }
        let mut collections = self.collections.write().await;
        let coll = collections.entry(collection.to_string()).or_default();

        let fields: Vec<String> = fields.iter().map(ToString::to_string).collect();
        if coll.indexes.iter().any(|i| i.fields == fields) {
            return Ok(());
        }
        let index = Index { fields, unique };
        if unique {
            let single = std::slice::from_ref(&index);
            for (pos, doc) in coll.documents.iter().enumerate() {
                Collection::check_unique(single, collection, &coll.documents[..pos], doc, None)?;
            }
        }
        coll.indexes.push(index);
        Ok(())
    }

    async fn write(
        &self,
        collection: &str,
        mut data: Document,
        query: Option<&Query>,
    ) -> StorageResult<WriteOutcome> {
        let mut collections = self.collections.write().await;
        let coll = collections.entry(collection.to_string()).or_default();

        let Some(query) = query else {
            let id = Uuid::new_v4().to_string();
            data.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            Collection::check_unique(&coll.indexes, collection, &coll.documents, &data, None)?;
            coll.documents.push(data);
            return Ok(WriteOutcome::Inserted(id));
        };

        data.remove(ID_FIELD);
        let positions = coll.matching(&query.filters_only());

        // Work on a copy so a uniqueness failure leaves nothing applied.
        let mut working = coll.documents.clone();
        for &pos in &positions {
            let mut updated = working[pos].clone();
            merge_patch(&mut updated, &data);
            Collection::check_unique(&coll.indexes, collection, &working, &updated, Some(pos))?;
            working[pos] = updated;
        }
        coll.documents = working;
        let count = positions.len() as u64;
        Ok(WriteOutcome::Updated(count))
    }

    async fn read(
        &self,
        collection: &str,
        query: &Query,
        selection: Option<&[&str]>,
    ) -> StorageResult<Vec<Document>> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        Ok(coll
            .matching(query)
            .into_iter()
            .map(|pos| {
                let doc = coll.documents[pos].clone();
                match selection {
                    Some(fields) => project(doc, fields),
                    None => doc,
                }
            })
            .collect())
    }

    async fn read_and_write(
        &self,
        collection: &str,
        query: &Query,
        mut data: Document,
    ) -> StorageResult<Option<Document>> {
        let mut collections = self.collections.write().await;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(None);
        };

        let Some(pos) = coll.matching(&query.clone().limit(1)).first().copied() else {
            return Ok(None);
        };
        data.remove(ID_FIELD);
        let mut updated = coll.documents[pos].clone();
        merge_patch(&mut updated, &data);
        Collection::check_unique(&coll.indexes, collection, &coll.documents, &updated, Some(pos))?;
        coll.documents[pos] = updated.clone();
        Ok(Some(updated))
    }

    async fn count(&self, collection: &str, query: &Query) -> StorageResult<u64> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map_or(0, |coll| {
            coll.documents.iter().filter(|d| query.matches(d)).count() as u64
        }))
    }
}
