//! SQLite implementation of the DocumentStore.
//!
//! Every collection shares the `documents` table. Filters, sorts and indexes
//! address fields through `json_extract`, and updates are RFC 7396 merges via
//! `json_patch`, so each write is one statement and therefore atomic.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{StorageError, StorageResult};
use crate::domain::models::document::project;
use crate::domain::models::{Document, Matcher, Query, SortOrder, ID_FIELD};
use crate::domain::ports::{DocumentStore, WriteOutcome};

#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    /// Wrap a pool whose schema is already migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn read_rows(&self, collection: &str, query: &Query) -> StorageResult<Vec<Document>> {
        let collection = identifier(collection)?;
        let filter = WhereClause::build(query)?;
        let mut sql = format!(
            "SELECT data FROM documents WHERE collection = '{collection}'{}",
            filter.sql
        );
        sql.push_str(&order_by(query)?);
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut q = sqlx::query_as::<_, (String,)>(&sql);
        for binding in &filter.bindings {
            q = q.bind(binding);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(data,)| serde_json::from_str::<Document>(&data).map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn ensure_index(
        &self,
        collection: &str,
        fields: &[&str],
        unique: bool,
    ) -> StorageResult<()> {
        let collection = identifier(collection)?;
        if fields.is_empty() {
            return Err(StorageError::Validation(
                "an index needs at least one field".to_string(),
            ));
        }

        let mut expressions = Vec::with_capacity(fields.len());
        for field in fields {
            expressions.push(field_expression(field)?);
        }
        let name = format!(
            "idx_{collection}_{}",
            fields.join("_").replace('.', "_")
        );
        let sql = format!(
            "CREATE {}INDEX IF NOT EXISTS {name} ON documents ({}) WHERE collection = '{collection}'",
            if unique { "UNIQUE " } else { "" },
            expressions.join(", ")
        );

        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| unique_violation(collection, e))?;
        tracing::debug!(collection, index = %name, unique, "ensured index");
        Ok(())
    }

    async fn write(
        &self,
        collection: &str,
        mut data: Document,
        query: Option<&Query>,
    ) -> StorageResult<WriteOutcome> {
        let collection = identifier(collection)?;

        let Some(query) = query else {
            let id = Uuid::new_v4().to_string();
            data.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            let body = serde_json::to_string(&data)?;

            sqlx::query("INSERT INTO documents (collection, id, data) VALUES (?, ?, ?)")
                .bind(collection)
                .bind(&id)
                .bind(&body)
                .execute(&self.pool)
                .await
                .map_err(|e| unique_violation(collection, e))?;
            return Ok(WriteOutcome::Inserted(id));
        };

        data.remove(ID_FIELD);
        let patch = serde_json::to_string(&data)?;
        let filter = WhereClause::build(query)?;
        let sql = format!(
            "UPDATE documents SET data = json_patch(data, ?) WHERE collection = '{collection}'{}",
            filter.sql
        );

        let mut q = sqlx::query(&sql).bind(&patch);
        for binding in &filter.bindings {
            q = q.bind(binding);
        }
        let result = q
            .execute(&self.pool)
            .await
            .map_err(|e| unique_violation(collection, e))?;
        Ok(WriteOutcome::Updated(result.rows_affected()))
    }

    async fn read(
        &self,
        collection: &str,
        query: &Query,
        selection: Option<&[&str]>,
    ) -> StorageResult<Vec<Document>> {
        let docs = self.read_rows(collection, query).await?;
        Ok(match selection {
            Some(fields) => docs.into_iter().map(|d| project(d, fields)).collect(),
            None => docs,
        })
    }

    async fn read_and_write(
        &self,
        collection: &str,
        query: &Query,
        mut data: Document,
    ) -> StorageResult<Option<Document>> {
        let collection = identifier(collection)?;
        data.remove(ID_FIELD);
        let patch = serde_json::to_string(&data)?;
        let filter = WhereClause::build(query)?;

        // The subselect runs inside the UPDATE's write transaction, so the
        // candidate cannot change between being chosen and being patched.
        let sql = format!(
            "UPDATE documents SET data = json_patch(data, ?) \
             WHERE collection = '{collection}' AND id = (\
                 SELECT id FROM documents WHERE collection = '{collection}'{}{} LIMIT 1\
             ) RETURNING data",
            filter.sql,
            order_by(query)?
        );

        let mut q = sqlx::query_as::<_, (String,)>(&sql).bind(&patch);
        for binding in &filter.bindings {
            q = q.bind(binding);
        }
        let row = q
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unique_violation(collection, e))?;

        row.map(|(data,)| serde_json::from_str::<Document>(&data).map_err(StorageError::from))
            .transpose()
    }

    async fn count(&self, collection: &str, query: &Query) -> StorageResult<u64> {
        let collection = identifier(collection)?;
        let filter = WhereClause::build(query)?;
        let sql = format!(
            "SELECT COUNT(*) FROM documents WHERE collection = '{collection}'{}",
            filter.sql
        );

        let mut q = sqlx::query_as::<_, (i64,)>(&sql);
        for binding in &filter.bindings {
            q = q.bind(binding);
        }
        let (count,) = q.fetch_one(&self.pool).await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Filter conditions rendered as ` AND ...` terms plus their bindings.
struct WhereClause {
    sql: String,
    bindings: Vec<String>,
}

impl WhereClause {
    fn build(query: &Query) -> StorageResult<Self> {
        let mut sql = String::new();
        let mut bindings = Vec::new();

        for (path, matcher) in &query.filters {
            let expr = field_expression(path)?;
            match matcher {
                Matcher::Eq(Value::Null) => {
                    sql.push_str(&format!(" AND {expr} IS NULL"));
                }
                Matcher::Eq(value) => {
                    sql.push_str(&format!(" AND {expr} = json_extract(?, '$')"));
                    bindings.push(serde_json::to_string(value)?);
                }
                Matcher::In(values) => {
                    sql.push_str(&format!(
                        " AND {expr} IN (SELECT value FROM json_each(?))"
                    ));
                    bindings.push(serde_json::to_string(values)?);
                }
                Matcher::Lt(value) => {
                    sql.push_str(&format!(" AND {expr} < json_extract(?, '$')"));
                    bindings.push(serde_json::to_string(value)?);
                }
                Matcher::Gt(value) => {
                    sql.push_str(&format!(" AND {expr} > json_extract(?, '$')"));
                    bindings.push(serde_json::to_string(value)?);
                }
            }
        }

        Ok(Self { sql, bindings })
    }
}

fn order_by(query: &Query) -> StorageResult<String> {
    Ok(match &query.sort {
        Some(sort) => format!(
            " ORDER BY {} {}, id ASC",
            field_expression(&sort.field)?,
            match sort.order {
                SortOrder::Ascending => "ASC",
                SortOrder::Descending => "DESC",
            }
        ),
        None => " ORDER BY id ASC".to_string(),
    })
}

/// SQL expression addressing a dotted field path.
///
/// Paths are inlined rather than bound so the planner can match them
/// against the expression indexes.
fn field_expression(path: &str) -> StorageResult<String> {
    if path == ID_FIELD {
        return Ok("id".to_string());
    }
    let valid = !path.is_empty()
        && path.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if !valid {
        return Err(StorageError::Validation(format!("invalid field path: {path:?}")));
    }
    Ok(format!("json_extract(data, '$.{path}')"))
}

fn identifier(name: &str) -> StorageResult<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StorageError::Validation(format!("invalid collection name: {name:?}")))
    }
}

fn unique_violation(collection: &str, err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StorageError::DuplicateKey {
            collection: collection.to_string(),
            index: db_err.message().to_string(),
        },
        _ => err.into(),
    }
}
