use async_trait::async_trait;

use crate::domain::errors::StorageResult;
use crate::domain::models::{Document, Query};

/// Result of a [`DocumentStore::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Insert succeeded; carries the assigned id
    Inserted(String),
    /// Conditional update; carries the number of matched records
    Updated(u64),
}

impl WriteOutcome {
    /// Whether the write touched at least one record.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Inserted(_) => true,
            Self::Updated(n) => *n > 0,
        }
    }
}

/// Query-able persistence primitive behind the legacy backend.
///
/// Implementations must make every single-document write atomic and offer
/// read-your-writes per handle. Uniqueness violations surface as
/// [`StorageError::DuplicateKey`](crate::domain::StorageError::DuplicateKey).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create an index over the dotted field paths. Idempotent.
    async fn ensure_index(
        &self,
        collection: &str,
        fields: &[&str],
        unique: bool,
    ) -> StorageResult<()>;

    /// Insert `data` when `query` is `None`; otherwise merge-patch every
    /// record matching `query` with `data`.
    ///
    /// Inserted records get a fresh `_id`, replacing any given one.
    async fn write(
        &self,
        collection: &str,
        data: Document,
        query: Option<&Query>,
    ) -> StorageResult<WriteOutcome>;

    /// Records matching `query`, in its sort order, limited by its limit.
    ///
    /// `selection` keeps only the named top-level fields plus `_id`.
    async fn read(
        &self,
        collection: &str,
        query: &Query,
        selection: Option<&[&str]>,
    ) -> StorageResult<Vec<Document>>;

    /// Atomically merge-patch the first record matching `query` and return it
    /// as it is after the write. `None` when nothing matched.
    async fn read_and_write(
        &self,
        collection: &str,
        query: &Query,
        data: Document,
    ) -> StorageResult<Option<Document>>;

    /// Number of records matching `query`.
    async fn count(&self, collection: &str, query: &Query) -> StorageResult<u64>;
}
