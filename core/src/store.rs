use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::document::{Document, Filter, IndexSpec, Projection, Update, WriteResult};
use crate::errors::SessionResult;

/// Contract over a collection-oriented document database.
///
/// Every call is a single round trip. Writes are atomic per document; no call
/// spans several documents transactionally. Implementations map their own
/// transport failures to [`SessionError::StoreUnavailable`](crate::SessionError).
#[async_trait]
pub trait DocumentStore: Send + Sync + Debug {
    /// Return the first document matching `filter`, optionally projected.
    async fn find_one(
        &self,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> SessionResult<Option<Document>>;

    /// Return every document matching `filter`, optionally projected.
    async fn find(
        &self,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> SessionResult<Vec<Document>>;

    /// Apply `update` to the first (or, with `multi`, every) matching document.
    /// With `upsert` and no match, a document seeded from the filter's
    /// equality clauses is inserted and updated.
    async fn update(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
        multi: bool,
    ) -> SessionResult<WriteResult>;

    /// Delete every matching document, returning how many were removed.
    async fn remove(&self, filter: &Filter) -> SessionResult<usize>;

    /// Create the index if it does not exist yet. Safe to call repeatedly.
    async fn ensure_index(&self, index: &IndexSpec) -> SessionResult<()>;
}

/// Type alias for Arc-wrapped DocumentStore trait objects
pub type DocumentStoreRef = Arc<dyn DocumentStore>;
