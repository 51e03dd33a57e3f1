use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::document::{get_path, Document, Filter, IndexSpec, Projection, Update, Value, WriteResult};
use crate::errors::{SessionError, SessionResult};
use crate::store::DocumentStore;

/// Per-operation call counters, for asserting how many round trips a code path made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub find_one: usize,
    pub find: usize,
    pub update: usize,
    pub remove: usize,
    pub ensure_index: usize,
}

#[derive(Debug, Default)]
struct Counters {
    find_one: AtomicUsize,
    find: AtomicUsize,
    update: AtomicUsize,
    remove: AtomicUsize,
    ensure_index: AtomicUsize,
}

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    /// Check `candidate` against every unique index, ignoring the document at `skip`.
    fn check_unique(&self, candidate: &Document, skip: Option<usize>) -> SessionResult<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = index_key(index, candidate);
            let Some(key) = key else { continue };
            let clash = self
                .documents
                .iter()
                .enumerate()
                .filter(|(pos, _)| Some(*pos) != skip)
                .any(|(_, other)| index_key(index, other).as_ref() == Some(&key));
            if clash {
                return Err(SessionError::DuplicateKey {
                    index: index.name(),
                    key: key.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                });
            }
        }
        Ok(())
    }
}

/// Key tuple of a document under an index. Sparse indexes skip documents
/// missing every key field; non-sparse ones treat missing fields as null.
fn index_key(index: &IndexSpec, doc: &Document) -> Option<Vec<Value>> {
    let values: Vec<Option<&Value>> = index.keys.iter().map(|k| get_path(doc, k)).collect();
    if index.sparse && values.iter().all(Option::is_none) {
        return None;
    }
    Some(
        values
            .into_iter()
            .map(|v| v.cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

/// In-process implementation of DocumentStore
///
/// Behaves like a single shared collection: several session managers (or
/// simulated nodes) can hold clones of the same `Arc` and observe each
/// other's writes.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    /// Thread-safe storage of documents and index definitions
    collection: Arc<RwLock<Collection>>,
    counters: Counters,
    unavailable: AtomicBool,
}

impl InMemoryDocumentStore {
    /// Create a new, empty InMemoryDocumentStore
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> CallStats {
        CallStats {
            find_one: self.counters.find_one.load(Ordering::SeqCst),
            find: self.counters.find.load(Ordering::SeqCst),
            update: self.counters.update.load(Ordering::SeqCst),
            remove: self.counters.remove.load(Ordering::SeqCst),
            ensure_index: self.counters.ensure_index.load(Ordering::SeqCst),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.find_one.store(0, Ordering::SeqCst);
        self.counters.find.store(0, Ordering::SeqCst);
        self.counters.update.store(0, Ordering::SeqCst);
        self.counters.remove.store(0, Ordering::SeqCst);
        self.counters.ensure_index.store(0, Ordering::SeqCst);
    }

    /// Simulate a transport outage: while set, every call fails with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert a raw document, honouring unique indexes.
    pub fn insert(&self, document: Document) -> SessionResult<()> {
        let mut collection = self.write_lock()?;
        collection.check_unique(&document, None)?;
        collection.documents.push(document);
        Ok(())
    }

    /// Snapshot of every stored document.
    pub fn documents(&self) -> SessionResult<Vec<Document>> {
        Ok(self.read_lock()?.documents.clone())
    }

    pub fn indexes(&self) -> SessionResult<Vec<IndexSpec>> {
        Ok(self.read_lock()?.indexes.clone())
    }

    fn check_available(&self) -> SessionResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SessionError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn read_lock(&self) -> SessionResult<std::sync::RwLockReadGuard<'_, Collection>> {
        self.collection.read().map_err(|e| {
            SessionError::StoreUnavailable(format!("Failed to acquire read lock: {}", e))
        })
    }

    fn write_lock(&self) -> SessionResult<std::sync::RwLockWriteGuard<'_, Collection>> {
        self.collection.write().map_err(|e| {
            SessionError::StoreUnavailable(format!("Failed to acquire write lock: {}", e))
        })
    }
}

fn project(doc: &Document, projection: Option<&Projection>) -> Document {
    match projection {
        Some(p) => p.apply(doc),
        None => doc.clone(),
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find_one(
        &self,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> SessionResult<Option<Document>> {
        self.counters.find_one.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let collection = self.read_lock()?;
        Ok(collection
            .documents
            .iter()
            .find(|doc| filter.matches(doc))
            .map(|doc| project(doc, projection)))
    }

    async fn find(
        &self,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> SessionResult<Vec<Document>> {
        self.counters.find.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let collection = self.read_lock()?;
        let found: Vec<Document> = collection
            .documents
            .iter()
            .filter(|doc| filter.matches(doc))
            .map(|doc| project(doc, projection))
            .collect();

        debug!("find {} matched {} documents", filter, found.len());
        Ok(found)
    }

    async fn update(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
        multi: bool,
    ) -> SessionResult<WriteResult> {
        self.counters.update.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut collection = self.write_lock()?;
        let positions: Vec<usize> = collection
            .documents
            .iter()
            .enumerate()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(pos, _)| pos)
            .take(if multi { usize::MAX } else { 1 })
            .collect();

        if positions.is_empty() {
            if !upsert {
                return Ok(WriteResult::default());
            }
            let mut created = filter.seed_document();
            update.apply_on_insert(&mut created);
            collection.check_unique(&created, None)?;
            collection.documents.push(created);
            debug!("update {} upserted a new document", filter);
            return Ok(WriteResult {
                matched: 0,
                modified: 0,
                upserted: true,
            });
        }

        // Validate every change before touching anything.
        let mut staged = Vec::with_capacity(positions.len());
        for pos in &positions {
            let mut changed = collection.documents[*pos].clone();
            update.apply(&mut changed);
            collection.check_unique(&changed, Some(*pos))?;
            staged.push((*pos, changed));
        }

        let mut result = WriteResult {
            matched: positions.len(),
            ..WriteResult::default()
        };
        for (pos, changed) in staged {
            if collection.documents[pos] != changed {
                collection.documents[pos] = changed;
                result.modified += 1;
            }
        }
        Ok(result)
    }

    async fn remove(&self, filter: &Filter) -> SessionResult<usize> {
        self.counters.remove.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut collection = self.write_lock()?;
        let before = collection.documents.len();
        collection.documents.retain(|doc| !filter.matches(doc));
        let removed = before - collection.documents.len();

        debug!("remove {} deleted {} documents", filter, removed);
        Ok(removed)
    }

    async fn ensure_index(&self, index: &IndexSpec) -> SessionResult<()> {
        self.counters.ensure_index.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut collection = self.write_lock()?;
        if collection.indexes.iter().any(|existing| existing == index) {
            return Ok(());
        }
        collection.indexes.push(index.clone());
        debug!("Created index {}", index.name());
        Ok(())
    }
}
