//! Document store abstraction.

use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use logsink_model::{DocumentKey, PersistedDocument, SEED_EVENT_ID};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Whether an upsert created a document or replaced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No document had the key before.
    Inserted,
    /// An existing document was overwritten.
    Replaced,
}

/// A keyed document store.
///
/// Upserts replace the whole document stored under the key, so applying
/// the same document twice leaves exactly one copy. Implementations report
/// failures through [`StoreError`] variants precise enough to tell
/// transient trouble from permanent rejection.
pub trait DocumentStore: Send + Sync {
    /// Creates `collection` if it does not exist yet.
    fn ensure_collection(&self, collection: &str) -> StoreResult<()>;

    /// Inserts or replaces the document under `document.key`.
    fn upsert(&self, collection: &str, document: &PersistedDocument) -> StoreResult<UpsertOutcome>;

    /// Looks up one document.
    fn get(&self, collection: &str, key: &DocumentKey) -> StoreResult<Option<PersistedDocument>>;

    /// Number of documents in `collection` (0 if it does not exist).
    fn count(&self, collection: &str) -> StoreResult<usize>;

    /// Every document in `collection`, ordered by key.
    fn documents(&self, collection: &str) -> StoreResult<Vec<PersistedDocument>>;
}

impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    fn ensure_collection(&self, collection: &str) -> StoreResult<()> {
        (**self).ensure_collection(collection)
    }

    fn upsert(&self, collection: &str, document: &PersistedDocument) -> StoreResult<UpsertOutcome> {
        (**self).upsert(collection, document)
    }

    fn get(&self, collection: &str, key: &DocumentKey) -> StoreResult<Option<PersistedDocument>> {
        (**self).get(collection, key)
    }

    fn count(&self, collection: &str) -> StoreResult<usize> {
        (**self).count(collection)
    }

    fn documents(&self, collection: &str) -> StoreResult<Vec<PersistedDocument>> {
        (**self).documents(collection)
    }
}

/// Creates `collection` and writes the bootstrap document unless a document
/// with the seed identifier already exists. Returns true if it was written.
pub fn seed_collection<S: DocumentStore + ?Sized>(store: &S, collection: &str) -> StoreResult<bool> {
    store.ensure_collection(collection)?;
    if store
        .documents(collection)?
        .iter()
        .any(|doc| doc.id == SEED_EVENT_ID)
    {
        return Ok(false);
    }

    store.upsert(collection, &PersistedDocument::seed(Utc::now()))?;
    Ok(true)
}

/// An in-memory document store with failure injection.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<DocumentKey, PersistedDocument>>>,
    faults: Mutex<VecDeque<StoreError>>,
    upsert_calls: AtomicU64,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next upserts fail with `errors`, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.faults.lock().extend(errors);
    }

    /// Number of upsert calls made, failed ones included.
    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn ensure_collection(&self, collection: &str) -> StoreResult<()> {
        self.collections
            .write()
            .entry(collection.to_owned())
            .or_default();
        Ok(())
    }

    fn upsert(&self, collection: &str, document: &PersistedDocument) -> StoreResult<UpsertOutcome> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.faults.lock().pop_front() {
            return Err(err);
        }

        let mut collections = self.collections.write();
        let previous = collections
            .entry(collection.to_owned())
            .or_default()
            .insert(document.key.clone(), document.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Replaced,
            None => UpsertOutcome::Inserted,
        })
    }

    fn get(&self, collection: &str, key: &DocumentKey) -> StoreResult<Option<PersistedDocument>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    fn count(&self, collection: &str) -> StoreResult<usize> {
        Ok(self.collections.read().get(collection).map_or(0, BTreeMap::len))
    }

    fn documents(&self, collection: &str) -> StoreResult<Vec<PersistedDocument>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }
}
