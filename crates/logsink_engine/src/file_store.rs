//! Log-structured document store on local files.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{StoreError, StoreResult};
use crate::store::{DocumentStore, UpsertOutcome};
use logsink_model::{DocumentKey, PersistedDocument};
use logsink_storage::{sync_directory, RecordFile, StorageError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

const COLLECTION_EXTENSION: &str = "docs";

/// What a compaction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Collection compacted.
    pub collection: String,
    /// Frames in the log before compaction.
    pub frames_before: usize,
    /// Live documents kept.
    pub documents: usize,
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction.
    pub bytes_after: u64,
}

/// A document store keeping one append-only log per collection.
///
/// ```text
/// <dir>/
/// ├─ messages.docs
/// └─ audit.docs
/// ```
///
/// Every upsert appends the whole document; on open the logs are replayed
/// into an in-memory index where the last write of a key wins.
/// [`compact`](Self::compact) rewrites a log down to its live documents.
#[derive(Debug)]
pub struct FileDocumentStore {
    dir: PathBuf,
    sync_writes: bool,
    collections: RwLock<HashMap<String, Collection>>,
}

#[derive(Debug)]
struct Collection {
    log: RecordFile,
    documents: BTreeMap<DocumentKey, PersistedDocument>,
    frames: usize,
}

impl Collection {
    fn load(path: &Path) -> StoreResult<Self> {
        let log = RecordFile::open(path)?;
        if log.recovered_bytes() > 0 {
            tracing::warn!(
                path = %path.display(),
                bytes = log.recovered_bytes(),
                "discarded unfinished document at log tail"
            );
        }

        let mut documents = BTreeMap::new();
        let scan = log.scan_from(0)?;
        let frames = scan.frames.len();
        for frame in scan.frames {
            let doc: PersistedDocument = from_cbor(&frame.payload).map_err(StoreError::Encoding)?;
            documents.insert(doc.key.clone(), doc);
        }

        Ok(Self {
            log,
            documents,
            frames,
        })
    }
}

impl FileDocumentStore {
    /// Opens the store directory and replays every collection in it.
    ///
    /// With `sync_writes` each upsert is fsynced before it is acknowledged.
    /// Without it, acknowledged documents can be lost in an OS crash even
    /// after their offsets are committed.
    pub fn open(dir: &Path, sync_writes: bool) -> StoreResult<Self> {
        fs::create_dir_all(dir).map_err(StorageError::from)?;

        let mut collections = HashMap::new();
        for entry in fs::read_dir(dir).map_err(StorageError::from)? {
            let path = entry.map_err(StorageError::from)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(COLLECTION_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let collection = Collection::load(&path)?;
            tracing::debug!(
                collection = name,
                documents = collection.documents.len(),
                "loaded collection"
            );
            collections.insert(name.to_owned(), collection);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            sync_writes,
            collections: RwLock::new(collections),
        })
    }

    /// Names of the existing collections, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Rewrites the log of `collection` so it holds each live document once.
    pub fn compact(&self, collection: &str) -> StoreResult<CompactionReport> {
        let mut collections = self.collections.write();
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::Rejected(format!("unknown collection `{collection}`")))?;

        let bytes_before = entry.log.len();
        let frames_before = entry.frames;
        let payloads = entry
            .documents
            .values()
            .map(|doc| to_cbor(doc).map_err(StoreError::Encoding))
            .collect::<StoreResult<Vec<_>>>()?;
        entry.log.rewrite(payloads.iter().map(Vec::as_slice))?;
        entry.frames = payloads.len();

        Ok(CompactionReport {
            collection: collection.to_owned(),
            frames_before,
            documents: payloads.len(),
            bytes_before,
            bytes_after: entry.log.len(),
        })
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.{COLLECTION_EXTENSION}"))
    }

    fn create_collection<'a>(
        &self,
        collections: &'a mut HashMap<String, Collection>,
        collection: &str,
    ) -> StoreResult<&'a mut Collection> {
        validate_name(collection)?;
        if !collections.contains_key(collection) {
            let loaded = Collection::load(&self.collection_path(collection))?;
            sync_directory(&self.dir)?;
            collections.insert(collection.to_owned(), loaded);
        }
        collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::Other {
                code: None,
                message: format!("collection `{collection}` vanished"),
            })
    }
}

fn validate_name(collection: &str) -> StoreResult<()> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!(
            "invalid collection name `{collection}`"
        )))
    }
}

impl DocumentStore for FileDocumentStore {
    fn ensure_collection(&self, collection: &str) -> StoreResult<()> {
        if self.collections.read().contains_key(collection) {
            return Ok(());
        }
        let mut collections = self.collections.write();
        self.create_collection(&mut collections, collection)?;
        Ok(())
    }

    fn upsert(&self, collection: &str, document: &PersistedDocument) -> StoreResult<UpsertOutcome> {
        let payload = to_cbor(document).map_err(StoreError::Encoding)?;

        let mut collections = self.collections.write();
        let entry = self.create_collection(&mut collections, collection)?;
        entry.log.append(&payload)?;
        if self.sync_writes {
            entry.log.sync()?;
        }
        entry.frames += 1;

        Ok(
            match entry.documents.insert(document.key.clone(), document.clone()) {
                Some(_) => UpsertOutcome::Replaced,
                None => UpsertOutcome::Inserted,
            },
        )
    }

    fn get(&self, collection: &str, key: &DocumentKey) -> StoreResult<Option<PersistedDocument>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.documents.get(key))
            .cloned())
    }

    fn count(&self, collection: &str) -> StoreResult<usize> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map_or(0, |c| c.documents.len()))
    }

    fn documents(&self, collection: &str) -> StoreResult<Vec<PersistedDocument>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.documents.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::seed_collection;
    use chrono::{TimeZone, Utc};
    use logsink_model::{DecodedEvent, KeyStrategy, PartitionId, SourcePosition};
    use tempfile::tempdir;

    fn doc(id: i64, name: &str, offset: u64) -> PersistedDocument {
        let event = DecodedEvent::new(id, name, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        PersistedDocument::from_event(
            &event,
            SourcePosition::new(PartitionId(0), offset),
            KeyStrategy::EventId,
        )
    }

    #[test]
    fn documents_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileDocumentStore::open(dir.path(), true).unwrap();
            store.upsert("messages", &doc(1, "alpha", 0)).unwrap();
            store.upsert("messages", &doc(3, "gamma", 2)).unwrap();
        }

        let store = FileDocumentStore::open(dir.path(), true).unwrap();
        assert_eq!(store.collections(), vec!["messages".to_owned()]);
        assert_eq!(store.count("messages").unwrap(), 2);
        let ids: Vec<i64> = store
            .documents("messages")
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn last_write_wins_after_replay() {
        let dir = tempdir().unwrap();
        {
            let store = FileDocumentStore::open(dir.path(), false).unwrap();
            assert_eq!(
                store.upsert("messages", &doc(1, "alpha", 0)).unwrap(),
                UpsertOutcome::Inserted
            );
            assert_eq!(
                store.upsert("messages", &doc(1, "delta", 5)).unwrap(),
                UpsertOutcome::Replaced
            );
        }

        let store = FileDocumentStore::open(dir.path(), false).unwrap();
        let stored = store
            .get("messages", &DocumentKey::new("event-1"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "delta");
        assert_eq!(store.count("messages").unwrap(), 1);
    }

    #[test]
    fn compaction_keeps_live_documents() {
        let dir = tempdir().unwrap();
        let store = FileDocumentStore::open(dir.path(), true).unwrap();
        for offset in 0..10 {
            store.upsert("messages", &doc(1, "alpha", offset)).unwrap();
        }
        store.upsert("messages", &doc(2, "beta", 10)).unwrap();

        let report = store.compact("messages").unwrap();
        assert_eq!(report.frames_before, 11);
        assert_eq!(report.documents, 2);
        assert!(report.bytes_after < report.bytes_before);

        store.upsert("messages", &doc(3, "gamma", 11)).unwrap();
        drop(store);

        let store = FileDocumentStore::open(dir.path(), true).unwrap();
        assert_eq!(store.count("messages").unwrap(), 3);
        let stored = store
            .get("messages", &DocumentKey::new("event-1"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.source, Some(SourcePosition::new(PartitionId(0), 9)));
    }

    #[test]
    fn unknown_collection_cannot_be_compacted() {
        let dir = tempdir().unwrap();
        let store = FileDocumentStore::open(dir.path(), true).unwrap();
        assert!(matches!(
            store.compact("nothing"),
            Err(StoreError::Rejected(_))
        ));
    }

    #[test]
    fn invalid_collection_names_are_rejected() {
        let dir = tempdir().unwrap();
        let store = FileDocumentStore::open(dir.path(), true).unwrap();
        for name in ["", "../escape", "a b", "x.docs"] {
            assert!(matches!(
                store.upsert(name, &doc(1, "alpha", 0)),
                Err(StoreError::Rejected(_))
            ));
        }
    }

    #[test]
    fn seeding_a_file_store() {
        let dir = tempdir().unwrap();
        let store = FileDocumentStore::open(dir.path(), true).unwrap();
        assert!(seed_collection(&store, "messages").unwrap());
        assert!(dir.path().join("messages.docs").exists());
        drop(store);

        let store = FileDocumentStore::open(dir.path(), true).unwrap();
        assert!(!seed_collection(&store, "messages").unwrap());
        assert_eq!(store.count("messages").unwrap(), 1);
    }
}
