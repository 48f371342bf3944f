//! Store interface and the in-memory implementation.
//!
//! The pipeline only needs three operations from a backing store: acquire a
//! handle, upsert a document by selector, and remove every document matching
//! a selector. `MemoryStore` keeps collections in memory and can persist
//! them as a JSON snapshot between runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{merge_document, Document, Selector};

/// Names of the three logical collections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectionNames {
    /// Confirmed beacon records, keyed by pair.
    pub beacon: String,
    /// Plain unique-connection summaries, keyed by pair.
    pub connection: String,
    /// Host rollups, keyed by host.
    pub host: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            beacon: "beacon".to_string(),
            connection: "uconn".to_string(),
            host: "host".to_string(),
        }
    }
}

/// A backing store that hands out handles.
#[async_trait]
pub trait Store: Send + Sync {
    /// Acquires a handle. Dropping the handle releases it.
    async fn acquire(&self) -> Result<Box<dyn StoreHandle>, StoreError>;
}

/// A connection to a store.
#[async_trait]
pub trait StoreHandle: Send {
    /// Inserts `document` if nothing matches `selector`, else merges it into
    /// the existing record.
    async fn upsert(
        &mut self,
        collection: &str,
        selector: &Selector,
        document: &Document,
    ) -> Result<(), StoreError>;

    /// Deletes every record matching `selector`. Returns how many were
    /// removed; no match is not an error.
    async fn remove_all(&mut self, collection: &str, selector: &Selector)
        -> Result<u64, StoreError>;

    /// Reads a whole collection, ordered by selector.
    async fn find_all(&mut self, collection: &str) -> Result<Vec<(Selector, Document)>, StoreError>;
}

type Collections = HashMap<String, BTreeMap<Selector, Document>>;

#[derive(Default)]
struct Inner {
    collections: RwLock<Collections>,
    open_handles: AtomicUsize,
    handles_acquired: AtomicU64,
    writes: AtomicU64,
    write_delay: std::sync::RwLock<Option<Duration>>,
    failing: std::sync::RwLock<HashSet<String>>,
}

/// In-memory store with optional JSON snapshot persistence.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

/// On-disk snapshot layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    collections: BTreeMap<String, Vec<StoredRecord>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    selector: Selector,
    document: Document,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot from `path`, or starts empty if the file is missing.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let store = Self::new();
        if !tokio::fs::try_exists(path).await? {
            info!("No store snapshot at {}, starting empty", path.display());
            return Ok(store);
        }

        let raw = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        let mut collections = store.inner.collections.write().await;
        let mut total = 0;
        for (name, records) in snapshot.collections {
            total += records.len();
            let collection = collections.entry(name).or_default();
            for record in records {
                collection.insert(record.selector, record.document);
            }
        }
        drop(collections);

        info!("Loaded {} records from {}", total, path.display());
        Ok(store)
    }

    /// Writes a snapshot of every collection to `path`.
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let collections = self.inner.collections.read().await;
        let snapshot = Snapshot {
            collections: collections
                .iter()
                .map(|(name, records)| {
                    let records = records
                        .iter()
                        .map(|(selector, document)| StoredRecord {
                            selector: selector.clone(),
                            document: document.clone(),
                        })
                        .collect();
                    (name.clone(), records)
                })
                .collect(),
        };
        drop(collections);

        let raw = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(path, raw).await?;
        debug!("Saved store snapshot to {}", path.display());
        Ok(())
    }

    /// Returns the record matching `selector`, if any.
    pub async fn get(&self, collection: &str, selector: &Selector) -> Option<Document> {
        self.inner
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|records| records.get(selector))
            .cloned()
    }

    /// Number of records in `collection`.
    pub async fn len(&self, collection: &str) -> usize {
        self.inner
            .collections
            .read()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Handles currently held.
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    /// Handles acquired over the store's lifetime.
    pub fn handles_acquired(&self) -> u64 {
        self.inner.handles_acquired.load(Ordering::SeqCst)
    }

    /// Upserts and removals applied so far.
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Delays every write by `delay`, simulating a slow backend.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.inner.write_delay.write() {
            *slot = delay;
        }
    }

    /// Makes every write to `collection` fail.
    pub fn fail_collection(&self, collection: &str) {
        if let Ok(mut failing) = self.inner.failing.write() {
            failing.insert(collection.to_string());
        }
    }

    fn write_delay(&self) -> Option<Duration> {
        self.inner.write_delay.read().ok().and_then(|slot| *slot)
    }

    fn check_failing(&self, collection: &str) -> Result<(), StoreError> {
        let failing = self
            .inner
            .failing
            .read()
            .map(|set| set.contains(collection))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::WriteFailed {
                collection: collection.to_string(),
                reason: "collection is marked as failing".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn acquire(&self) -> Result<Box<dyn StoreHandle>, StoreError> {
        self.inner.open_handles.fetch_add(1, Ordering::SeqCst);
        self.inner.handles_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryHandle {
            store: self.clone(),
        }))
    }
}

/// Handle onto a `MemoryStore`.
pub struct MemoryHandle {
    store: MemoryStore,
}

impl MemoryHandle {
    async fn before_write(&self, collection: &str) -> Result<(), StoreError> {
        if let Some(delay) = self.store.write_delay() {
            tokio::time::sleep(delay).await;
        }
        self.store.check_failing(collection)
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.store.inner.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    async fn upsert(
        &mut self,
        collection: &str,
        selector: &Selector,
        document: &Document,
    ) -> Result<(), StoreError> {
        self.before_write(collection).await?;

        let mut collections = self.store.inner.collections.write().await;
        let record = collections
            .entry(collection.to_string())
            .or_default()
            .entry(selector.clone())
            .or_default();
        merge_document(record, document);
        self.store.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_all(
        &mut self,
        collection: &str,
        selector: &Selector,
    ) -> Result<u64, StoreError> {
        self.before_write(collection).await?;

        let mut collections = self.store.inner.collections.write().await;
        let removed = collections
            .get_mut(collection)
            .and_then(|records| records.remove(selector))
            .map_or(0, |_| 1);
        self.store.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(removed)
    }

    async fn find_all(&mut self, collection: &str) -> Result<Vec<(Selector, Document)>, StoreError> {
        let collections = self.store.inner.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .map(|(selector, document)| (selector.clone(), document.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PairKey;
    use serde_json::json;

    fn pair() -> Selector {
        Selector::Pair(PairKey::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ))
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_merges() {
        let store = MemoryStore::new();
        let mut handle = store.acquire().await.unwrap();

        handle
            .upsert("beacon", &pair(), &doc(json!({"score": 0.5, "src": "10.0.0.1"})))
            .await
            .unwrap();
        handle
            .upsert("beacon", &pair(), &doc(json!({"score": 0.9})))
            .await
            .unwrap();

        let stored = store.get("beacon", &pair()).await.unwrap();
        assert_eq!(stored, doc(json!({"score": 0.9, "src": "10.0.0.1"})));
        assert_eq!(store.len("beacon").await, 1);
    }

    #[tokio::test]
    async fn test_remove_all_without_match_is_ok() {
        let store = MemoryStore::new();
        let mut handle = store.acquire().await.unwrap();

        assert_eq!(handle.remove_all("beacon", &pair()).await.unwrap(), 0);

        handle.upsert("beacon", &pair(), &Document::new()).await.unwrap();
        assert_eq!(handle.remove_all("beacon", &pair()).await.unwrap(), 1);
        assert!(store.get("beacon", &pair()).await.is_none());
    }

    #[tokio::test]
    async fn test_handles_are_released_on_drop() {
        let store = MemoryStore::new();
        let first = store.acquire().await.unwrap();
        let second = store.acquire().await.unwrap();
        assert_eq!(store.open_handles(), 2);

        drop(first);
        drop(second);
        assert_eq!(store.open_handles(), 0);
        assert_eq!(store.handles_acquired(), 2);
    }

    #[tokio::test]
    async fn test_failing_collection_rejects_writes() {
        let store = MemoryStore::new();
        store.fail_collection("host");
        let mut handle = store.acquire().await.unwrap();

        let err = handle
            .upsert("host", &Selector::Host("10.0.0.1".parse().unwrap()), &Document::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::WriteFailed { ref collection, .. } if collection == "host"));
        assert!(handle.upsert("beacon", &pair(), &Document::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::new();
        {
            let mut handle = store.acquire().await.unwrap();
            handle
                .upsert("uconn", &pair(), &doc(json!({"connection_count": 2})))
                .await
                .unwrap();
        }
        store.save(&path).await.unwrap();

        let reloaded = MemoryStore::load(&path).await.unwrap();
        assert_eq!(
            reloaded.get("uconn", &pair()).await,
            Some(doc(json!({"connection_count": 2})))
        );
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::load(&dir.path().join("absent.json")).await.unwrap();

        assert_eq!(store.len("beacon").await, 0);
    }
}
