//! In-process vector index.
//!
//! Brute-force cosine search over per-namespace record lists. When opened with
//! a snapshot path, the index is written to a JSON snapshot so it survives
//! process restarts: upserts are buffered until [`VectorStore::flush`], clears
//! are written immediately.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::{check_dimensions, ScoredChunk, StoreError, VectorRecord, VectorStore};
use crate::documents::cosine_similarity;

/// One namespace: records in insertion order plus an id lookup.
#[derive(Default)]
struct NamespaceIndex {
    records: Vec<VectorRecord>,
    positions: HashMap<String, usize>,
}

impl NamespaceIndex {
    fn from_records(records: Vec<VectorRecord>) -> Self {
        let positions = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self { records, positions }
    }

    /// Replace in place (keeping the original position) or append.
    fn upsert(&mut self, record: VectorRecord) {
        match self.positions.get(&record.id) {
            Some(&pos) => self.records[pos] = record,
            None => {
                self.positions.insert(record.id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

/// On-disk snapshot format
#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    namespaces: BTreeMap<String, Vec<VectorRecord>>,
}

pub struct MemoryStore {
    dimension: usize,
    namespaces: RwLock<HashMap<String, NamespaceIndex>>,
    snapshot_path: Option<PathBuf>,
    /// Upserts not yet in the snapshot
    dirty: AtomicBool,
    /// Serializes snapshot writes so an older image never overwrites a newer one
    persist_lock: tokio::sync::Mutex<()>,
}

impl MemoryStore {
    /// Volatile index
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            namespaces: RwLock::new(HashMap::new()),
            snapshot_path: None,
            dirty: AtomicBool::new(false),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open (or start) a snapshot-backed index.
    ///
    /// A snapshot built with a different dimension is a configuration error.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::new(dimension);

        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
            let populated = snapshot.namespaces.values().any(|r| !r.is_empty());
            if populated && snapshot.dimension != dimension {
                return Err(StoreError::IndexDimension {
                    location: path.display().to_string(),
                    expected: dimension,
                    actual: snapshot.dimension,
                });
            }
            let loaded: HashMap<String, NamespaceIndex> = snapshot
                .namespaces
                .into_iter()
                .map(|(ns, records)| (ns, NamespaceIndex::from_records(records)))
                .collect();
            info!(path = %path.display(), namespaces = loaded.len(), "Loaded index snapshot");
            store.namespaces = RwLock::new(loaded);
        }

        store.snapshot_path = Some(path);
        Ok(store)
    }

    /// Delete the snapshot at `path`, returning the namespaces it held.
    ///
    /// The snapshot is not validated, so this works for an index built at
    /// any dimension (or one that no longer parses).
    pub fn reset(path: impl AsRef<Path>) -> Result<Vec<String>, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let namespaces = match std::fs::read(path)
            .map_err(StoreError::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<Snapshot>(&bytes)?))
        {
            Ok(snapshot) => snapshot.namespaces.into_keys().collect(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable snapshot, removing anyway");
                Vec::new()
            }
        };
        std::fs::remove_file(path)?;
        info!(path = %path.display(), namespaces = namespaces.len(), "Removed index snapshot");
        Ok(namespaces)
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        self.dirty.store(false, Ordering::SeqCst);

        let bytes = {
            let namespaces = self.namespaces.read();
            let snapshot = Snapshot {
                dimension: self.dimension,
                namespaces: namespaces
                    .iter()
                    .map(|(ns, idx)| (ns.clone(), idx.records.clone()))
                    .collect(),
            };
            serde_json::to_vec(&snapshot)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "Wrote index snapshot");
        Ok(())
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn count(&self, namespace: &str) -> Result<usize, StoreError> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .map(|idx| idx.records.len())
            .unwrap_or(0))
    }

    async fn upsert(
        &self,
        namespace: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, StoreError> {
        check_dimensions(namespace, self.dimension, records.iter().map(|r| &r.embedding))?;
        if records.is_empty() {
            return Ok(0);
        }

        let count = records.len();
        {
            let mut namespaces = self.namespaces.write();
            let index = namespaces.entry(namespace.to_string()).or_default();
            for record in records {
                index.upsert(record);
            }
        }
        info!(namespace = %namespace, count = count, "Upserted vectors");

        self.dirty.store(true, Ordering::SeqCst);
        Ok(count)
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                namespace: namespace.to_string(),
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let namespaces = self.namespaces.read();
        let Some(index) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredChunk> = index
            .records
            .iter()
            .map(|r| ScoredChunk {
                id: r.id.clone(),
                source: r.chunk.source.clone(),
                chunk_index: r.chunk.index,
                content: r.chunk.content.clone(),
                score: cosine_similarity(vector, &r.embedding),
            })
            .collect();

        // Stable sort: equal scores keep insertion order
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        debug!(namespace = %namespace, hits = scored.len(), "Queried namespace");
        Ok(scored)
    }

    async fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        let removed = self.namespaces.write().remove(namespace);
        if let Some(index) = removed {
            info!(namespace = %namespace, count = index.records.len(), "Cleared namespace");
            self.persist().await?;
        }
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .namespaces
            .read()
            .iter()
            .filter(|(_, idx)| !idx.records.is_empty())
            .map(|(ns, _)| ns.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        if self.dirty.load(Ordering::SeqCst) {
            self.persist().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::Chunk;

    fn record(
        ns: &str,
        source: &str,
        index: u32,
        content: &str,
        embedding: Vec<f32>,
    ) -> VectorRecord {
        VectorRecord::new(
            ns,
            Chunk {
                source: source.to_string(),
                index,
                content: content.to_string(),
                start_pos: 0,
                end_pos: content.chars().count(),
                namespace: None,
            },
            embedding,
        )
    }

    #[tokio::test]
    async fn test_exists_and_clear() {
        let store = MemoryStore::new(2);
        assert!(!store.exists("s1").await.unwrap());

        store
            .upsert("s1", vec![record("s1", "a", 0, "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert!(store.exists("s1").await.unwrap());
        assert!(!store.exists("s2").await.unwrap());

        store.clear("s1").await.unwrap();
        assert!(!store.exists("s1").await.unwrap());
        // Clearing an absent namespace is fine
        store.clear("never").await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_id() {
        let store = MemoryStore::new(2);
        let rec = record("s1", "a", 0, "alpha", vec![1.0, 0.0]);
        store.upsert("s1", vec![rec.clone()]).await.unwrap();
        store.upsert("s1", vec![rec]).await.unwrap();
        assert_eq!(store.count("s1").await.unwrap(), 1);

        store
            .upsert("s1", vec![record("s1", "a", 0, "alpha v2", vec![0.0, 1.0])])
            .await
            .unwrap();
        let hits = store.query("s1", &[0.0, 1.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "alpha v2");
    }

    #[tokio::test]
    async fn test_query_orders_by_score_then_insertion() {
        let store = MemoryStore::new(2);
        store
            .upsert(
                "s1",
                vec![
                    record("s1", "a", 0, "far", vec![0.0, 1.0]),
                    record("s1", "a", 1, "tie-first", vec![1.0, 1.0]),
                    record("s1", "a", 2, "best", vec![1.0, 0.0]),
                    record("s1", "a", 3, "tie-second", vec![1.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.query("s1", &[1.0, 0.0], 3).await.unwrap();
        let contents: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(contents, vec!["best", "tie-first", "tie-second"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryStore::new(2);
        store
            .upsert("s1", vec![record("s1", "a", 0, "one", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert("s2", vec![record("s2", "b", 0, "two", vec![1.0, 0.0])])
            .await
            .unwrap();

        let hits = store.query("s1", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "one");
        assert_eq!(store.namespaces().await.unwrap(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_dimension_guard_leaves_index_unchanged() {
        let store = MemoryStore::new(2);
        store
            .upsert("s1", vec![record("s1", "a", 0, "kept", vec![1.0, 0.0])])
            .await
            .unwrap();

        let err = store
            .upsert(
                "s1",
                vec![
                    record("s1", "a", 1, "fits", vec![0.5, 0.5]),
                    record("s1", "a", 2, "too wide", vec![0.1, 0.2, 0.3]),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: 2, actual: 3, .. }
        ));
        assert_eq!(store.count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_unknown_namespace_is_empty() {
        let store = MemoryStore::new(2);
        assert!(store.query("ghost", &[1.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        {
            let store = MemoryStore::open(&path, 2).unwrap();
            store
                .upsert("s1", vec![record("s1", "a", 0, "persisted", vec![1.0, 0.0])])
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let reopened = MemoryStore::open(&path, 2).unwrap();
        assert!(reopened.exists("s1").await.unwrap());
        let hits = reopened.query("s1", &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].content, "persisted");
    }

    #[tokio::test]
    async fn test_snapshot_with_other_dimension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let store = MemoryStore::open(&path, 2).unwrap();
        store
            .upsert("s1", vec![record("s1", "a", 0, "old", vec![1.0, 0.0])])
            .await
            .unwrap();
        store.flush().await.unwrap();

        let err = MemoryStore::open(&path, 768).err().unwrap();
        assert!(matches!(
            err,
            StoreError::IndexDimension { expected: 768, actual: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_upserts_are_written_once_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let store = MemoryStore::open(&path, 2).unwrap();
        for i in 0..5 {
            store
                .upsert("s1", vec![record("s1", "a", i, "batch", vec![1.0, 0.0])])
                .await
                .unwrap();
        }
        assert!(!path.exists());

        store.flush().await.unwrap();
        assert_eq!(MemoryStore::open(&path, 2).unwrap().count("s1").await.unwrap(), 5);

        // Nothing pending, so a second flush leaves the file alone
        std::fs::remove_file(&path).unwrap();
        store.flush().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_clear_is_written_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let store = MemoryStore::open(&path, 2).unwrap();
        store
            .upsert("s1", vec![record("s1", "a", 0, "gone", vec![1.0, 0.0])])
            .await
            .unwrap();
        store.flush().await.unwrap();
        store.clear("s1").await.unwrap();

        let reopened = MemoryStore::open(&path, 2).unwrap();
        assert!(!reopened.exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_removes_snapshot_of_any_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let store = MemoryStore::open(&path, 2).unwrap();
        store
            .upsert("s1", vec![record("s1", "a", 0, "old", vec![1.0, 0.0])])
            .await
            .unwrap();
        store.flush().await.unwrap();

        assert_eq!(MemoryStore::reset(&path).unwrap(), vec!["s1"]);
        assert!(!path.exists());
        assert!(MemoryStore::reset(&path).unwrap().is_empty());

        let reopened = MemoryStore::open(&path, 768).unwrap();
        assert!(reopened.namespaces().await.unwrap().is_empty());
    }
}
