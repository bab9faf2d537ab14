//! Vector Namespace Store
//!
//! A similarity index partitioned into namespaces. Each namespace holds the
//! chunk vectors of one document set and is only ever queried on its own.
//!
//! Two backends implement [`VectorStore`]: an in-process [`MemoryStore`]
//! (optionally snapshotted to disk) and [`ChromaStore`], which maps every
//! namespace onto a Chroma collection.

pub mod chroma;
pub mod locks;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::documents::{Chunk, Embedding};

pub use chroma::{ChromaClient, ChromaError, ChromaStore};
pub use locks::NamespaceLocks;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(
        "Embedding dimension mismatch in namespace '{namespace}': \
         index expects {expected}, got {actual}"
    )]
    DimensionMismatch {
        namespace: String,
        expected: usize,
        actual: usize,
    },
    #[error(
        "Index at {location} was built with dimension {actual}, \
         embedding provider produces {expected}"
    )]
    IndexDimension {
        location: String,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Chroma error: {0}")]
    Chroma(#[from] ChromaError),
    #[error("Snapshot IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot format error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl StoreError {
    /// Configuration errors are fatal for the namespace and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StoreError::DimensionMismatch { .. } | StoreError::IndexDimension { .. }
        )
    }
}

/// A chunk paired with its vector, ready for upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorRecord {
    pub id: String,
    pub chunk: Chunk,
    pub embedding: Embedding,
}

impl VectorRecord {
    pub fn new(namespace: &str, mut chunk: Chunk, embedding: Embedding) -> Self {
        chunk.namespace = Some(namespace.to_string());
        Self {
            id: chunk_id(namespace, &chunk.source, chunk.index),
            chunk,
            embedding,
        }
    }
}

/// Query hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredChunk {
    pub id: String,
    pub source: String,
    pub chunk_index: u32,
    pub content: String,
    /// Cosine similarity, higher is closer
    pub score: f32,
}

/// Partitioned similarity index.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Dimension every vector in this index must have.
    fn dimension(&self) -> usize;

    /// True iff the namespace holds at least one vector.
    async fn exists(&self, namespace: &str) -> Result<bool, StoreError> {
        Ok(self.count(namespace).await? > 0)
    }

    async fn count(&self, namespace: &str) -> Result<usize, StoreError>;

    /// Insert or replace by record id. Rejects the whole batch on any
    /// dimension mismatch, before writing. May buffer until [`flush`].
    ///
    /// [`flush`]: VectorStore::flush
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>)
        -> Result<usize, StoreError>;

    /// Nearest neighbours by cosine similarity, best first.
    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    /// Delete every vector in the namespace. No-op if absent. Durable on return.
    async fn clear(&self, namespace: &str) -> Result<(), StoreError>;

    async fn namespaces(&self) -> Result<Vec<String>, StoreError>;

    /// Make preceding upserts durable. Backends that write through need not
    /// override this.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Build a chunk ID from components
pub fn chunk_id(namespace: &str, source: &str, chunk_index: u32) -> String {
    format!("{}_{}_{}", namespace, source, chunk_index)
}

/// Reject vectors whose length differs from `expected`.
pub fn check_dimensions<'a>(
    namespace: &str,
    expected: usize,
    vectors: impl IntoIterator<Item = &'a Embedding>,
) -> Result<(), StoreError> {
    for vector in vectors {
        if vector.len() != expected {
            return Err(StoreError::DimensionMismatch {
                namespace: namespace.to_string(),
                expected,
                actual: vector.len(),
            });
        }
    }
    Ok(())
}
