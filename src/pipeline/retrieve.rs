//! Retrieval Engine
//!
//! Embeds a query and returns the namespace's nearest chunks, best first.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::documents::{Embedder, EmbeddingError};
use crate::store::{NamespaceLocks, ScoredChunk, StoreError, VectorStore};

/// Chunks returned when the caller does not say otherwise
pub const DEFAULT_TOP_K: usize = 5;

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("Query must not be empty")]
    EmptyQuery,
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    locks: Arc<NamespaceLocks>,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        locks: Arc<NamespaceLocks>,
    ) -> Self {
        Self {
            embedder,
            store,
            locks,
        }
    }

    /// Chunk texts only.
    pub async fn retrieve(
        &self,
        query: &str,
        namespace: &str,
        top_k: usize,
    ) -> Result<Vec<String>, RetrieveError> {
        Ok(self
            .retrieve_scored(query, namespace, top_k)
            .await?
            .into_iter()
            .map(|hit| hit.content)
            .collect())
    }

    /// Waits for any ingestion of `namespace` in progress.
    pub async fn retrieve_scored(
        &self,
        query: &str,
        namespace: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrieveError> {
        if query.trim().is_empty() {
            return Err(RetrieveError::EmptyQuery);
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.locks.read(namespace).await;
        if !self.store.exists(namespace).await? {
            debug!(namespace = %namespace, "Namespace empty or absent");
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(query).await?;
        let hits = self.store.query(namespace, &vector, top_k).await?;
        debug!(
            namespace = %namespace,
            top_k = top_k,
            hits = hits.len(),
            best = hits.first().map(|h| h.score).unwrap_or(0.0),
            "Retrieved chunks"
        );
        Ok(hits)
    }
}
