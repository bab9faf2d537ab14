//! Ingestion Coordinator
//!
//! load → chunk → embed → upsert for one namespace, under its write lock.
//! Every file is loaded and every vector computed and checked before the
//! store is touched, so a failure up to that point leaves the namespace as it
//! was. A failed write clears the namespace instead of leaving it partially
//! indexed, so the next ingest reloads it under any refresh policy.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::documents::{
    chunk_documents, ChunkerConfig, ChunkerError, Document, Embedder, Embedding, EmbeddingError,
    LoaderError, LoaderRegistry,
};
use crate::store::{check_dimensions, NamespaceLocks, StoreError, VectorRecord, VectorStore};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),
    #[error("No files given")]
    NoFiles,
    #[error("Failed to load {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: LoaderError,
    },
    #[error("No text could be extracted from the given files")]
    NoContent,
    #[error(transparent)]
    Chunk(#[from] ChunkerError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Loader task failed: {0}")]
    Task(String),
}

/// What to do when the namespace already holds vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Leave an existing namespace untouched
    #[default]
    SkipIfExists,
    /// Clear the namespace, then load the new files
    AlwaysClearThenReload,
}

impl fmt::Display for RefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshPolicy::SkipIfExists => write!(f, "skip_if_exists"),
            RefreshPolicy::AlwaysClearThenReload => write!(f, "always_clear_then_reload"),
        }
    }
}

impl FromStr for RefreshPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "skip_if_exists" | "skip" => Ok(RefreshPolicy::SkipIfExists),
            "always_clear_then_reload" | "reload" => Ok(RefreshPolicy::AlwaysClearThenReload),
            other => Err(format!(
                "unknown refresh policy '{}' \
                 (expected skip_if_exists or always_clear_then_reload)",
                other
            )),
        }
    }
}

/// Batch sizes and concurrency for one coordinator.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub embed_batch_size: usize,
    pub embed_concurrency: usize,
    pub upsert_batch_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            embed_batch_size: 32,
            embed_concurrency: 4,
            upsert_batch_size: 100,
        }
    }
}

/// Outcome of one ingest call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub run_id: String,
    pub namespace: String,
    pub policy: RefreshPolicy,
    pub files: Vec<String>,
    pub documents: usize,
    pub chunks: usize,
    pub upserted: usize,
    /// Namespace already existed and was left untouched
    pub skipped: bool,
    /// Existing vectors were removed before the upsert
    pub cleared: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct IngestionCoordinator {
    loaders: Arc<LoaderRegistry>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    locks: Arc<NamespaceLocks>,
    chunking: ChunkerConfig,
    options: IngestOptions,
}

impl IngestionCoordinator {
    pub fn new(
        loaders: Arc<LoaderRegistry>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        locks: Arc<NamespaceLocks>,
        chunking: ChunkerConfig,
        options: IngestOptions,
    ) -> Self {
        Self {
            loaders,
            embedder,
            store,
            locks,
            chunking,
            options,
        }
    }

    pub async fn ingest(
        &self,
        paths: &[PathBuf],
        namespace: &str,
        policy: RefreshPolicy,
    ) -> Result<IngestReport, IngestError> {
        if namespace.trim().is_empty() {
            return Err(IngestError::InvalidNamespace(
                "namespace must not be empty".to_string(),
            ));
        }
        if paths.is_empty() {
            return Err(IngestError::NoFiles);
        }
        self.chunking.validate()?;

        let paths = dedupe_paths(paths);
        let started_at = Utc::now();
        let run_id = Ulid::new().to_string();
        let files: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        let mut report = IngestReport {
            run_id,
            namespace: namespace.to_string(),
            policy,
            files,
            documents: 0,
            chunks: 0,
            upserted: 0,
            skipped: false,
            cleared: false,
            started_at,
            finished_at: started_at,
        };

        let _guard = self.locks.write(namespace).await;

        let existed = self.store.exists(namespace).await?;
        if existed && policy == RefreshPolicy::SkipIfExists {
            info!(
                namespace = %namespace,
                run_id = %report.run_id,
                "Namespace exists, skipping ingestion"
            );
            report.skipped = true;
            report.finished_at = Utc::now();
            return Ok(report);
        }

        let documents = self.load_all(&paths).await?;
        report.documents = documents.len();

        let chunks = chunk_documents(&documents, &self.chunking)?;
        if chunks.is_empty() {
            return Err(IngestError::NoContent);
        }
        report.chunks = chunks.len();

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embed_all(&texts).await?;
        check_dimensions(namespace, self.store.dimension(), &embeddings)?;

        if existed {
            self.store.clear(namespace).await?;
            report.cleared = true;
            info!(namespace = %namespace, "Cleared namespace before reload");
        }

        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord::new(namespace, chunk, embedding))
            .collect();
        match self.write_all(namespace, records).await {
            Ok(upserted) => report.upserted = upserted,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Upsert failed, rolling back namespace");
                if let Err(clear_err) = self.store.clear(namespace).await {
                    warn!(namespace = %namespace, error = %clear_err, "Rollback clear failed");
                }
                return Err(e.into());
            }
        }

        report.finished_at = Utc::now();
        info!(
            namespace = %namespace,
            run_id = %report.run_id,
            documents = report.documents,
            chunks = report.chunks,
            "Ingestion finished"
        );
        Ok(report)
    }

    /// Upsert in batches, then flush. Callers hold the write lock.
    async fn write_all(
        &self,
        namespace: &str,
        mut records: Vec<VectorRecord>,
    ) -> Result<usize, StoreError> {
        let batch_size = self.options.upsert_batch_size.max(1);
        let mut upserted = 0;
        while !records.is_empty() {
            let rest = records.split_off(records.len().min(batch_size));
            let batch = std::mem::replace(&mut records, rest);
            upserted += self.store.upsert(namespace, batch).await?;
        }
        self.store.flush().await?;
        Ok(upserted)
    }

    /// Load every file, aborting on the first failure.
    async fn load_all(&self, paths: &[PathBuf]) -> Result<Vec<Document>, IngestError> {
        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let loaders = self.loaders.clone();
            let owned = path.clone();
            let loaded = tokio::task::spawn_blocking(move || loaders.load(&owned))
                .await
                .map_err(|e| IngestError::Task(e.to_string()))?;
            let document = loaded.map_err(|source| load_error(path, source))?;
            debug!(source = %document.source, pages = document.pages.len(), "Loaded document");
            documents.push(document);
        }
        Ok(documents)
    }

    /// Embed in batches with bounded concurrency, preserving order.
    async fn embed_all(&self, texts: &[String]) -> Result<Vec<Embedding>, IngestError> {
        let embedder = &self.embedder;
        let batch_size = self.options.embed_batch_size.max(1);
        let batches: Vec<Vec<Embedding>> = stream::iter(texts.chunks(batch_size))
            .map(|batch| async move {
                let vectors = embedder.embed_batch(batch).await?;
                if vectors.len() != batch.len() {
                    return Err(EmbeddingError::CountMismatch {
                        expected: batch.len(),
                        actual: vectors.len(),
                    });
                }
                Ok::<_, EmbeddingError>(vectors)
            })
            .buffered(self.options.embed_concurrency.max(1))
            .try_collect()
            .await?;

        let embeddings: Vec<Embedding> = batches.into_iter().flatten().collect();
        debug!(count = embeddings.len(), "Embedded chunks");
        Ok(embeddings)
    }
}

/// Drop repeated paths, keeping first-seen order. Paths that resolve to the
/// same file count as repeats.
fn dedupe_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(paths.len());
    for path in paths {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        if seen.insert(key) {
            unique.push(path.clone());
        } else {
            warn!(path = %path.display(), "Duplicate file in ingest request, ignoring");
        }
    }
    unique
}

fn load_error(path: &Path, source: LoaderError) -> IngestError {
    IngestError::Load {
        path: path.display().to_string(),
        source,
    }
}
