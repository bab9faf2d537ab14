//! Decision pipeline
//!
//! [`Pipeline`] owns the ingestion coordinator, the retriever and the
//! synthesizer, all sharing one embedder, one store and one set of namespace
//! locks. Build it from explicit components with [`Pipeline::new`] or from a
//! [`PipelineConfig`] with [`Pipeline::from_config`].

pub mod ingest;
pub mod retrieve;

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, EmbeddingProvider, PipelineConfig, StoreBackend};
use crate::decision::{DecisionRecord, DecisionSynthesizer, GenerativeModel, ModelError};
use crate::documents::{
    Embedder, EmbeddingError, HashingEmbedder, LoaderRegistry, ProbedEmbedder,
};
use crate::providers::{GeminiEmbedder, GeminiError, GeminiModel, GeminiSettings};
use crate::store::{
    ChromaClient, ChromaStore, MemoryStore, NamespaceLocks, StoreError, VectorStore,
};

pub use ingest::{
    IngestError, IngestOptions, IngestReport, IngestionCoordinator, RefreshPolicy,
};
pub use retrieve::{RetrieveError, Retriever, DEFAULT_TOP_K};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gemini(#[from] GeminiError),
}

/// Outcome of [`Pipeline::reset_index`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    /// Snapshot path or Chroma URL
    pub location: String,
    /// Dimension the index was reopened at
    pub dimension: usize,
    /// Namespaces that held vectors before the reset
    pub removed: Vec<String>,
}

/// Stands in for the generative model when no API key is configured.
/// Ingestion and empty-context answers still work; anything needing the
/// model fails with the missing variable's name.
struct UnconfiguredModel {
    reason: String,
}

#[async_trait]
impl GenerativeModel for UnconfiguredModel {
    async fn generate(&self, _prompt: &str) -> Result<String, ModelError> {
        Err(ModelError::Provider(self.reason.clone()))
    }
}

pub struct Pipeline {
    coordinator: IngestionCoordinator,
    retriever: Retriever,
    synthesizer: DecisionSynthesizer,
    store: Arc<dyn VectorStore>,
    locks: Arc<NamespaceLocks>,
    refresh_policy: RefreshPolicy,
    top_k: usize,
}

impl Pipeline {
    /// Wire explicit components. The embedder's dimension must match the
    /// store's; ingestion rejects vectors that do not.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        model: Arc<dyn GenerativeModel>,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let locks = Arc::new(NamespaceLocks::new());
        let options = IngestOptions {
            embed_batch_size: config.ingest.embed_batch_size,
            embed_concurrency: config.ingest.embed_concurrency,
            upsert_batch_size: config.ingest.upsert_batch_size,
        };

        Ok(Self {
            coordinator: IngestionCoordinator::new(
                Arc::new(LoaderRegistry::default()),
                embedder.clone(),
                store.clone(),
                locks.clone(),
                config.chunking,
                options,
            ),
            retriever: Retriever::new(embedder, store.clone(), locks.clone()),
            synthesizer: DecisionSynthesizer::with_context_budget(
                model,
                config.generation.max_context_tokens,
            ),
            store,
            locks,
            refresh_policy: config.ingest.refresh_policy,
            top_k: config.retrieval.top_k,
        })
    }

    /// Build every component from configuration.
    ///
    /// The embedding dimension is probed once here and the store is opened
    /// (or checked) against it.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let embedder = build_embedder(config).await?;
        let store = open_store(config, embedder.dimension()).await?;
        Self::assemble(embedder, store, config)
    }

    /// Drop the configured index (snapshot file or every prefixed Chroma
    /// collection) and reopen it empty at the probed embedding dimension.
    ///
    /// This is the way out of [`StoreError::IndexDimension`] after the
    /// embedding model changes. Every namespace must be ingested again.
    pub async fn reset_index(
        config: &PipelineConfig,
    ) -> Result<(Self, ResetReport), PipelineError> {
        config.validate()?;
        let embedder = build_embedder(config).await?;
        let dimension = embedder.dimension();

        let (location, removed) = match config.store.backend {
            StoreBackend::Memory => match &config.store.path {
                Some(path) => (path.display().to_string(), MemoryStore::reset(path)?),
                None => ("memory".to_string(), Vec::new()),
            },
            StoreBackend::Chroma => {
                let client = chroma_client(config).await?;
                let store = ChromaStore::new(client, &config.store.collection_prefix, dimension);
                (config.store.url.clone(), store.reset().await?)
            }
        };
        warn!(
            location = %location,
            dimension = dimension,
            removed = removed.len(),
            "Index reset, namespaces must be re-ingested"
        );

        let store = open_store(config, dimension).await?;
        let pipeline = Self::assemble(embedder, store, config)?;
        Ok((
            pipeline,
            ResetReport {
                location,
                dimension,
                removed,
            },
        ))
    }

    fn assemble(
        embedder: ProbedEmbedder,
        store: Arc<dyn VectorStore>,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let model: Arc<dyn GenerativeModel> =
            match gemini_settings(&config.generation.api_key_env, &config.http) {
                Ok(settings) => Arc::new(GeminiModel::new(
                    &settings,
                    &config.generation.model,
                    config.generation.temperature,
                    config.generation.max_output_tokens,
                )?),
                Err(e) => {
                    warn!(error = %e, "Generative model not configured");
                    Arc::new(UnconfiguredModel { reason: e.to_string() })
                }
            };

        info!(
            dimension = embedder.dimension(),
            backend = ?config.store.backend,
            provider = ?config.embedding.provider,
            "Pipeline ready"
        );
        Self::new(Arc::new(embedder), store, model, config)
    }

    /// Ingest with the configured refresh policy.
    pub async fn ingest(
        &self,
        paths: &[PathBuf],
        namespace: &str,
    ) -> Result<IngestReport, PipelineError> {
        self.ingest_with(paths, namespace, self.refresh_policy).await
    }

    pub async fn ingest_with(
        &self,
        paths: &[PathBuf],
        namespace: &str,
        policy: RefreshPolicy,
    ) -> Result<IngestReport, PipelineError> {
        Ok(self.coordinator.ingest(paths, namespace, policy).await?)
    }

    /// Retrieve from `namespace` and synthesize a decision.
    pub async fn answer(
        &self,
        query: &str,
        namespace: &str,
    ) -> Result<DecisionRecord, PipelineError> {
        self.answer_with_top_k(query, namespace, self.top_k).await
    }

    pub async fn answer_with_top_k(
        &self,
        query: &str,
        namespace: &str,
        top_k: usize,
    ) -> Result<DecisionRecord, PipelineError> {
        let chunks = self.retriever.retrieve(query, namespace, top_k).await?;
        Ok(self.synthesizer.decide(query, &chunks).await?)
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub async fn exists(&self, namespace: &str) -> Result<bool, PipelineError> {
        let _guard = self.locks.read(namespace).await;
        Ok(self.store.exists(namespace).await?)
    }

    pub async fn count(&self, namespace: &str) -> Result<usize, PipelineError> {
        let _guard = self.locks.read(namespace).await;
        Ok(self.store.count(namespace).await?)
    }

    pub async fn clear(&self, namespace: &str) -> Result<(), PipelineError> {
        let _guard = self.locks.write(namespace).await;
        self.store.clear(namespace).await?;
        info!(namespace = %namespace, "Namespace cleared");
        Ok(())
    }

    pub async fn namespaces(&self) -> Result<Vec<String>, PipelineError> {
        Ok(self.store.namespaces().await?)
    }
}

async fn build_embedder(config: &PipelineConfig) -> Result<ProbedEmbedder, PipelineError> {
    let raw: Arc<dyn Embedder> = match config.embedding.provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(config.embedding.dimension)),
        EmbeddingProvider::Gemini => {
            let settings = gemini_settings(&config.embedding.api_key_env, &config.http)?;
            Arc::new(GeminiEmbedder::new(&settings, &config.embedding.model)?)
        }
    };
    Ok(ProbedEmbedder::probe(raw).await?)
}

async fn chroma_client(config: &PipelineConfig) -> Result<ChromaClient, PipelineError> {
    let client = ChromaClient::new(
        &config.store.url,
        Duration::from_secs(config.http.timeout_secs),
        Duration::from_secs(config.http.connect_timeout_secs),
    );
    client.heartbeat().await.map_err(StoreError::from)?;
    Ok(client)
}

async fn open_store(
    config: &PipelineConfig,
    dimension: usize,
) -> Result<Arc<dyn VectorStore>, PipelineError> {
    Ok(match config.store.backend {
        StoreBackend::Memory => match &config.store.path {
            Some(path) => Arc::new(MemoryStore::open(path, dimension)?),
            None => Arc::new(MemoryStore::new(dimension)),
        },
        StoreBackend::Chroma => {
            let client = chroma_client(config).await?;
            Arc::new(ChromaStore::new(client, &config.store.collection_prefix, dimension))
        }
    })
}

fn gemini_settings(
    api_key_env: &str,
    http: &crate::config::HttpConfig,
) -> Result<GeminiSettings, ConfigError> {
    let mut settings = GeminiSettings::new(PipelineConfig::api_key(api_key_env)?);
    settings.timeout = Duration::from_secs(http.timeout_secs);
    settings.connect_timeout = Duration::from_secs(http.connect_timeout_secs);
    settings.max_retries = http.max_retries;
    Ok(settings)
}
