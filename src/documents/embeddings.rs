//! Embeddings
//!
//! The [`Embedder`] trait is the seam between the pipeline and whatever
//! service turns text into vectors. [`HashingEmbedder`] is a local
//! feature-hashing implementation: the same text always produces the same
//! vector, with no vocabulary and no network.
//!
//! The vector dimension is never assumed. [`ProbedEmbedder`] embeds a canary
//! string once at startup and rejects any later vector of another length.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Default dimensionality for the hashing embedder.
pub const DEFAULT_HASHING_DIM: usize = 256;

/// Text embedded once at startup to learn the provider's dimension.
const DIMENSION_PROBE_TEXT: &str = "dimension probe";

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding provider failed: {0}")]
    Provider(String),
    #[error("Embedding provider returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },
    #[error("Embedding dimension changed: expected {expected}, got {actual}")]
    DimensionChanged { expected: usize, actual: usize },
    #[error("Embedding provider returned an empty vector")]
    EmptyVector,
}

/// Embedding vector
pub type Embedding = Vec<f32>;

/// Maps text to fixed-dimension vectors. Used for documents and queries alike.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Embed several texts, preserving order. Defaults to one call per text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Feature-hashing embedder.
///
/// Each token is hashed to a bucket in `[0, dimension)`; the term-frequency
/// vector is L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIM)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn hash_token(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() as usize) % self.dimension
    }

    /// Pure function of `text`; never fails.
    pub fn embed_sync(&self, text: &str) -> Embedding {
        let mut tf = vec![0.0f32; self.dimension];

        let tokens = text
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|t| !t.is_empty());
        for token in tokens {
            tf[self.hash_token(&token.to_lowercase())] += 1.0;
        }

        // L2 normalize
        let norm: f32 = tf.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut tf {
                *x /= norm;
            }
        }
        tf
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

/// Embed the canary string and return the provider's dimension.
pub async fn probe_dimension(embedder: &dyn Embedder) -> Result<usize, EmbeddingError> {
    let probe = embedder.embed(DIMENSION_PROBE_TEXT).await?;
    if probe.is_empty() {
        return Err(EmbeddingError::EmptyVector);
    }
    debug!(dimension = probe.len(), "Probed embedding dimension");
    Ok(probe.len())
}

/// An embedder whose dimension was probed at construction and is enforced on
/// every vector it returns.
#[derive(Clone)]
pub struct ProbedEmbedder {
    inner: Arc<dyn Embedder>,
    dimension: usize,
}

impl ProbedEmbedder {
    pub async fn probe(inner: Arc<dyn Embedder>) -> Result<Self, EmbeddingError> {
        let dimension = probe_dimension(inner.as_ref()).await?;
        info!(dimension = dimension, "Embedding provider ready");
        Ok(Self { inner, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check(&self, vector: &Embedding) -> Result<(), EmbeddingError> {
        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionChanged {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for ProbedEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let vector = self.inner.embed(text).await?;
        self.check(&vector)?;
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let vectors = self.inner.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        for v in &vectors {
            self.check(v)?;
        }
        Ok(vectors)
    }
}

/// Calculate cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns vectors whose length depends on the call count.
    struct ShrinkingEmbedder {
        calls: parking_lot::Mutex<usize>,
    }

    #[async_trait]
    impl Embedder for ShrinkingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Embedding, EmbeddingError> {
            let mut calls = self.calls.lock();
            *calls += 1;
            Ok(vec![0.5; 8 - *calls])
        }
    }

    #[test]
    fn test_hashing_dimension() {
        let embedding = HashingEmbedder::new(64).embed_sync("Hello world this is a test");
        assert_eq!(embedding.len(), 64);
    }

    #[test]
    fn test_embedding_stability() {
        let embedder = HashingEmbedder::default();
        let emb1 = embedder.embed_sync("The quick brown fox");
        let _ = embedder.embed_sync("completely different words zebra giraffe quantum");
        let emb2 = embedder.embed_sync("The quick brown fox");
        assert_eq!(emb1, emb2);
    }

    #[test]
    fn test_related_text_scores_higher() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed_sync("maternity claim limit");
        let related = embedder.embed_sync("The maternity claim limit is 50000");
        let unrelated = embedder.embed_sync("Ambulance charges reimbursed for road transport");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_and_mismatched() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_probe_reports_dimension() {
        let probed = ProbedEmbedder::probe(Arc::new(HashingEmbedder::new(48)))
            .await
            .unwrap();
        assert_eq!(probed.dimension(), 48);
        let batch = probed
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_probed_embedder_rejects_changed_dimension() {
        let inner = Arc::new(ShrinkingEmbedder {
            calls: parking_lot::Mutex::new(0),
        });
        let probed = ProbedEmbedder::probe(inner).await.unwrap();
        assert_eq!(probed.dimension(), 7);

        let err = probed.embed("later call").await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionChanged { expected: 7, actual: 6 }
        ));
    }
}
