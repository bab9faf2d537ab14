// Claimwise Library
// Retrieval-augmented claim decisions; used by the CLI binary and embedders of the crate.

pub mod config;
pub mod context;
pub mod decision;
pub mod documents;
pub mod pipeline;
pub mod providers;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigError, EmbeddingProvider, PipelineConfig, StoreBackend};

pub use context::{build_decision_prompt, count_tokens, fit_chunks};

pub use decision::{
    Amount, Decision, DecisionRecord, DecisionStatus, DecisionSynthesizer, GenerativeModel,
    ModelError,
};

pub use documents::{
    chunk_documents, chunk_text, Chunk, ChunkerConfig, Document, DocumentLoader, Embedder,
    Embedding, EmbeddingError, HashingEmbedder, LoaderRegistry, ProbedEmbedder,
};

pub use pipeline::{
    IngestError, IngestReport, IngestionCoordinator, Pipeline, PipelineError, RefreshPolicy,
    ResetReport, RetrieveError, Retriever, DEFAULT_TOP_K,
};

pub use providers::{GeminiEmbedder, GeminiModel, GeminiSettings};

pub use store::{
    ChromaStore, MemoryStore, NamespaceLocks, ScoredChunk, StoreError, VectorRecord, VectorStore,
};
