//! Document Handling Module
//!
//! Loading, chunking, and embedding of uploaded documents.

pub mod chunker;
pub mod embeddings;
pub mod loader;

// Re-export key public types
pub use chunker::{chunk_documents, chunk_text, Chunk, ChunkerConfig, ChunkerError};
pub use embeddings::{
    cosine_similarity, probe_dimension, Embedder, Embedding, EmbeddingError, HashingEmbedder,
    ProbedEmbedder,
};
pub use loader::{Document, DocumentLoader, LoaderError, LoaderRegistry, PdfLoader, TextLoader};
