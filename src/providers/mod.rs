//! Hosted model providers.

pub mod gemini;

pub use gemini::{GeminiEmbedder, GeminiError, GeminiModel, GeminiSettings};
