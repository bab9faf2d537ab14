//! Generative model seam.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Generative model failed: {0}")]
    Provider(String),
    #[error("Generative model returned no text")]
    EmptyResponse,
    #[error("Generative model blocked the prompt: {0}")]
    Blocked(String),
}

/// Prompt in, raw text out. One call per decision.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;
}
