//! Gemini REST client
//!
//! Embeddings via `embedContent` / `batchEmbedContents` and generation via
//! `generateContent`. Requests that fail with 429, a 5xx status, or a
//! transport error are retried with exponential backoff up to
//! `max_retries` attempts.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::decision::{GenerativeModel, ModelError};
use crate::documents::{Embedder, Embedding, EmbeddingError};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_EMBEDDING_MODEL: &str = "embedding-001";
pub const DEFAULT_GENERATION_MODEL: &str = "gemini-2.5-pro";

/// Upper bound on texts per `batchEmbedContents` call
const MAX_BATCH: usize = 100;

#[derive(Error, Debug)]
pub enum GeminiError {
    #[error("Missing Gemini API key")]
    MissingApiKey,
    #[error("Invalid Gemini API key header")]
    InvalidApiKey,
    #[error("Gemini HTTP error: {0}")]
    Http(String),
    #[error("Gemini request failed ({status}): {body}")]
    Status { status: StatusCode, body: String },
    #[error("Failed to parse Gemini response: {0}")]
    Deserialize(String),
}

impl From<reqwest::Error> for GeminiError {
    fn from(e: reqwest::Error) -> Self {
        GeminiError::Http(e.to_string())
    }
}

impl From<GeminiError> for EmbeddingError {
    fn from(e: GeminiError) -> Self {
        EmbeddingError::Provider(e.to_string())
    }
}

impl From<GeminiError> for ModelError {
    fn from(e: GeminiError) -> Self {
        ModelError::Provider(e.to_string())
    }
}

/// Connection settings shared by the embedder and the model
#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: usize,
    /// First backoff; doubles per retry, capped at 32x
    pub retry_base_delay: Duration,
}

impl GeminiSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// HTTP transport with retry
#[derive(Clone)]
struct GeminiClient {
    http: Client,
    base_url: String,
    max_retries: usize,
    retry_base_delay: Duration,
}

impl GeminiClient {
    fn new(settings: &GeminiSettings) -> Result<Self, GeminiError> {
        if settings.api_key.trim().is_empty() {
            return Err(GeminiError::MissingApiKey);
        }
        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(settings.api_key.trim())
            .map_err(|_| GeminiError::InvalidApiKey)?;
        headers.insert("x-goog-api-key", api_key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.connect_timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_retries: settings.max_retries.max(1),
            retry_base_delay: settings.retry_base_delay,
        })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<R, GeminiError> {
        let mut attempt = 0usize;
        loop {
            match self.http.post(url).json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp.text().await?;
                        return serde_json::from_str(&text)
                            .map_err(|e| GeminiError::Deserialize(e.to_string()));
                    }

                    let detail = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(
                            status = %status,
                            attempt = attempt,
                            "Gemini request failed, retrying"
                        );
                        tokio::time::sleep(retry_backoff(self.retry_base_delay, attempt)).await;
                        continue;
                    }
                    error!(status = %status, body = %detail, "Gemini HTTP error");
                    return Err(GeminiError::Status { status, body: detail });
                }
                Err(err) => {
                    if is_retryable_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(error = %err, attempt = attempt, "Gemini transport error, retrying");
                        tokio::time::sleep(retry_backoff(self.retry_base_delay, attempt)).await;
                        continue;
                    }
                    error!(error = %err, "Gemini request failed");
                    return Err(err.into());
                }
            }
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn retry_backoff(base: Duration, attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    base * (1 << capped)
}

/// `models/<name>`, accepting either form
fn qualified_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

fn bare_model(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Part {
    text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![Part { text: text.to_string() }],
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    content: Content,
}

#[derive(Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedRequest>,
}

#[derive(Deserialize)]
struct ContentEmbedding {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: ContentEmbedding,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

/// Gemini embedding client.
#[derive(Clone)]
pub struct GeminiEmbedder {
    client: GeminiClient,
    model: String,
}

impl GeminiEmbedder {
    pub fn new(settings: &GeminiSettings, model: &str) -> Result<Self, GeminiError> {
        Ok(Self {
            client: GeminiClient::new(settings)?,
            model: qualified_model(model),
        })
    }

    fn request(&self, text: &str) -> EmbedRequest {
        EmbedRequest {
            model: self.model.clone(),
            content: Content::text(text),
        }
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let url = self.client.model_url(bare_model(&self.model), "embedContent");
        let resp: EmbedResponse = self.client.post(&url, &self.request(text)).await?;
        if resp.embedding.values.is_empty() {
            return Err(EmbeddingError::EmptyVector);
        }
        Ok(resp.embedding.values)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.client.model_url(bare_model(&self.model), "batchEmbedContents");

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            let body = BatchEmbedRequest {
                requests: batch.iter().map(|t| self.request(t)).collect(),
            };
            let resp: BatchEmbedResponse = self.client.post(&url, &body).await?;
            if resp.embeddings.len() != batch.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: batch.len(),
                    actual: resp.embeddings.len(),
                });
            }
            out.extend(resp.embeddings.into_iter().map(|e| e.values));
        }
        debug!(model = %self.model, count = out.len(), "Embedded batch");
        Ok(out)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

impl GenerateResponse {
    fn into_text(self) -> Result<String, ModelError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ModelError::Blocked(reason));
        }
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or(ModelError::EmptyResponse)?;
        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return match candidate.finish_reason {
                Some(reason) if reason != "STOP" => Err(ModelError::Blocked(reason)),
                _ => Err(ModelError::EmptyResponse),
            };
        }
        Ok(text)
    }
}

/// Gemini generative model client.
#[derive(Clone)]
pub struct GeminiModel {
    client: GeminiClient,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl GeminiModel {
    pub fn new(
        settings: &GeminiSettings,
        model: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Result<Self, GeminiError> {
        Ok(Self {
            client: GeminiClient::new(settings)?,
            model: bare_model(model).to_string(),
            temperature,
            max_output_tokens,
        })
    }
}

#[async_trait]
impl GenerativeModel for GeminiModel {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        let url = self.client.model_url(&self.model, "generateContent");
        let body = GenerateRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part { text: prompt.to_string() }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        };
        let resp: GenerateResponse = self.client.post(&url, &body).await?;
        let text = resp.into_text()?;
        debug!(model = %self.model, chars = text.len(), "Model responded");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_missing_api_key() {
        let settings = GeminiSettings::new("  ");
        assert!(matches!(
            GeminiEmbedder::new(&settings, DEFAULT_EMBEDDING_MODEL),
            Err(GeminiError::MissingApiKey)
        ));
    }

    #[test]
    fn test_model_names() {
        assert_eq!(qualified_model("embedding-001"), "models/embedding-001");
        assert_eq!(qualified_model("models/embedding-001"), "models/embedding-001");
        assert_eq!(bare_model("models/gemini-2.5-pro"), "gemini-2.5-pro");

        let settings = GeminiSettings::new("key");
        let client = GeminiClient::new(&settings).unwrap();
        assert_eq!(
            client.model_url("gemini-2.5-pro", "generateContent"),
            format!("{}/models/gemini-2.5-pro:generateContent", DEFAULT_BASE_URL)
        );
    }

    #[test]
    fn test_embed_request_shape() {
        let request = EmbedRequest {
            model: "models/embedding-001".to_string(),
            content: Content::text("hello"),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "model": "models/embedding-001",
                "content": { "parts": [{ "text": "hello" }] }
            })
        );
    }

    #[test]
    fn test_generate_response_text() {
        let resp: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{ "text": "{\"Decision\":" }, { "text": " \"approved\"}" }]
                },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();
        assert_eq!(resp.into_text().unwrap(), "{\"Decision\": \"approved\"}");
    }

    #[test]
    fn test_generate_response_blocked() {
        let resp: GenerateResponse = serde_json::from_value(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        }))
        .unwrap();
        assert!(matches!(resp.into_text(), Err(ModelError::Blocked(r)) if r == "SAFETY"));

        let empty: GenerateResponse = serde_json::from_value(json!({ "candidates": [] })).unwrap();
        assert!(matches!(empty.into_text(), Err(ModelError::EmptyResponse)));
    }

    #[test]
    fn test_retry_policy() {
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!should_retry(StatusCode::BAD_REQUEST));
        let base = Duration::from_millis(500);
        assert_eq!(retry_backoff(base, 1), Duration::from_secs(1));
        assert!(retry_backoff(base, 2) > retry_backoff(base, 1));
        assert_eq!(retry_backoff(base, 9), retry_backoff(base, 5));
    }

    /// HTTP server on a loopback port answering each request with the next
    /// scripted `(status, body)`; the last one repeats. Returns the base URL
    /// and the number of requests served.
    async fn scripted_server(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::new(AtomicUsize::new(0));

        let counter = served.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                read_request(&mut socket).await;
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses[n.min(responses.len() - 1)];
                let reply = format!(
                    "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), served)
    }

    /// Consume one request: headers, then `Content-Length` bytes of body.
    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            let Some(header_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let content_length = text[..header_end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                return;
            }
        }
    }

    fn stub_settings(base_url: &str, max_retries: usize) -> GeminiSettings {
        let mut settings = GeminiSettings::new("test-key");
        settings.base_url = base_url.to_string();
        settings.max_retries = max_retries;
        settings.retry_base_delay = Duration::from_millis(1);
        settings
    }

    const EMBEDDING_BODY: &str = r#"{"embedding":{"values":[0.25,0.5,0.75]}}"#;

    #[tokio::test]
    async fn test_unavailable_is_retried_until_success() {
        let (url, served) =
            scripted_server(vec![(503, "{}"), (503, "{}"), (200, EMBEDDING_BODY)]).await;
        let embedder =
            GeminiEmbedder::new(&stub_settings(&url, 3), DEFAULT_EMBEDDING_MODEL).unwrap();

        let vector = embedder.embed("knee surgery").await.unwrap();
        assert_eq!(vector, vec![0.25, 0.5, 0.75]);
        assert_eq!(served.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (url, served) =
            scripted_server(vec![(400, r#"{"error":"bad request"}"#), (200, EMBEDDING_BODY)])
                .await;
        let embedder =
            GeminiEmbedder::new(&stub_settings(&url, 3), DEFAULT_EMBEDDING_MODEL).unwrap();

        let err = embedder.embed("knee surgery").await.unwrap_err();
        match err {
            EmbeddingError::Provider(message) => {
                assert!(message.contains("400"));
                assert!(message.contains("bad request"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_status() {
        let (url, served) = scripted_server(vec![(503, r#"{"error":"overloaded"}"#)]).await;
        let model = GeminiModel::new(&stub_settings(&url, 2), "gemini-2.5-pro", 0.0, 64).unwrap();

        let err = model.generate("Decide this claim").await.unwrap_err();
        match err {
            ModelError::Provider(message) => {
                assert!(message.contains("503"));
                assert!(message.contains("overloaded"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(served.load(Ordering::SeqCst), 2);
    }
}
