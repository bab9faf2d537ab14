//! Chroma backend
//!
//! Direct HTTP client for Chroma's REST API (v1) plus the [`ChromaStore`]
//! adapter. Each namespace is one collection named `<prefix><namespace>`,
//! created with cosine space and the embedding dimension in its metadata.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{check_dimensions, ScoredChunk, StoreError, VectorRecord, VectorStore};

/// Collection metadata key holding the embedding dimension
const DIMENSION_KEY: &str = "dimension";

/// Chroma collection name length limits
const MIN_COLLECTION_NAME: usize = 3;
const MAX_COLLECTION_NAME: usize = 63;

#[derive(Error, Debug)]
pub enum ChromaError {
    #[error("Chroma HTTP error: {0}")]
    Http(String),
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    #[error("Chroma server not available")]
    ServerUnavailable,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl From<reqwest::Error> for ChromaError {
    fn from(e: reqwest::Error) -> Self {
        ChromaError::Http(e.to_string())
    }
}

/// Chroma collection info returned by API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: String,
    pub name: String,
    pub metadata: Option<Value>,
}

impl CollectionInfo {
    /// Dimension recorded at creation, if any
    pub fn recorded_dimension(&self) -> Option<usize> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(DIMENSION_KEY))
            .and_then(|v| v.as_u64())
            .map(|d| d as usize)
    }
}

/// Result from a query operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChromaQueryResult {
    pub ids: Vec<Vec<String>>,
    pub documents: Option<Vec<Vec<Option<String>>>>,
    pub metadatas: Option<Vec<Vec<Option<Value>>>>,
    pub distances: Option<Vec<Vec<f32>>>,
}

/// Chroma HTTP client
#[derive(Clone)]
pub struct ChromaClient {
    http: Client,
    base_url: String,
    tenant: String,
    database: String,
}

impl ChromaClient {
    pub fn new(base_url: &str, timeout: Duration, connect_timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tenant: "default_tenant".to_string(),
            database: "default_database".to_string(),
        }
    }

    /// Health check — returns nanosecond heartbeat if healthy
    pub async fn heartbeat(&self) -> Result<i64, ChromaError> {
        debug!("Chroma heartbeat check");
        let resp = self
            .http
            .get(format!("{}/api/v1/heartbeat", self.base_url))
            .send()
            .await
            .map_err(|_| ChromaError::ServerUnavailable)?;

        if !resp.status().is_success() {
            return Err(ChromaError::ServerUnavailable);
        }

        let body: Value = resp.json().await?;
        Ok(body["nanosecond heartbeat"].as_i64().unwrap_or(0))
    }

    fn collections_url(&self) -> String {
        format!(
            "{}/api/v1/tenants/{}/databases/{}/collections",
            self.base_url, self.tenant, self.database
        )
    }

    /// Get or create a collection by name
    pub async fn get_or_create_collection(
        &self,
        name: &str,
        metadata: Option<Value>,
    ) -> Result<CollectionInfo, ChromaError> {
        let mut body = json!({
            "name": name,
            "get_or_create": true,
        });
        if let Some(meta) = metadata {
            body["metadata"] = meta;
        }

        let resp = self.http.post(self.collections_url()).json(&body).send().await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            error!(name = %name, status = %status, "Collection get_or_create failed");
            return Err(ChromaError::Http(format!(
                "Create collection failed ({}): {}",
                status, text
            )));
        }

        debug!(name = %name, "Collection get_or_create");
        serde_json::from_str(&text)
            .map_err(|e| ChromaError::Deserialize(format!("{}: {}", e, text)))
    }

    /// Get a collection by name (read-only, does not create)
    pub async fn get_collection(&self, name: &str) -> Result<CollectionInfo, ChromaError> {
        let collections = self.list_collections().await?;
        collections
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ChromaError::CollectionNotFound(name.to_string()))
    }

    /// Delete a collection by name
    pub async fn delete_collection(&self, name: &str) -> Result<(), ChromaError> {
        let resp = self
            .http
            .delete(format!("{}/{}", self.collections_url(), name))
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 404 {
            warn!(name = %name, "Collection already deleted (404)");
            Ok(())
        } else if status.is_success() {
            info!(name = %name, "Deleted collection");
            Ok(())
        } else {
            let text = resp.text().await.unwrap_or_default();
            // Older servers answer 500 with a "does not exist" message
            if text.contains("does not exist") {
                warn!(name = %name, "Collection already deleted");
                return Ok(());
            }
            Err(ChromaError::Http(format!("Delete collection failed ({}): {}", status, text)))
        }
    }

    /// List all collections
    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>, ChromaError> {
        let resp = self.http.get(self.collections_url()).send().await?;

        if !resp.status().is_success() {
            return Err(ChromaError::Http(format!(
                "List collections failed: {}",
                resp.status()
            )));
        }

        resp.json().await.map_err(|e| ChromaError::Deserialize(e.to_string()))
    }

    /// Upsert records (insert or update)
    pub async fn upsert(
        &self,
        collection_id: &str,
        ids: Vec<String>,
        documents: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        metadatas: Vec<Value>,
    ) -> Result<(), ChromaError> {
        if ids.is_empty() {
            return Err(ChromaError::InvalidInput("ids cannot be empty".to_string()));
        }

        let count = ids.len();
        let body = json!({
            "ids": ids,
            "documents": documents,
            "embeddings": embeddings,
            "metadatas": metadatas,
        });

        let resp = self
            .http
            .post(format!("{}/api/v1/collections/{}/upsert", self.base_url, collection_id))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "Chroma HTTP error");
            return Err(ChromaError::Http(format!("Upsert failed: {}", text)));
        }

        debug!(collection = %collection_id, count = count, "Upserted documents");
        Ok(())
    }

    /// Query a collection by embedding
    pub async fn query(
        &self,
        collection_id: &str,
        query_embedding: &[f32],
        n_results: u32,
    ) -> Result<ChromaQueryResult, ChromaError> {
        let body = json!({
            "query_embeddings": [query_embedding],
            "n_results": n_results,
            "include": ["documents", "metadatas", "distances"],
        });

        debug!(collection = %collection_id, n_results = n_results, "Querying collection");
        let resp = self
            .http
            .post(format!("{}/api/v1/collections/{}/query", self.base_url, collection_id))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "Chroma HTTP error");
            return Err(ChromaError::Http(format!("Query failed: {}", text)));
        }

        resp.json().await.map_err(|e| ChromaError::Deserialize(e.to_string()))
    }

    /// Count records in a collection
    pub async fn count(&self, collection_id: &str) -> Result<u32, ChromaError> {
        let resp = self
            .http
            .get(format!("{}/api/v1/collections/{}/count", self.base_url, collection_id))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ChromaError::Http(format!("Count failed: {}", resp.status())));
        }

        let result: u32 = resp.json().await.map_err(|e| ChromaError::Deserialize(e.to_string()))?;
        debug!(collection = %collection_id, count = result, "Collection count");
        Ok(result)
    }
}

/// Build metadata for a stored chunk
fn chunk_metadata(record: &VectorRecord) -> Value {
    json!({
        "source": record.chunk.source,
        "chunk_index": record.chunk.index as i64,
        "start_pos": record.chunk.start_pos as i64,
        "end_pos": record.chunk.end_pos as i64,
        "namespace": record.chunk.namespace.as_deref().unwrap_or_default(),
    })
}

/// Flatten the first query's hits. Chroma cosine distance is `1 - similarity`.
fn scored_chunks(result: ChromaQueryResult) -> Vec<ScoredChunk> {
    let Some(ids) = result.ids.into_iter().next() else {
        return Vec::new();
    };
    let documents = result.documents.and_then(|d| d.into_iter().next()).unwrap_or_default();
    let metadatas = result.metadatas.and_then(|m| m.into_iter().next()).unwrap_or_default();
    let distances = result.distances.and_then(|d| d.into_iter().next()).unwrap_or_default();

    ids.into_iter()
        .enumerate()
        .map(|(i, id)| {
            let metadata = metadatas.get(i).cloned().flatten();
            let source = metadata
                .as_ref()
                .and_then(|m| m.get("source"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let chunk_index = metadata
                .as_ref()
                .and_then(|m| m.get("chunk_index"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as u32;
            let distance = distances.get(i).copied().unwrap_or(1.0);

            ScoredChunk {
                id,
                source,
                chunk_index,
                content: documents.get(i).cloned().flatten().unwrap_or_default(),
                score: 1.0 - distance,
            }
        })
        .collect()
}

/// [`VectorStore`] over a Chroma server.
pub struct ChromaStore {
    client: ChromaClient,
    prefix: String,
    dimension: usize,
}

impl ChromaStore {
    pub fn new(client: ChromaClient, prefix: impl Into<String>, dimension: usize) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            dimension,
        }
    }

    pub fn collection_name(&self, namespace: &str) -> Result<String, StoreError> {
        let valid_chars = namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if namespace.is_empty() || !valid_chars {
            return Err(StoreError::InvalidInput(format!(
                "namespace '{}' must be non-empty and use only [A-Za-z0-9._-]",
                namespace
            )));
        }
        let name = format!("{}{}", self.prefix, namespace);
        if !(MIN_COLLECTION_NAME..=MAX_COLLECTION_NAME).contains(&name.len()) {
            return Err(StoreError::InvalidInput(format!(
                "collection name '{}' must be {}-{} characters",
                name, MIN_COLLECTION_NAME, MAX_COLLECTION_NAME
            )));
        }
        Ok(name)
    }

    fn check_collection(&self, collection: &CollectionInfo) -> Result<(), StoreError> {
        match collection.recorded_dimension() {
            Some(actual) if actual != self.dimension => Err(StoreError::IndexDimension {
                location: format!("chroma collection '{}'", collection.name),
                expected: self.dimension,
                actual,
            }),
            _ => Ok(()),
        }
    }

    /// Drop every collection under this store's prefix, whatever dimension
    /// it was built with. Returns the namespaces removed.
    pub async fn reset(&self) -> Result<Vec<String>, StoreError> {
        let mut removed = Vec::new();
        for collection in self.client.list_collections().await? {
            let Some(namespace) = collection.name.strip_prefix(&self.prefix) else {
                continue;
            };
            self.client.delete_collection(&collection.name).await?;
            removed.push(namespace.to_string());
        }
        removed.sort();
        info!(prefix = %self.prefix, removed = removed.len(), "Reset Chroma collections");
        Ok(removed)
    }

    /// Existing collection for a namespace, if any
    async fn find(&self, namespace: &str) -> Result<Option<CollectionInfo>, StoreError> {
        let name = self.collection_name(namespace)?;
        match self.client.get_collection(&name).await {
            Ok(c) => {
                self.check_collection(&c)?;
                Ok(Some(c))
            }
            Err(ChromaError::CollectionNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl VectorStore for ChromaStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn count(&self, namespace: &str) -> Result<usize, StoreError> {
        match self.find(namespace).await? {
            Some(c) => Ok(self.client.count(&c.id).await? as usize),
            None => Ok(0),
        }
    }

    async fn upsert(
        &self,
        namespace: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, StoreError> {
        check_dimensions(namespace, self.dimension, records.iter().map(|r| &r.embedding))?;
        if records.is_empty() {
            return Ok(0);
        }

        let name = self.collection_name(namespace)?;
        let metadata = json!({ "hnsw:space": "cosine", DIMENSION_KEY: self.dimension });
        let collection = self.client.get_or_create_collection(&name, Some(metadata)).await?;
        self.check_collection(&collection)?;

        let count = records.len();
        let mut ids = Vec::with_capacity(count);
        let mut documents = Vec::with_capacity(count);
        let mut embeddings = Vec::with_capacity(count);
        let mut metadatas = Vec::with_capacity(count);
        for record in records {
            metadatas.push(chunk_metadata(&record));
            ids.push(record.id);
            documents.push(record.chunk.content);
            embeddings.push(record.embedding);
        }

        self.client
            .upsert(&collection.id, ids, documents, embeddings, metadatas)
            .await?;
        info!(namespace = %namespace, collection = %name, count = count, "Upserted vectors");
        Ok(count)
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                namespace: namespace.to_string(),
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let Some(collection) = self.find(namespace).await? else {
            return Ok(Vec::new());
        };

        let count = self.client.count(&collection.id).await?;
        if count == 0 || top_k == 0 {
            return Ok(Vec::new());
        }

        // Don't request more than exist
        let n_results = (top_k as u32).min(count);
        let result = self.client.query(&collection.id, vector, n_results).await?;
        Ok(scored_chunks(result))
    }

    async fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        let name = self.collection_name(namespace)?;
        self.client.delete_collection(&name).await?;
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .client
            .list_collections()
            .await?
            .into_iter()
            .filter_map(|c| c.name.strip_prefix(&self.prefix).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ChromaStore {
        let client = ChromaClient::new(
            "http://127.0.0.1:8000/",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        ChromaStore::new(client, "claimwise_", 768)
    }

    #[test]
    fn test_collection_name() {
        let store = store();
        assert_eq!(store.collection_name("s1").unwrap(), "claimwise_s1");
        assert!(store.collection_name("").is_err());
        assert!(store.collection_name("has space").is_err());
        assert!(store.collection_name(&"x".repeat(80)).is_err());
    }

    #[test]
    fn test_recorded_dimension_mismatch() {
        let store = store();
        let info = CollectionInfo {
            id: "c1".to_string(),
            name: "claimwise_s1".to_string(),
            metadata: Some(json!({ "hnsw:space": "cosine", "dimension": 1536 })),
        };
        let err = store.check_collection(&info).unwrap_err();
        assert!(matches!(
            err,
            StoreError::IndexDimension { expected: 768, actual: 1536, .. }
        ));

        let legacy = CollectionInfo { metadata: None, ..info };
        assert!(store.check_collection(&legacy).is_ok());
    }

    #[test]
    fn test_scored_chunks_from_query_result() {
        let result = ChromaQueryResult {
            ids: vec![vec!["s1_a_0".to_string(), "s1_a_4".to_string()]],
            documents: Some(vec![vec![Some("first".to_string()), None]]),
            metadatas: Some(vec![vec![
                Some(json!({ "source": "a", "chunk_index": 0 })),
                Some(json!({ "source": "a", "chunk_index": 4 })),
            ]]),
            distances: Some(vec![vec![0.25, 0.5]]),
        };

        let hits = scored_chunks(result);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "first");
        assert!((hits[0].score - 0.75).abs() < 1e-6);
        assert_eq!(hits[1].chunk_index, 4);
        assert_eq!(hits[1].content, "");
    }

    #[test]
    fn test_scored_chunks_empty() {
        assert!(scored_chunks(ChromaQueryResult::default()).is_empty());
    }
}
