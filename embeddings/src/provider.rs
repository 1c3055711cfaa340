//! Embedding providers.
//!
//! A provider turns a batch of texts into vectors. Vectors need not be
//! normalized; the [`EmbeddingCache`](crate::EmbeddingCache) normalizes them
//! before they are stored or indexed.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Identifier of the model producing the vectors.
    fn model_id(&self) -> &str;

    /// Model parameters that change the produced vectors.
    ///
    /// Part of every cache fingerprint, so two configurations that embed
    /// differently never share cache entries.
    fn parameters(&self) -> String {
        String::new()
    }

    /// Embedding dimension, when known up front.
    fn dimension(&self) -> Option<usize>;

    /// Embed a batch of texts, returning one vector per text in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Check if the provider is available (API key set, etc.).
    fn is_available(&self) -> bool;
}

/// Embedding provider for OpenAI-compatible `/embeddings` endpoints.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Model name sent with every request.
    model: String,

    /// Requested output dimensions (if supported by the model).
    dimensions: Option<usize>,

    /// Maximum texts per request.
    batch_size: usize,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider using `OPENAI_API_KEY`.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
            batch_size: 32,
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Request a specific output dimension.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Set the maximum number of texts sent per request.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn embed_request(&self, api_key: &str, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut body = serde_json::json!({
            "input": texts,
            "model": self.model
        });

        if let Some(dims) = self.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest(format!(
                "API error ({status}): {error_text}"
            )));
        }

        let mut result: OpenAIEmbeddingResponse = response.json().await?;
        if result.data.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.data.len()
            )));
        }

        result.data.sort_by_key(|item| item.index);
        Ok(result.data.into_iter().map(|item| item.embedding).collect())
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn parameters(&self) -> String {
        match self.dimensions {
            Some(dims) => format!("dimensions={dims}"),
            None => String::new(),
        }
    }

    fn dimension(&self) -> Option<usize> {
        self.dimensions.or(match self.model.as_str() {
            "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
            "text-embedding-3-large" => Some(3072),
            _ => None,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let api_key = self.api_key.as_ref().ok_or_else(|| {
            EmbeddingError::ProviderNotConfigured("no API key for openai embeddings".to_string())
        })?;

        debug!(
            "Generating embeddings for {} texts with model: {}",
            texts.len(),
            self.model
        );

        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            embeddings.extend(self.embed_request(api_key, batch).await?);
        }

        info!("Generated {} embeddings", embeddings.len());
        Ok(embeddings)
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Offline feature-hashing embedder.
///
/// Each lowercased alphanumeric word is hashed into one of `dimension`
/// buckets with a hash-derived sign. Texts sharing words get similar vectors;
/// identical texts get identical vectors. Needs no network or model files.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
}

impl HashingProvider {
    /// Model identifier recorded in fingerprints.
    pub const MODEL_ID: &'static str = "feature-hashing-v1";

    /// Create a provider producing vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase);

        for word in words {
            let digest = Sha256::digest(word.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        vector
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn model_id(&self) -> &str {
        Self::MODEL_ID
    }

    fn parameters(&self) -> String {
        format!("dimension={}", self.dimension)
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    /// Responds with one embedding per input, listed in reverse index order.
    fn echo_embeddings(request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let count = body["input"].as_array().unwrap().len();
        let data: Vec<serde_json::Value> = (0..count)
            .rev()
            .map(|i| serde_json::json!({ "embedding": [i as f32, 1.0], "index": i }))
            .collect();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": data,
            "model": "text-embedding-3-small"
        }))
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_openai_batches_and_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(echo_embeddings)
            .expect(2)
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("test-key")
            .with_base_url(server.uri())
            .with_batch_size(2);

        let vectors = provider.embed(&texts(&["a", "b", "c"])).await.unwrap();
        assert_eq!(vectors, vec![vec![0.0, 1.0], vec![1.0, 1.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_openai_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("k")
            .with_base_url(server.uri());

        let err = provider.embed(&texts(&["a"])).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::RateLimited { retry_after_secs: 7 }));
        assert!(err.is_provider_failure());
    }

    #[tokio::test]
    async fn test_openai_wrong_count_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "embedding": [1.0], "index": 0 }]
            })))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("k")
            .with_base_url(server.uri());

        let result = provider.embed(&texts(&["a", "b"])).await;
        assert!(matches!(result, Err(EmbeddingError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_openai_without_key() {
        let mut provider = OpenAIProvider::new();
        provider.api_key = None;
        assert!(!provider.is_available());

        let result = provider.embed(&texts(&["a"])).await;
        assert!(matches!(result, Err(EmbeddingError::ProviderNotConfigured(_))));
    }

    #[test]
    fn test_openai_dimensions_and_parameters() {
        let provider = OpenAIProvider::new().with_model("text-embedding-3-large");
        assert_eq!(provider.dimension(), Some(3072));
        assert_eq!(provider.parameters(), "");

        let provider = provider.with_dimensions(256);
        assert_eq!(provider.dimension(), Some(256));
        assert_eq!(provider.parameters(), "dimensions=256");
    }

    #[tokio::test]
    async fn test_hashing_provider_is_deterministic() {
        let provider = HashingProvider::new(64);
        let vectors = provider
            .embed(&texts(&["Rust is fast", "rust IS fast!", "something else"]))
            .await
            .unwrap();

        assert_eq!(vectors[0].len(), 64);
        assert_eq!(vectors[0], vectors[1]);
        assert_ne!(vectors[0], vectors[2]);
    }

    #[tokio::test]
    async fn test_hashing_provider_empty_text() {
        let vectors = HashingProvider::new(8).embed(&texts(&[""])).await.unwrap();
        assert_eq!(vectors, vec![vec![0.0; 8]]);
    }
}
