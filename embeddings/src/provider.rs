//! Embedding providers.
//!
//! A provider is a black-box `text -> vector` function. Failures are reported
//! through [`EmbeddingError`] so the adapter can tell transient problems from
//! permanent ones.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::Embedding;
use crate::config::ProviderConfig;
use crate::error::{EmbeddingError, Result};
use crate::similarity::normalize;

/// Request for generating embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Text to embed.
    pub text: String,

    /// Model to use (provider-specific).
    pub model: Option<String>,

    /// Dimensions for the output (if supported by provider).
    pub dimensions: Option<usize>,
}

impl EmbeddingRequest {
    /// Create a new embedding request.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
            dimensions: None,
        }
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the output dimensions.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }
}

/// Response from embedding generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// The generated embedding.
    pub embedding: Embedding,

    /// Model used to generate the embedding.
    pub model: String,

    /// Dimension of the embedding.
    pub dimension: usize,

    /// Token usage (if available).
    pub tokens_used: Option<u64>,
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Get the default model for this provider.
    fn default_model(&self) -> &str;

    /// Get the default embedding dimension.
    fn default_dimension(&self) -> usize;

    /// Generate an embedding for the given text.
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Check if the provider is available (API key set, etc.).
    fn is_available(&self) -> bool;
}

/// OpenAI-compatible embedding provider.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Default model.
    default_model: String,

    /// Dimensions to request, if any.
    dimensions: Option<usize>,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            default_model: "text-embedding-3-small".to_string(),
            dimensions: None,
        }
    }

    /// Build a provider from configuration.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            default_model: config.model.clone(),
            dimensions: config.request_dimensions.then_some(config.dimension),
        })
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
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

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn default_dimension(&self) -> usize {
        if let Some(dimensions) = self.dimensions {
            return dimensions;
        }
        match self.default_model.as_str() {
            "text-embedding-3-small" => 1536,
            "text-embedding-3-large" => 3072,
            "text-embedding-ada-002" => 1536,
            _ => 1536,
        }
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EmbeddingError::ProviderNotConfigured)?;

        let model = request.model.unwrap_or_else(|| self.default_model.clone());

        debug!("Generating embedding with model: {model}");

        let mut body = serde_json::json!({
            "input": request.text,
            "model": model
        });

        if let Some(dims) = request.dimensions.or(self.dimensions) {
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

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok());
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &error_text));
        }

        let result: OpenAIEmbeddingResponse = response.json().await?;

        let embedding = result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Fatal("no embedding in response".to_string()))?
            .embedding;

        let dimension = embedding.len();
        let tokens_used = result.usage.map(|u| u.total_tokens);

        info!("Generated embedding with {dimension} dimensions");

        Ok(EmbeddingResponse {
            embedding,
            model: result.model,
            dimension,
            tokens_used,
        })
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Map a non-success HTTP status to the provider error taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> EmbeddingError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => EmbeddingError::RateLimited {
            retry_after_secs: retry_after,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => EmbeddingError::Timeout,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            EmbeddingError::Fatal(format!("{status}: {body}"))
        }
        s if s.is_server_error() => EmbeddingError::ApiRequest(format!("{status}: {body}")),
        s if s.is_client_error() => EmbeddingError::InvalidInput(format!("{status}: {body}")),
        _ => EmbeddingError::Fatal(format!("unexpected status {status}: {body}")),
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
    model: String,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: u64,
}

/// Deterministic offline provider.
///
/// Vectors are derived from a SHA-256 stream over the model and text, then
/// normalized. Identical inputs always give identical vectors.
pub struct HashProvider {
    model: String,
    dimension: usize,
    latency: Option<Duration>,
}

impl HashProvider {
    /// Create a hash provider producing `dimension`-sized vectors.
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
            latency: None,
        }
    }

    /// Sleep this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn vector_for(&self, text: &str, model: &str) -> Embedding {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut block = 0u32;
        while vector.len() < self.dimension {
            let digest = Sha256::new()
                .chain_update(model.as_bytes())
                .chain_update([0u8])
                .chain_update(text.as_bytes())
                .chain_update(block.to_le_bytes())
                .finalize();
            for chunk in digest.chunks_exact(2) {
                if vector.len() == self.dimension {
                    break;
                }
                let raw = u16::from_le_bytes([chunk[0], chunk[1]]);
                vector.push(f32::from(raw) / f32::from(u16::MAX) * 2.0 - 1.0);
            }
            block += 1;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn name(&self) -> &str {
        "hash"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn default_dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let model = request.model.unwrap_or_else(|| self.model.clone());
        let embedding = self.vector_for(&request.text, &model);

        Ok(EmbeddingResponse {
            dimension: embedding.len(),
            embedding,
            model,
            tokens_used: Some(request.text.split_whitespace().count() as u64),
        })
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
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> OpenAIProvider {
        let config = ProviderConfig::new("text-embedding-3-small", 3)
            .with_api_key("sk-test")
            .with_base_url(server.uri());
        OpenAIProvider::from_config(&config).unwrap()
    }

    #[test]
    fn test_embedding_request() {
        let request = EmbeddingRequest::new("Hello world")
            .with_model("text-embedding-3-small")
            .with_dimensions(512);

        assert_eq!(request.text, "Hello world");
        assert_eq!(request.model, Some("text-embedding-3-small".to_string()));
        assert_eq!(request.dimensions, Some(512));
    }

    #[test]
    fn test_openai_provider_default_dimensions() {
        let provider = OpenAIProvider::new().with_model("text-embedding-3-large");
        assert_eq!(provider.default_dimension(), 3072);
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(3), ""),
            EmbeddingError::RateLimited {
                retry_after_secs: Some(3)
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, None, ""),
            EmbeddingError::Timeout
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            EmbeddingError::ApiRequest(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "too long"),
            EmbeddingError::InvalidInput(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            EmbeddingError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_openai_embed_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}],
                "model": "text-embedding-3-small",
                "usage": {"prompt_tokens": 2, "total_tokens": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider_for(&server)
            .embed(EmbeddingRequest::new("hello there"))
            .await
            .unwrap();

        assert_eq!(response.embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(response.dimension, 3);
        assert_eq!(response.tokens_used, Some(2));
    }

    #[tokio::test]
    async fn test_openai_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .embed(EmbeddingRequest::new("hello"))
            .await
            .unwrap_err();

        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[tokio::test]
    async fn test_openai_missing_key() {
        let config = ProviderConfig::new("text-embedding-3-small", 3);
        let provider = OpenAIProvider::from_config(&config).unwrap();

        assert!(!provider.is_available());
        let err = provider
            .embed(EmbeddingRequest::new("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::ProviderNotConfigured));
    }

    #[tokio::test]
    async fn test_hash_provider_is_deterministic() {
        let provider = HashProvider::new("hash-model", 16);

        let a = provider.embed(EmbeddingRequest::new("same text")).await.unwrap();
        let b = provider.embed(EmbeddingRequest::new("same text")).await.unwrap();
        let c = provider.embed(EmbeddingRequest::new("other text")).await.unwrap();

        assert_eq!(a.embedding.len(), 16);
        assert_eq!(a.embedding, b.embedding);
        assert!(a.embedding != c.embedding);
    }
}
