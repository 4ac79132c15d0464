//! Embedding client: `text -> fixed-dim vector` over an HTTP inference
//! service, with retry, timeout, and rate limiting in front of every call.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub dimension: usize,
}

/// Capability set for embedding providers. Tests substitute stubs.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn model_info(&self) -> ModelInfo;

    /// Check a vector against this model's contract.
    fn validate(&self, embedding: &[f32]) -> Result<()> {
        let want = self.model_info().dimension;
        if embedding.len() != want {
            return Err(Error::EmbeddingGeneration(format!(
                "expected {want} dimensions, got {}",
                embedding.len()
            )));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(Error::EmbeddingGeneration("non-finite component".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
    policy: RetryPolicy,
    limiter: Arc<RateLimiter>,
}

impl HttpEmbedder {
    pub fn new(cfg: &ClusterConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.request_timeout())
            .pool_max_idle_per_host(cfg.idle_connections)
            .pool_idle_timeout(cfg.idle_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("embedder client: {e}")))?;
        Ok(Self {
            client,
            endpoint: cfg.embedding_endpoint.clone(),
            model: cfg.embedding_model.clone(),
            dimension: cfg.embedding_dimension,
            policy: RetryPolicy::new(cfg.max_retries, cfg.retry_delay()),
            limiter,
        })
    }

    async fn call_once(&self, text: &str) -> Result<Vec<f32>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "model": self.model, "input": text }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Error::from_status(status.as_u16(), "embedding service", retry_after));
        }

        let body: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| Error::EmbeddingGeneration(format!("response parse: {e}")))?;
        Ok(body.embedding)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::Validation("cannot embed empty text".into()));
        }
        self.limiter.acquire("embedder").await;
        let embedding = self.policy.run(|| self.call_once(text)).await.map_err(|e| {
            if e.retryable() {
                Error::EmbeddingGeneration(e.to_string())
            } else {
                e
            }
        })?;
        self.validate(&embedding)?;
        Ok(embedding)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo { name: self.model.clone(), dimension: self.dimension }
    }
}
