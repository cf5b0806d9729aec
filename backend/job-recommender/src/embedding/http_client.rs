//! Client for a text-embeddings inference server
//!
//! Sends `POST {url}/embed` with `{"inputs": [...], "normalize": true}` and
//! expects one vector per input.

use super::{check_dimension, EmbeddingSource};
use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    normalize: bool,
}

pub struct HttpEmbeddingClient {
    client: HttpClient,
    endpoint: String,
    dimension: usize,
    max_batch: usize,
}

impl HttpEmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/embed", config.url.trim_end_matches('/')),
            dimension: config.dimension,
            max_batch: config.max_batch.max(1),
        })
    }

    async fn post(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest {
                inputs,
                normalize: true,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let vectors: Vec<Vec<f32>> = response.json().await?;
        if vectors.len() != inputs.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: inputs.len(),
                actual: vectors.len(),
            });
        }
        for vector in &vectors {
            check_dimension(vector, self.dimension)?;
        }
        Ok(vectors)
    }

    async fn post_with_retry(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        resilience::with_retry_if(
            resilience::embedding_http(),
            EmbeddingError::is_transient,
            || self.post(inputs),
        )
        .await
        .map_err(|e| e.into_inner())
    }
}

#[async_trait]
impl EmbeddingSource for HttpEmbeddingClient {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "http"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let mut vectors = self.post_with_retry(&[text.to_string()]).await?;
        vectors.pop().ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            actual: 0,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.max_batch) {
            debug!(inputs = chunk.len(), "Requesting embeddings");
            vectors.extend(self.post_with_retry(chunk).await?);
        }
        Ok(vectors)
    }
}
