//! Embedding sources
//!
//! Turn job and profile text into unit-normalized vectors of a fixed
//! dimension. Calls may be slow; callers must not hold the index lock
//! while awaiting them.

pub mod hash_embedder;
pub mod http_client;

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::EmbeddingError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub use hash_embedder::HashEmbedder;
pub use http_client::HttpEmbeddingClient;

#[async_trait]
pub trait EmbeddingSource: Send + Sync {
    /// Length of every vector this source returns
    fn dimension(&self) -> usize;

    /// Short name for logs
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// One vector per input, in input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Build the configured embedding source
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingSource>, EmbeddingError> {
    let source: Arc<dyn EmbeddingSource> = match config.provider {
        EmbeddingProvider::Http => Arc::new(HttpEmbeddingClient::new(config)?),
        EmbeddingProvider::Hash => Arc::new(HashEmbedder::new(config.dimension)),
    };
    Ok(source)
}

/// Embed a probe text once and check the returned dimension
pub async fn verify_dimension(
    source: &dyn EmbeddingSource,
    expected: usize,
) -> Result<(), EmbeddingError> {
    let probe = source.embed("dimension probe").await?;
    if probe.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: probe.len(),
        });
    }
    info!(source = source.name(), dimension = expected, "Embedding source verified");
    Ok(())
}

pub(crate) fn check_dimension(vector: &[f32], expected: usize) -> Result<(), EmbeddingError> {
    if vector.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}
