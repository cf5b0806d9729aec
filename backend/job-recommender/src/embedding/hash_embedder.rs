//! Deterministic feature-hashing embedder
//!
//! Tokens and adjacent-token pairs are hashed into signed buckets with
//! SipHash-1-3 under fixed keys, then L2-normalized. Needs no model and
//! gives stable vectors across runs, which makes it suitable for offline
//! backfills and tests. Changing the keys or tokenization changes every
//! vector, so a rebuild of the index is required afterwards.

use super::EmbeddingSource;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use siphasher::sip::SipHasher13;
use std::hash::{Hash, Hasher};

const HASH_KEY_0: u64 = 0x6a6f_6269_745f_6b30;
const HASH_KEY_1: u64 = 0x6a6f_6269_745f_6b31;

/// Weight of an adjacent-token pair relative to a single token
const PAIR_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn hash(feature: &str, salt: u8) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(HASH_KEY_0, HASH_KEY_1);
        salt.hash(&mut hasher);
        feature.hash(&mut hasher);
        hasher.finish()
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let bucket = (Self::hash(feature, 0) % self.dimension as u64) as usize;
        let sign = if Self::hash(feature, 1) & 1 == 0 {
            1.0
        } else {
            -1.0
        };
        vector[bucket] += sign * weight;
    }

    /// Embed synchronously
    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        if tokens.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut vector = vec![0.0f32; self.dimension];
        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), PAIR_WEIGHT);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Err(EmbeddingError::EmptyInput);
        }
        for v in &mut vector {
            *v /= norm;
        }
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingSource for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_text(text)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed_text(t)).collect()
    }
}
