//! Exhaustive inner-product index
//!
//! Vectors are stored contiguously in insertion order. Search scores every
//! accepted position, so results are exact. With unit-normalized inputs the
//! inner product is the cosine similarity.

use crate::error::IndexError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatIpIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIpIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a vector and return its position
    pub fn add(&mut self, vector: &[f32]) -> Result<usize, IndexError> {
        self.check_dimension(vector)?;
        let position = self.len();
        self.data.extend_from_slice(vector);
        Ok(position)
    }

    /// Top-k positions by descending inner product, ties by ascending position
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        self.search_filtered(query, k, |_| true)
    }

    /// Same ranking as [`search`](Self::search) over the positions accepted by
    /// `accept`; still returns up to `k` accepted hits
    pub fn search_filtered<F>(&self, query: &[f32], k: usize, accept: F) -> Vec<(usize, f32)>
    where
        F: Fn(usize) -> bool,
    {
        if k == 0 || self.is_empty() || query.len() != self.dimension {
            return Vec::new();
        }

        let mut hits: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .filter(|(position, _)| accept(*position))
            .map(|(position, stored)| (position, inner_product(query, stored)))
            .collect();

        if hits.len() > k {
            hits.select_nth_unstable_by(k - 1, rank);
            hits.truncate(k);
        }
        hits.sort_by(rank);
        hits
    }

    /// Stored vector at `position`
    pub fn reconstruct(&self, position: usize) -> Option<Vec<f32>> {
        let start = position.checked_mul(self.dimension)?;
        let end = start.checked_add(self.dimension)?;
        self.data.get(start..end).map(<[f32]>::to_vec)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        bincode::serialize(self).map_err(|e| IndexError::Encode(e.to_string()))
    }

    /// Decode a blob produced by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        let index: Self =
            bincode::deserialize(bytes).map_err(|e| IndexError::Corrupt(e.to_string()))?;

        if index.dimension == 0 {
            return Err(IndexError::Corrupt("zero dimension".to_string()));
        }
        if index.data.len() % index.dimension != 0 {
            return Err(IndexError::Corrupt(format!(
                "{} floats is not a multiple of dimension {}",
                index.data.len(),
                index.dimension
            )));
        }
        Ok(index)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn rank(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}
