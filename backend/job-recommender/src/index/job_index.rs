//! Job-level view over the similarity index
//!
//! `JobIndex` pairs every vector with its job id. [`JobIndex::append`] is
//! the only way to grow the index, so the vector store and the position map
//! cannot drift apart. Older positions of a re-indexed job stay in the
//! structure and are filtered from results, as are expired jobs.

use super::{FlatIpIndex, PositionMap};
use crate::error::IndexError;
use crate::models::ScoredJob;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Index handle shared between the consumer loop and HTTP handlers.
/// Never hold the guard across an `.await`.
pub type SharedJobIndex = Arc<RwLock<JobIndex>>;

#[derive(Debug, Clone)]
pub struct JobIndex {
    name: String,
    vectors: FlatIpIndex,
    positions: PositionMap,
    expirations: HashMap<Uuid, DateTime<Utc>>,
}

impl JobIndex {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            vectors: FlatIpIndex::new(dimension),
            positions: PositionMap::new(),
            expirations: HashMap::new(),
        }
    }

    /// Assemble an index from decoded parts, checking that they agree
    pub fn from_parts(
        name: impl Into<String>,
        vectors: FlatIpIndex,
        positions: PositionMap,
    ) -> Result<Self, IndexError> {
        if vectors.len() != positions.len() {
            return Err(IndexError::Corrupt(format!(
                "index holds {} vectors but map holds {} entries",
                vectors.len(),
                positions.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            vectors,
            positions,
            expirations: HashMap::new(),
        })
    }

    pub fn into_shared(self) -> SharedJobIndex {
        Arc::new(RwLock::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn distinct_jobs(&self) -> usize {
        self.positions.distinct_jobs()
    }

    /// Add a job vector and record its position in one step
    pub fn append(
        &mut self,
        job_id: Uuid,
        vector: &[f32],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<usize, IndexError> {
        if vector.len() != self.dimension() {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension(),
                actual: vector.len(),
            });
        }
        let next = self.vectors.len();
        if self.positions.len() != next {
            return Err(IndexError::PositionOutOfOrder {
                expected: next,
                actual: self.positions.len(),
            });
        }

        let position = self.vectors.add(vector)?;
        self.positions.record(job_id, position)?;
        self.set_expiration(job_id, expires_at);
        Ok(position)
    }

    pub fn set_expiration(&mut self, job_id: Uuid, expires_at: Option<DateTime<Utc>>) {
        match expires_at {
            Some(at) => {
                self.expirations.insert(job_id, at);
            }
            None => {
                self.expirations.remove(&job_id);
            }
        }
    }

    pub fn expiration(&self, job_id: &Uuid) -> Option<DateTime<Utc>> {
        self.expirations.get(job_id).copied()
    }

    fn is_live(&self, job_id: &Uuid, now: DateTime<Utc>) -> bool {
        self.expirations
            .get(job_id)
            .map(|at| *at > now)
            .unwrap_or(true)
    }

    fn accepts(&self, position: usize, exclude: Option<&Uuid>, now: DateTime<Utc>) -> bool {
        if !self.positions.is_current(position) {
            return false;
        }
        match self.positions.job_id_of(position) {
            Some(job_id) => Some(&job_id) != exclude && self.is_live(&job_id, now),
            None => false,
        }
    }

    fn resolve(&self, hits: Vec<(usize, f32)>) -> Vec<ScoredJob> {
        hits.into_iter()
            .filter_map(|(position, score)| {
                self.positions
                    .job_id_of(position)
                    .map(|job_id| ScoredJob { job_id, score })
            })
            .collect()
    }

    /// Top-k live jobs for a query vector
    pub fn search_jobs(&self, query: &[f32], k: usize, now: DateTime<Utc>) -> Vec<ScoredJob> {
        let hits = self
            .vectors
            .search_filtered(query, k, |position| self.accepts(position, None, now));
        self.resolve(hits)
    }

    /// Top-k live jobs near an indexed job, never including the job itself
    ///
    /// Unknown jobs yield an empty list.
    pub fn related_jobs(&self, job_id: &Uuid, k: usize, now: DateTime<Utc>) -> Vec<ScoredJob> {
        let Some(query) = self.latest_vector(job_id) else {
            return Vec::new();
        };
        let hits = self.vectors.search_filtered(&query, k, |position| {
            self.accepts(position, Some(job_id), now)
        });
        self.resolve(hits)
    }

    /// Vector at the latest position recorded for `job_id`
    pub fn latest_vector(&self, job_id: &Uuid) -> Option<Vec<f32>> {
        self.positions
            .position_of(job_id)
            .and_then(|position| self.vectors.reconstruct(position))
    }

    pub fn contains(&self, job_id: &Uuid) -> bool {
        self.positions.position_of(job_id).is_some()
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.positions.job_ids().copied().collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        self.vectors.to_bytes()
    }

    pub fn map_entries_from(&self, start: usize) -> Vec<(usize, Uuid)> {
        self.positions.entries_from(start)
    }
}
