use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Embedding row for one job, the source of truth for index rebuilds
#[derive(Debug, Clone, PartialEq)]
pub struct JobEmbedding {
    pub job_id: Uuid,
    pub vector: Vec<f32>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl JobEmbedding {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Embedding row together with its last write time
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub embedding: JobEmbedding,
    pub updated_at: DateTime<Utc>,
}

/// A job scored against a query vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredJob {
    pub job_id: Uuid,
    pub score: f32,
}

/// Persisted recommendation, unique per (user_id, job_id)
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub user_id: Uuid,
    pub job_id: Uuid,
    pub similarity_score: f32,
    pub recommended_at: DateTime<Utc>,
}

/// Serialized index row as stored in `job_index`
#[derive(Debug, Clone)]
pub struct PersistedIndex {
    pub name: String,
    pub blob: Vec<u8>,
    pub entry_count: usize,
    /// Bumped by every successful save
    pub generation: i64,
    pub updated_at: DateTime<Utc>,
}

/// Row state after a successful save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedIndex {
    pub generation: i64,
    pub updated_at: DateTime<Utc>,
}

/// One persistence cycle: the full blob plus the map-log entries that
/// have not been written yet
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub name: String,
    pub blob: Vec<u8>,
    pub entry_count: usize,
    /// `(position, job_id)` pairs in position order
    pub map_entries: Vec<(usize, Uuid)>,
    /// Delete every stored map entry for `name` before inserting
    pub replace_map: bool,
    /// Only save if the stored row is still at this generation
    pub expected_generation: Option<i64>,
}

/// Job row from the backend tables that still lacks an embedding
#[derive(Debug, Clone)]
pub struct SourceJob {
    pub job_id: Uuid,
    pub text: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Candidate profile text from the backend tables
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub user_id: Uuid,
    pub text: String,
}
