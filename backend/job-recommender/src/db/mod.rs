//! Durable stores
//!
//! Each store is an async trait with a PostgreSQL implementation and an
//! in-memory implementation used by tests and offline runs.

pub mod embeddings_repo;
pub mod index_repo;
pub mod memory;
pub mod recommendations_repo;
pub mod sources_repo;

use crate::error::StoreError;
use crate::models::{
    IndexSnapshot, JobEmbedding, PersistedIndex, Recommendation, SavedIndex, SourceJob,
    SourceProfile, StoredEmbedding,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

pub use embeddings_repo::PgEmbeddingStore;
pub use index_repo::PgIndexStore;
pub use memory::{
    InMemoryEmbeddingStore, InMemoryIndexStore, InMemoryRecommendationStore, InMemorySourceStore,
};
pub use recommendations_repo::PgRecommendationStore;
pub use sources_repo::PgSourceStore;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply the bundled schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

/// Per-job embeddings keyed by job id
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Insert or overwrite one embedding row
    async fn upsert(&self, embedding: &JobEmbedding) -> Result<(), StoreError>;

    /// Insert or overwrite many rows with a single statement
    async fn upsert_batch(&self, embeddings: &[JobEmbedding]) -> Result<u64, StoreError>;

    /// Rows ordered by job id, strictly after `after`
    async fn load_page(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<JobEmbedding>, StoreError>;

    /// Rows written after `since`, ordered by `(updated_at, job_id)`
    async fn load_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredEmbedding>, StoreError>;

    /// Expiration of each known job; unknown ids are omitted
    async fn expirations(
        &self,
        job_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Option<DateTime<Utc>>>, StoreError>;
}

/// Serialized index blobs and their position-map logs, keyed by index name
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Write the blob and new map entries atomically and bump the generation
    ///
    /// With `expected_generation` set, the write is rejected with
    /// [`StoreError::GenerationConflict`] unless the stored row is still at
    /// that generation. A missing row counts as a conflict.
    async fn save(&self, snapshot: &IndexSnapshot) -> Result<SavedIndex, StoreError>;

    async fn load(&self, name: &str) -> Result<Option<PersistedIndex>, StoreError>;

    /// `(position, job_id)` pairs ordered by position
    async fn load_map(&self, name: &str) -> Result<Vec<(usize, Uuid)>, StoreError>;
}

/// Recommendation rows keyed by `(user_id, job_id)`
#[async_trait]
pub trait RecommendationStore: Send + Sync {
    async fn upsert_batch(&self, recommendations: &[Recommendation]) -> Result<u64, StoreError>;
}

/// Read access to the backend's job and profile tables
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Jobs without an embedding row, ordered by id, strictly after `after`
    async fn load_unembedded_jobs(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SourceJob>, StoreError>;

    /// Profiles with non-empty text, ordered by user id, strictly after `after`
    async fn load_profiles(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SourceProfile>, StoreError>;
}

/// Keep the last row per key so one statement never touches a row twice
pub(crate) fn dedupe_last<T, K, F>(rows: &[T], key: F) -> Vec<&T>
where
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut last: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        last.insert(key(row), i);
    }
    rows.iter()
        .enumerate()
        .filter(|(i, row)| last.get(&key(row)) == Some(i))
        .map(|(_, row)| row)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_last_keeps_order_and_latest() {
        let rows = vec![(1, "a"), (2, "b"), (1, "c"), (3, "d")];
        let kept = dedupe_last(&rows, |r| r.0);
        assert_eq!(kept, vec![&(2, "b"), &(1, "c"), &(3, "d")]);
    }
}
