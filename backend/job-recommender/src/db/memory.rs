//! In-memory stores
//!
//! Behave like the PostgreSQL stores (upsert by key, ordered pages) and add
//! a few hooks for tests: scripted failures and call counters.

use super::{EmbeddingStore, IndexStore, RecommendationStore, SourceStore};
use crate::error::StoreError;
use crate::models::{
    IndexSnapshot, JobEmbedding, PersistedIndex, Recommendation, SavedIndex, SourceJob,
    SourceProfile, StoredEmbedding,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

fn injected_failure() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn page_limit(limit: i64) -> usize {
    usize::try_from(limit).unwrap_or(0)
}

#[derive(Default)]
pub struct InMemoryEmbeddingStore {
    rows: Mutex<BTreeMap<Uuid, StoredEmbedding>>,
    last_write: Mutex<Option<DateTime<Utc>>>,
    failures: AtomicUsize,
    batch_statements: AtomicUsize,
}

impl InMemoryEmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` upsert calls
    pub fn fail_next_upserts(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, job_id: &Uuid) -> Option<JobEmbedding> {
        self.rows.lock().get(job_id).map(|s| s.embedding.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Number of `upsert_batch` calls that wrote rows
    pub fn batch_statements(&self) -> usize {
        self.batch_statements.load(Ordering::SeqCst)
    }

    /// Strictly increasing write clock, like distinct commit timestamps
    fn next_write_time(&self) -> DateTime<Utc> {
        let mut last = self.last_write.lock();
        let now = Utc::now();
        let at = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(at);
        at
    }

    fn write(&self, embedding: &JobEmbedding) {
        let updated_at = self.next_write_time();
        self.rows.lock().insert(
            embedding.job_id,
            StoredEmbedding {
                embedding: embedding.clone(),
                updated_at,
            },
        );
    }
}

#[async_trait]
impl EmbeddingStore for InMemoryEmbeddingStore {
    async fn upsert(&self, embedding: &JobEmbedding) -> Result<(), StoreError> {
        if take_failure(&self.failures) {
            return Err(injected_failure());
        }
        self.write(embedding);
        Ok(())
    }

    async fn upsert_batch(&self, embeddings: &[JobEmbedding]) -> Result<u64, StoreError> {
        if take_failure(&self.failures) {
            return Err(injected_failure());
        }
        if embeddings.is_empty() {
            return Ok(0);
        }
        for embedding in embeddings {
            self.write(embedding);
        }
        self.batch_statements.fetch_add(1, Ordering::SeqCst);
        Ok(embeddings.len() as u64)
    }

    async fn load_page(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<JobEmbedding>, StoreError> {
        let rows = self.rows.lock();
        Ok(rows
            .values()
            .filter(|s| after.map(|a| s.embedding.job_id > a).unwrap_or(true))
            .take(page_limit(limit))
            .map(|s| s.embedding.clone())
            .collect())
    }

    async fn load_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredEmbedding>, StoreError> {
        let mut rows: Vec<StoredEmbedding> = self
            .rows
            .lock()
            .values()
            .filter(|s| s.updated_at > since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.embedding.job_id.cmp(&b.embedding.job_id))
        });
        Ok(rows)
    }

    async fn expirations(
        &self,
        job_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Option<DateTime<Utc>>>, StoreError> {
        let rows = self.rows.lock();
        Ok(job_ids
            .iter()
            .filter_map(|id| rows.get(id).map(|s| (*id, s.embedding.expires_at)))
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryIndexStore {
    blobs: Mutex<HashMap<String, PersistedIndex>>,
    maps: Mutex<HashMap<String, BTreeMap<usize, Uuid>>>,
    saves: AtomicUsize,
    failures: AtomicUsize,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_next_saves(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Store raw state as-is, bypassing snapshot checks
    pub fn put_raw(&self, index: PersistedIndex, map: Vec<(usize, Uuid)>) {
        self.maps
            .lock()
            .insert(index.name.clone(), map.into_iter().collect());
        self.blobs.lock().insert(index.name.clone(), index);
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn save(&self, snapshot: &IndexSnapshot) -> Result<SavedIndex, StoreError> {
        if take_failure(&self.failures) {
            return Err(injected_failure());
        }

        let updated_at = Utc::now();
        // Both tables under their locks at once, like a single transaction
        let mut blobs = self.blobs.lock();
        let mut maps = self.maps.lock();

        let current = blobs.get(&snapshot.name).map(|row| row.generation);
        if let Some(expected) = snapshot.expected_generation {
            if current != Some(expected) {
                return Err(StoreError::GenerationConflict {
                    name: snapshot.name.clone(),
                    expected,
                    found: current,
                });
            }
        }
        let generation = current.unwrap_or(0) + 1;

        blobs.insert(
            snapshot.name.clone(),
            PersistedIndex {
                name: snapshot.name.clone(),
                blob: snapshot.blob.clone(),
                entry_count: snapshot.entry_count,
                generation,
                updated_at,
            },
        );
        let map = maps.entry(snapshot.name.clone()).or_default();
        if snapshot.replace_map {
            map.clear();
        }
        map.extend(snapshot.map_entries.iter().copied());

        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(SavedIndex {
            generation,
            updated_at,
        })
    }

    async fn load(&self, name: &str) -> Result<Option<PersistedIndex>, StoreError> {
        Ok(self.blobs.lock().get(name).cloned())
    }

    async fn load_map(&self, name: &str) -> Result<Vec<(usize, Uuid)>, StoreError> {
        Ok(self
            .maps
            .lock()
            .get(name)
            .map(|m| m.iter().map(|(p, id)| (*p, *id)).collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryRecommendationStore {
    rows: Mutex<BTreeMap<(Uuid, Uuid), Recommendation>>,
}

impl InMemoryRecommendationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows for one user, best score first
    pub fn for_user(&self, user_id: &Uuid) -> Vec<Recommendation> {
        let mut rows: Vec<Recommendation> = self
            .rows
            .lock()
            .values()
            .filter(|r| r.user_id == *user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl RecommendationStore for InMemoryRecommendationStore {
    async fn upsert_batch(&self, recommendations: &[Recommendation]) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock();
        for rec in recommendations {
            rows.insert((rec.user_id, rec.job_id), rec.clone());
        }
        Ok(recommendations.len() as u64)
    }
}

/// Backend tables for backfill; jobs count as embedded once the linked
/// embedding store holds a row for them
pub struct InMemorySourceStore {
    jobs: Mutex<BTreeMap<Uuid, SourceJob>>,
    profiles: Mutex<BTreeMap<Uuid, SourceProfile>>,
    embeddings: Arc<InMemoryEmbeddingStore>,
}

impl InMemorySourceStore {
    pub fn new(embeddings: Arc<InMemoryEmbeddingStore>) -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            profiles: Mutex::new(BTreeMap::new()),
            embeddings,
        }
    }

    pub fn add_job(&self, job: SourceJob) {
        self.jobs.lock().insert(job.job_id, job);
    }

    pub fn add_profile(&self, profile: SourceProfile) {
        self.profiles.lock().insert(profile.user_id, profile);
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn load_unembedded_jobs(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SourceJob>, StoreError> {
        let jobs = self.jobs.lock();
        Ok(jobs
            .values()
            .filter(|j| after.map(|a| j.job_id > a).unwrap_or(true))
            .filter(|j| self.embeddings.get(&j.job_id).is_none())
            .take(page_limit(limit))
            .cloned()
            .collect())
    }

    async fn load_profiles(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SourceProfile>, StoreError> {
        let profiles = self.profiles.lock();
        Ok(profiles
            .values()
            .filter(|p| after.map(|a| p.user_id > a).unwrap_or(true))
            .filter(|p| !p.text.trim().is_empty())
            .take(page_limit(limit))
            .cloned()
            .collect())
    }
}
