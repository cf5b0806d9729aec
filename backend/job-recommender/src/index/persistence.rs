//! Index persistence
//!
//! The index blob and the position-map log are written together in one
//! store transaction, at most once per configured interval. Only map
//! entries added since the last successful write are sent, except after a
//! fallback or rebuild where the whole log replaces the stored one.
//!
//! Incremental writes are conditional on the stored generation. If another
//! writer replaced the row since this process loaded or last saved it, the
//! stored map no longer lines up with the in-memory positions, so the write
//! is repeated as a full replace of both blob and map.

use super::{FlatIpIndex, JobIndex, PositionMap, SharedJobIndex};
use crate::db::{EmbeddingStore, IndexStore};
use crate::error::{IndexError, ServiceError, StoreError};
use crate::metrics;
use crate::models::IndexSnapshot;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of reading a persisted index at startup
#[derive(Debug)]
pub enum IndexLoad {
    Loaded {
        index: JobIndex,
        generation: i64,
        persisted_at: DateTime<Utc>,
    },
    Missing,
    Corrupt {
        reason: &'static str,
        detail: String,
    },
}

#[derive(Debug)]
struct PersistState {
    last_persist: Option<Instant>,
    persisted_entries: usize,
    replace_map: bool,
    /// Generation of the stored row this process last read or wrote
    generation: Option<i64>,
}

pub struct IndexPersistence {
    store: Arc<dyn IndexStore>,
    interval: Duration,
    state: Mutex<PersistState>,
}

impl IndexPersistence {
    /// Persistence for an index that has no trustworthy stored map
    pub fn new(store: Arc<dyn IndexStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            state: Mutex::new(PersistState {
                last_persist: None,
                persisted_entries: 0,
                replace_map: true,
                generation: None,
            }),
        }
    }

    /// Persistence for an index loaded with `persisted_entries` stored map
    /// entries from a row at `generation`
    pub fn resume(
        store: Arc<dyn IndexStore>,
        interval: Duration,
        persisted_entries: usize,
        generation: i64,
    ) -> Self {
        Self {
            store,
            interval,
            state: Mutex::new(PersistState {
                last_persist: None,
                persisted_entries,
                replace_map: false,
                generation: Some(generation),
            }),
        }
    }

    /// Next persist rewrites the whole map log
    pub fn require_full_map(&self) {
        self.state.lock().replace_map = true;
    }

    pub fn is_due(&self) -> bool {
        let state = self.state.lock();
        match state.last_persist {
            Some(at) => at.elapsed() > self.interval,
            None => true,
        }
    }

    /// Whether the index holds entries the store has not seen yet
    pub fn has_unsaved(&self, index: &SharedJobIndex) -> bool {
        let state = self.state.lock();
        state.replace_map || index.read().len() != state.persisted_entries
    }

    /// Write the index now
    pub async fn persist(&self, index: &SharedJobIndex) -> Result<(), ServiceError> {
        let mut snapshot = self.snapshot(index)?;
        let mut result = self.store.save(&snapshot).await;

        let conflict = match &result {
            Err(StoreError::GenerationConflict {
                expected, found, ..
            }) => Some((*expected, *found)),
            _ => None,
        };
        if let Some((expected, found)) = conflict {
            metrics::record_persist("conflict");
            warn!(
                index = %snapshot.name,
                expected,
                found = ?found,
                "Stored job index was rewritten by another writer; replacing it with the in-memory index"
            );
            self.require_full_map();
            snapshot = self.snapshot(index)?;
            result = self.store.save(&snapshot).await;
        }

        match result {
            Ok(saved) => {
                let mut state = self.state.lock();
                state.last_persist = Some(Instant::now());
                state.persisted_entries = snapshot.entry_count;
                state.replace_map = false;
                state.generation = Some(saved.generation);
                metrics::record_persist("success");
                info!(
                    index = %snapshot.name,
                    entries = snapshot.entry_count,
                    new_map_entries = snapshot.map_entries.len(),
                    replaced_map = snapshot.replace_map,
                    generation = saved.generation,
                    updated_at = %saved.updated_at,
                    "Job index persisted"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_persist("error");
                error!(index = %snapshot.name, error = %e, "Job index persist failed");
                Err(e.into())
            }
        }
    }

    fn snapshot(&self, index: &SharedJobIndex) -> Result<IndexSnapshot, IndexError> {
        let state = self.state.lock();
        let guard = index.read();
        let (start, expected_generation) = if state.replace_map {
            (0, None)
        } else {
            (state.persisted_entries, state.generation)
        };
        Ok(IndexSnapshot {
            name: guard.name().to_string(),
            blob: guard.to_bytes()?,
            entry_count: guard.len(),
            map_entries: guard.map_entries_from(start),
            replace_map: state.replace_map,
            expected_generation,
        })
    }

    /// Persist if the interval has elapsed since the last successful write
    pub async fn maybe_persist(&self, index: &SharedJobIndex) -> Result<bool, ServiceError> {
        if !self.is_due() {
            return Ok(false);
        }
        self.persist(index).await?;
        Ok(true)
    }

    /// Read the index named `name`
    ///
    /// A stored dimension different from `dimension` is a configuration
    /// error and is returned as `Err`. Undecodable or inconsistent state is
    /// reported as [`IndexLoad::Corrupt`].
    pub async fn load(
        store: &dyn IndexStore,
        name: &str,
        dimension: usize,
    ) -> Result<IndexLoad, ServiceError> {
        let Some(persisted) = store.load(name).await? else {
            return Ok(IndexLoad::Missing);
        };

        let vectors = match FlatIpIndex::from_bytes(&persisted.blob) {
            Ok(vectors) => vectors,
            Err(e) => return Ok(corrupt("decode", e.to_string())),
        };
        if vectors.dimension() != dimension {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                actual: vectors.dimension(),
            }
            .into());
        }
        if vectors.len() != persisted.entry_count {
            return Ok(corrupt(
                "entry_count",
                format!(
                    "blob holds {} vectors, row says {}",
                    vectors.len(),
                    persisted.entry_count
                ),
            ));
        }

        let positions = match PositionMap::from_log(store.load_map(name).await?) {
            Ok(positions) => positions,
            Err(e) => return Ok(corrupt("map_order", e.to_string())),
        };
        match JobIndex::from_parts(name, vectors, positions) {
            Ok(index) => Ok(IndexLoad::Loaded {
                index,
                generation: persisted.generation,
                persisted_at: persisted.updated_at,
            }),
            Err(e) => Ok(corrupt("map_length", e.to_string())),
        }
    }
}

fn corrupt(reason: &'static str, detail: String) -> IndexLoad {
    IndexLoad::Corrupt { reason, detail }
}

/// Append `vector` unless it is bit-identical to the latest indexed vector
/// for the job, in which case only the expiration is refreshed.
/// Returns the new position when a vector was appended.
pub fn append_if_changed(
    index: &mut JobIndex,
    job_id: Uuid,
    vector: &[f32],
    expires_at: Option<DateTime<Utc>>,
) -> Result<Option<usize>, IndexError> {
    if let Some(current) = index.latest_vector(&job_id) {
        if current.len() == vector.len()
            && current
                .iter()
                .zip(vector)
                .all(|(a, b)| a.to_bits() == b.to_bits())
        {
            index.set_expiration(job_id, expires_at);
            return Ok(None);
        }
    }
    index.append(job_id, vector, expires_at).map(Some)
}

/// Build an index from the embedding store in job id order, skipping jobs
/// already expired at `now`
pub async fn build_from_store(
    store: &dyn EmbeddingStore,
    name: &str,
    dimension: usize,
    page_size: i64,
    now: DateTime<Utc>,
) -> Result<JobIndex, ServiceError> {
    let mut index = JobIndex::new(name, dimension);
    let mut after = None;
    let mut skipped_expired = 0usize;

    loop {
        let page = store.load_page(after, page_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.job_id);

        for embedding in &page {
            if embedding.is_expired(now) {
                skipped_expired += 1;
                continue;
            }
            index.append(embedding.job_id, &embedding.vector, embedding.expires_at)?;
        }

        if (page.len() as i64) < page_size {
            break;
        }
    }

    info!(
        index = %name,
        entries = index.len(),
        skipped_expired,
        "Job index built from embedding store"
    );
    Ok(index)
}

/// Startup options for [`bootstrap_index`]
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub name: String,
    pub dimension: usize,
    pub persist_interval: Duration,
    /// Rebuild from the embedding store instead of starting empty when the
    /// stored index is missing or corrupt
    pub rebuild_on_fallback: bool,
    pub page_size: i64,
}

/// Load the persisted index, catch up on embeddings written after it was
/// stored, and return it with a persistence manager positioned after it
pub async fn bootstrap_index(
    index_store: Arc<dyn IndexStore>,
    embeddings: &dyn EmbeddingStore,
    options: &BootstrapOptions,
) -> Result<(SharedJobIndex, IndexPersistence), ServiceError> {
    let load = IndexPersistence::load(index_store.as_ref(), &options.name, options.dimension).await?;

    let (index, persistence) = match load {
        IndexLoad::Loaded {
            mut index,
            generation,
            persisted_at,
        } => {
            let stored_entries = index.len();
            let expirations = embeddings.expirations(&index.job_ids()).await?;
            for (job_id, expires_at) in expirations {
                index.set_expiration(job_id, expires_at);
            }

            let pending = embeddings.load_updated_since(persisted_at).await?;
            let mut caught_up = 0usize;
            for row in &pending {
                let e = &row.embedding;
                if append_if_changed(&mut index, e.job_id, &e.vector, e.expires_at)?.is_some() {
                    caught_up += 1;
                }
            }

            info!(
                index = %options.name,
                entries = stored_entries,
                caught_up,
                persisted_at = %persisted_at,
                "Job index loaded"
            );
            let persistence = IndexPersistence::resume(
                index_store,
                options.persist_interval,
                stored_entries,
                generation,
            );
            (index, persistence)
        }
        IndexLoad::Missing => {
            warn!(
                index = %options.name,
                "No persisted job index found; related jobs stay empty until backfill and rebuild run"
            );
            let index = fallback_index(embeddings, options).await?;
            (index, IndexPersistence::new(index_store, options.persist_interval))
        }
        IndexLoad::Corrupt { reason, detail } => {
            metrics::record_load_fallback(reason);
            error!(
                index = %options.name,
                reason,
                detail = %detail,
                "Persisted job index is corrupt; falling back"
            );
            let index = fallback_index(embeddings, options).await?;
            (index, IndexPersistence::new(index_store, options.persist_interval))
        }
    };

    metrics::set_index_size(index.len());
    Ok((index.into_shared(), persistence))
}

async fn fallback_index(
    embeddings: &dyn EmbeddingStore,
    options: &BootstrapOptions,
) -> Result<JobIndex, ServiceError> {
    if options.rebuild_on_fallback {
        build_from_store(
            embeddings,
            &options.name,
            options.dimension,
            options.page_size,
            Utc::now(),
        )
        .await
    } else {
        debug!(index = %options.name, "Starting with an empty job index");
        Ok(JobIndex::new(&options.name, options.dimension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemoryEmbeddingStore, InMemoryIndexStore};
    use crate::models::{JobEmbedding, PersistedIndex};

    fn options(rebuild_on_fallback: bool) -> BootstrapOptions {
        BootstrapOptions {
            name: "jobs".into(),
            dimension: 2,
            persist_interval: Duration::from_secs(60),
            rebuild_on_fallback,
            page_size: 2,
        }
    }

    #[tokio::test]
    async fn test_persist_sends_only_new_map_entries() {
        let store = Arc::new(InMemoryIndexStore::new());
        let persistence = IndexPersistence::new(store.clone(), Duration::from_secs(60));
        let index = JobIndex::new("jobs", 2).into_shared();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        index.write().append(a, &[1.0, 0.0], None).unwrap();
        persistence.persist(&index).await.unwrap();
        index.write().append(b, &[0.0, 1.0], None).unwrap();
        persistence.persist(&index).await.unwrap();

        assert_eq!(store.load_map("jobs").await.unwrap(), vec![(0, a), (1, b)]);
        assert_eq!(store.load("jobs").await.unwrap().unwrap().entry_count, 2);
    }

    #[tokio::test]
    async fn test_incremental_persist_after_foreign_write_replaces_map() {
        let store = Arc::new(InMemoryIndexStore::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let index = JobIndex::new("jobs", 2).into_shared();
        index.write().append(a, &[1.0, 0.0], None).unwrap();
        IndexPersistence::new(store.clone(), Duration::from_secs(60))
            .persist(&index)
            .await
            .unwrap();
        let persistence = IndexPersistence::resume(store.clone(), Duration::from_secs(60), 1, 1);

        // Another writer replaces the stored row with a different layout
        let other = JobIndex::new("jobs", 2).into_shared();
        other.write().append(b, &[0.0, 1.0], None).unwrap();
        IndexPersistence::new(store.clone(), Duration::from_secs(60))
            .persist(&other)
            .await
            .unwrap();

        index.write().append(b, &[0.0, 1.0], None).unwrap();
        let before = metrics::persist_count("conflict");
        persistence.persist(&index).await.unwrap();

        assert_eq!(store.load_map("jobs").await.unwrap(), vec![(0, a), (1, b)]);
        let stored = store.load("jobs").await.unwrap().unwrap();
        assert_eq!(stored.entry_count, 2);
        assert_eq!(stored.generation, 3);
        assert!(metrics::persist_count("conflict") > before);
    }

    #[tokio::test]
    async fn test_maybe_persist_respects_interval() {
        let store = Arc::new(InMemoryIndexStore::new());
        let persistence = IndexPersistence::new(store.clone(), Duration::from_secs(3600));
        let index = JobIndex::new("jobs", 2).into_shared();

        assert!(persistence.maybe_persist(&index).await.unwrap());
        assert!(!persistence.maybe_persist(&index).await.unwrap());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_stays_due() {
        let store = Arc::new(InMemoryIndexStore::new());
        let persistence = IndexPersistence::new(store.clone(), Duration::from_secs(3600));
        let index = JobIndex::new("jobs", 2).into_shared();

        store.fail_next_saves(1);
        assert!(persistence.maybe_persist(&index).await.is_err());
        assert!(persistence.is_due());
        assert!(persistence.maybe_persist(&index).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_missing() {
        let store = InMemoryIndexStore::new();
        let load = IndexPersistence::load(&store, "jobs", 2).await.unwrap();
        assert!(matches!(load, IndexLoad::Missing));
    }

    #[tokio::test]
    async fn test_load_rejects_dimension_change() {
        let store = InMemoryIndexStore::new();
        store.put_raw(
            PersistedIndex {
                name: "jobs".into(),
                blob: FlatIpIndex::new(3).to_bytes().unwrap(),
                entry_count: 0,
                generation: 1,
                updated_at: Utc::now(),
            },
            vec![],
        );
        let result = IndexPersistence::load(&store, "jobs", 2).await;
        assert!(matches!(
            result,
            Err(ServiceError::Index(IndexError::DimensionMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_load_detects_map_mismatch() {
        let store = InMemoryIndexStore::new();
        let mut vectors = FlatIpIndex::new(2);
        vectors.add(&[1.0, 0.0]).unwrap();
        store.put_raw(
            PersistedIndex {
                name: "jobs".into(),
                blob: vectors.to_bytes().unwrap(),
                entry_count: 1,
                generation: 1,
                updated_at: Utc::now(),
            },
            vec![],
        );

        let load = IndexPersistence::load(&store, "jobs", 2).await.unwrap();
        assert!(matches!(
            load,
            IndexLoad::Corrupt {
                reason: "map_length",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_corrupt_blob_falls_back_and_is_counted() {
        let store = Arc::new(InMemoryIndexStore::new());
        store.put_raw(
            PersistedIndex {
                name: "jobs".into(),
                blob: b"garbage".to_vec(),
                entry_count: 3,
                generation: 1,
                updated_at: Utc::now(),
            },
            vec![],
        );
        let embeddings = InMemoryEmbeddingStore::new();
        let before = metrics::load_fallback_count("decode");

        let (index, persistence) = bootstrap_index(store.clone(), &embeddings, &options(false))
            .await
            .unwrap();

        assert!(index.read().is_empty());
        assert!(metrics::load_fallback_count("decode") > before);
        assert!(persistence.is_due());
    }

    #[tokio::test]
    async fn test_fallback_rebuild_skips_expired() {
        let store = Arc::new(InMemoryIndexStore::new());
        let embeddings = InMemoryEmbeddingStore::new();
        let live: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &live {
            embeddings
                .upsert(&JobEmbedding {
                    job_id: *id,
                    vector: vec![1.0, 0.0],
                    expires_at: None,
                })
                .await
                .unwrap();
        }
        embeddings
            .upsert(&JobEmbedding {
                job_id: Uuid::new_v4(),
                vector: vec![0.0, 1.0],
                expires_at: Some(Utc::now() - chrono::Duration::days(1)),
            })
            .await
            .unwrap();

        let (index, _) = bootstrap_index(store, &embeddings, &options(true))
            .await
            .unwrap();
        let guard = index.read();
        assert_eq!(guard.len(), 3);
        let mut sorted = live.clone();
        sorted.sort();
        assert_eq!(
            guard.map_entries_from(0).into_iter().map(|(_, id)| id).collect::<Vec<_>>(),
            sorted
        );
    }

    #[tokio::test]
    async fn test_catch_up_appends_writes_after_persist() {
        let store = Arc::new(InMemoryIndexStore::new());
        let embeddings = InMemoryEmbeddingStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let index = JobIndex::new("jobs", 2).into_shared();
        let a_vec = JobEmbedding {
            job_id: a,
            vector: vec![1.0, 0.0],
            expires_at: None,
        };
        embeddings.upsert(&a_vec).await.unwrap();
        index.write().append(a, &a_vec.vector, None).unwrap();
        IndexPersistence::new(store.clone(), Duration::from_secs(60))
            .persist(&index)
            .await
            .unwrap();

        // Written after the persist, lost from memory by a crash
        tokio::time::sleep(Duration::from_millis(5)).await;
        embeddings
            .upsert(&JobEmbedding {
                job_id: b,
                vector: vec![0.0, 1.0],
                expires_at: None,
            })
            .await
            .unwrap();
        embeddings.upsert(&a_vec).await.unwrap();

        let (restored, _) = bootstrap_index(store, &embeddings, &options(false))
            .await
            .unwrap();
        let guard = restored.read();
        assert_eq!(guard.len(), 2, "unchanged vector for a must not be re-appended");
        assert_eq!(guard.latest_vector(&b), Some(vec![0.0, 1.0]));
    }
}
