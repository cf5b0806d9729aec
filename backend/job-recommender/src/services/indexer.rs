use std::sync::Arc;

use tracing::debug;

use crate::db::EmbeddingStore;
use crate::embedding::EmbeddingSource;
use crate::error::ServiceError;
use crate::events::JobChanged;
use crate::index::{append_if_changed, SharedJobIndex};
use crate::metrics;
use crate::models::JobEmbedding;

/// What indexing a job event did to the live index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Appended(usize),
    /// Embedding identical to the indexed one; only the expiration changed
    Unchanged,
}

/// Embeds job text and keeps the embedding store and live index in step
pub struct JobIndexer {
    embedder: Arc<dyn EmbeddingSource>,
    store: Arc<dyn EmbeddingStore>,
    index: SharedJobIndex,
}

impl JobIndexer {
    pub fn new(
        embedder: Arc<dyn EmbeddingSource>,
        store: Arc<dyn EmbeddingStore>,
        index: SharedJobIndex,
    ) -> Self {
        Self {
            embedder,
            store,
            index,
        }
    }

    /// Handle `job.created` / `job.updated`
    ///
    /// The store row is written before the index is touched, so a failure
    /// leaves the index unchanged and the event can be redelivered.
    pub async fn index_job(&self, job: &JobChanged) -> Result<IndexOutcome, ServiceError> {
        let vector = self.embedder.embed(&job.detail).await?;

        let embedding = JobEmbedding {
            job_id: job.job_id,
            vector,
            expires_at: job.expires_at,
        };
        self.store.upsert(&embedding).await?;

        let (appended, entries) = {
            let mut index = self.index.write();
            let appended = append_if_changed(
                &mut index,
                embedding.job_id,
                &embedding.vector,
                embedding.expires_at,
            )?;
            (appended, index.len())
        };
        metrics::set_index_size(entries);

        match appended {
            Some(position) => {
                debug!(job_id = %job.job_id, position, "Job embedding indexed");
                Ok(IndexOutcome::Appended(position))
            }
            None => {
                debug!(job_id = %job.job_id, "Job embedding unchanged; expiration refreshed");
                Ok(IndexOutcome::Unchanged)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryEmbeddingStore;
    use crate::embedding::HashEmbedder;
    use crate::index::JobIndex;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn indexer() -> (JobIndexer, Arc<InMemoryEmbeddingStore>, SharedJobIndex) {
        let store = Arc::new(InMemoryEmbeddingStore::new());
        let index = JobIndex::new("jobs", 64).into_shared();
        let indexer = JobIndexer::new(Arc::new(HashEmbedder::new(64)), store.clone(), index.clone());
        (indexer, store, index)
    }

    fn job(job_id: Uuid, detail: &str) -> JobChanged {
        JobChanged {
            job_id,
            expires_at: None,
            detail: detail.to_string(),
        }
    }

    #[tokio::test]
    async fn test_same_event_twice_keeps_one_row_and_one_position() {
        let (indexer, store, index) = indexer();
        let job_id = Uuid::new_v4();
        let event = job(job_id, "senior rust engineer, async services");

        assert_eq!(indexer.index_job(&event).await.unwrap(), IndexOutcome::Appended(0));
        assert_eq!(indexer.index_job(&event).await.unwrap(), IndexOutcome::Unchanged);

        assert_eq!(store.len(), 1);
        assert_eq!(index.read().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_text_appends_new_position() {
        let (indexer, store, index) = indexer();
        let job_id = Uuid::new_v4();

        indexer.index_job(&job(job_id, "rust engineer")).await.unwrap();
        let outcome = indexer.index_job(&job(job_id, "golang engineer")).await.unwrap();

        assert_eq!(outcome, IndexOutcome::Appended(1));
        assert_eq!(store.len(), 1);
        assert_eq!(index.read().distinct_jobs(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_text_refreshes_expiration() {
        let (indexer, _store, index) = indexer();
        let job_id = Uuid::new_v4();
        let mut event = job(job_id, "data engineer");

        indexer.index_job(&event).await.unwrap();
        let expires = Utc::now() + Duration::days(30);
        event.expires_at = Some(expires);
        indexer.index_job(&event).await.unwrap();

        assert_eq!(index.read().expiration(&job_id), Some(expires));
    }

    #[tokio::test]
    async fn test_store_failure_leaves_index_untouched() {
        let (indexer, store, index) = indexer();
        store.fail_next_upserts(1);

        assert!(indexer.index_job(&job(Uuid::new_v4(), "qa engineer")).await.is_err());
        assert!(index.read().is_empty());
    }
}
