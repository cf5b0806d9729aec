use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::db::{EmbeddingStore, IndexStore};
use crate::error::ServiceError;
use crate::index::{build_from_store, IndexPersistence};
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildStats {
    pub entries: usize,
    pub distinct_jobs: usize,
}

/// Rebuilds the named index from the embedding store and replaces the
/// stored blob and map log
///
/// A running consumer keeps its own in-memory index. Its next persist sees
/// the bumped generation and replaces the rebuilt index with its own, so
/// stop the consumer for a rebuild and start it afterwards.
pub struct IndexRebuilder {
    embeddings: Arc<dyn EmbeddingStore>,
    index_store: Arc<dyn IndexStore>,
    name: String,
    dimension: usize,
    page_size: i64,
}

impl IndexRebuilder {
    pub fn new(
        embeddings: Arc<dyn EmbeddingStore>,
        index_store: Arc<dyn IndexStore>,
        name: impl Into<String>,
        dimension: usize,
        page_size: i64,
    ) -> Self {
        Self {
            embeddings,
            index_store,
            name: name.into(),
            dimension,
            page_size,
        }
    }

    pub async fn rebuild(&self) -> Result<RebuildStats, ServiceError> {
        let index = build_from_store(
            self.embeddings.as_ref(),
            &self.name,
            self.dimension,
            self.page_size,
            Utc::now(),
        )
        .await?;
        let stats = RebuildStats {
            entries: index.len(),
            distinct_jobs: index.distinct_jobs(),
        };

        let shared = index.into_shared();
        // A fresh manager always rewrites the whole map log
        let persistence = IndexPersistence::new(self.index_store.clone(), Duration::ZERO);
        persistence.persist(&shared).await?;
        metrics::set_index_size(stats.entries);

        info!(index = %self.name, entries = stats.entries, "Job index rebuilt");
        Ok(stats)
    }
}
