//! Embedding backfill for jobs that have no embedding row yet
//!
//! Jobs are fetched in keyset pages, split into fixed-size chunks and
//! embedded by a bounded worker pool. Each chunk is written with one
//! multi-row upsert. The live index is not touched; run an index rebuild
//! afterwards to pick the rows up.

use std::sync::Arc;

use resilience::{database_write, with_retry};
use tracing::{info, warn};

use super::worker_pool::WorkerPool;
use crate::config::BackfillConfig;
use crate::db::{EmbeddingStore, SourceStore};
use crate::embedding::EmbeddingSource;
use crate::error::ServiceError;
use crate::models::{JobEmbedding, SourceJob};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillStats {
    pub pages: usize,
    pub jobs_seen: usize,
    pub embedded: u64,
    pub skipped_blank: usize,
    pub failed_chunks: usize,
}

pub struct BackfillJob {
    source: Arc<dyn SourceStore>,
    store: Arc<dyn EmbeddingStore>,
    embedder: Arc<dyn EmbeddingSource>,
    config: BackfillConfig,
}

impl BackfillJob {
    pub fn new(
        source: Arc<dyn SourceStore>,
        store: Arc<dyn EmbeddingStore>,
        embedder: Arc<dyn EmbeddingSource>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            source,
            store,
            embedder,
            config,
        }
    }

    /// One pass over every unembedded job
    ///
    /// A failed chunk is logged and counted; its jobs stay unembedded and
    /// are picked up by the next pass.
    pub async fn run(&self) -> Result<BackfillStats, ServiceError> {
        let workers = self.config.effective_workers();
        let chunk_size = self.config.chunk_size.max(1);
        let mut stats = BackfillStats::default();
        let mut after = None;

        info!(
            fetch_size = self.config.fetch_size,
            chunk_size,
            workers,
            "Starting embedding backfill"
        );

        loop {
            let page = self
                .source
                .load_unembedded_jobs(after, self.config.fetch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.job_id);
            stats.pages += 1;
            stats.jobs_seen += page.len();
            let page_len = page.len();

            let (jobs, blank): (Vec<SourceJob>, Vec<SourceJob>) =
                page.into_iter().partition(|job| !job.text.trim().is_empty());
            stats.skipped_blank += blank.len();

            let mut pool = WorkerPool::new("backfill", workers);
            for chunk in jobs.chunks(chunk_size) {
                let chunk = chunk.to_vec();
                let embedder = self.embedder.clone();
                let store = self.store.clone();
                pool.submit(embed_chunk(embedder, store, chunk)).await;
            }

            let report = pool.join_all().await;
            stats.embedded += report.completed.iter().sum::<u64>();
            stats.failed_chunks += report.failed();
            info!(
                page = stats.pages,
                rows = page_len,
                embedded = stats.embedded,
                failed_chunks = stats.failed_chunks,
                "Backfill page done"
            );

            if (page_len as i64) < self.config.fetch_size {
                break;
            }
        }

        if stats.skipped_blank > 0 {
            warn!(skipped = stats.skipped_blank, "Skipped jobs with no text to embed");
        }
        info!(stats = ?stats, "Embedding backfill complete");
        Ok(stats)
    }
}

async fn embed_chunk(
    embedder: Arc<dyn EmbeddingSource>,
    store: Arc<dyn EmbeddingStore>,
    chunk: Vec<SourceJob>,
) -> Result<u64, ServiceError> {
    let texts: Vec<String> = chunk.iter().map(|job| job.text.clone()).collect();
    let vectors = embedder.embed_batch(&texts).await?;

    let rows: Vec<JobEmbedding> = chunk
        .into_iter()
        .zip(vectors)
        .map(|(job, vector)| JobEmbedding {
            job_id: job.job_id,
            vector,
            expires_at: job.expires_at,
        })
        .collect();

    let written = with_retry(database_write(), || store.upsert_batch(&rows))
        .await
        .map_err(|e| e.into_inner())?;
    Ok(written)
}
