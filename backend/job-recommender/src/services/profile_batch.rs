use std::sync::Arc;

use tracing::info;

use super::worker_pool::WorkerPool;
use super::RecommendationEngine;
use crate::db::SourceStore;
use crate::error::ServiceError;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProfileBatchStats {
    pub profiles: usize,
    pub recommendations: usize,
    pub failures: usize,
}

/// Recomputes recommendations for every profile against the current index
pub struct ProfileBatch {
    source: Arc<dyn SourceStore>,
    engine: Arc<RecommendationEngine>,
    fetch_size: i64,
    workers: usize,
}

impl ProfileBatch {
    pub fn new(
        source: Arc<dyn SourceStore>,
        engine: Arc<RecommendationEngine>,
        fetch_size: i64,
        workers: usize,
    ) -> Self {
        Self {
            source,
            engine,
            fetch_size,
            workers,
        }
    }

    pub async fn run(&self) -> Result<ProfileBatchStats, ServiceError> {
        let mut stats = ProfileBatchStats::default();
        let mut after = None;

        loop {
            let page = self.source.load_profiles(after, self.fetch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.user_id);
            let page_len = page.len();
            stats.profiles += page_len;

            let mut pool = WorkerPool::new("profile-batch", self.workers);
            for profile in page {
                let engine = self.engine.clone();
                pool.submit(async move {
                    engine
                        .recommend(profile.user_id, &profile.text, None)
                        .await
                        .map(|matches| matches.len())
                })
                .await;
            }
            let report = pool.join_all().await;
            stats.recommendations += report.completed.iter().sum::<usize>();
            stats.failures += report.failed();

            if (page_len as i64) < self.fetch_size {
                break;
            }
        }

        info!(stats = ?stats, "Profile recommendation batch complete");
        Ok(stats)
    }
}
