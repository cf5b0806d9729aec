use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RecommendationConfig;
use crate::db::RecommendationStore;
use crate::embedding::EmbeddingSource;
use crate::error::ServiceError;
use crate::index::SharedJobIndex;
use crate::metrics;
use crate::models::{Recommendation, ScoredJob};

/// Upper bound on `k` for any query
pub const MAX_K: usize = 100;

/// Profile recommendations and related-job lookups against the live index
pub struct RecommendationEngine {
    index: SharedJobIndex,
    embedder: Arc<dyn EmbeddingSource>,
    store: Arc<dyn RecommendationStore>,
    threshold: f32,
    default_k: usize,
}

impl RecommendationEngine {
    pub fn new(
        index: SharedJobIndex,
        embedder: Arc<dyn EmbeddingSource>,
        store: Arc<dyn RecommendationStore>,
        config: &RecommendationConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            store,
            threshold: config.threshold,
            default_k: config.default_k,
        }
    }

    pub fn index(&self) -> &SharedJobIndex {
        &self.index
    }

    fn effective_k(&self, k: Option<usize>) -> usize {
        k.unwrap_or(self.default_k).min(MAX_K)
    }

    /// Embed the profile, keep the top-k jobs scoring at least the
    /// threshold and upsert them as recommendations for `user_id`
    pub async fn recommend(
        &self,
        user_id: Uuid,
        profile_text: &str,
        k: Option<usize>,
    ) -> Result<Vec<ScoredJob>, ServiceError> {
        let k = self.effective_k(k);
        let query = self.embedder.embed(profile_text).await?;

        let now = Utc::now();
        let matches: Vec<ScoredJob> = self
            .index
            .read()
            .search_jobs(&query, k, now)
            .into_iter()
            .filter(|hit| hit.score >= self.threshold)
            .collect();

        if matches.is_empty() {
            debug!(user_id = %user_id, k, "No jobs above recommendation threshold");
            return Ok(matches);
        }

        let rows: Vec<Recommendation> = matches
            .iter()
            .map(|hit| Recommendation {
                user_id,
                job_id: hit.job_id,
                similarity_score: hit.score,
                recommended_at: now,
            })
            .collect();
        self.store.upsert_batch(&rows).await?;
        metrics::record_recommendations(rows.len());

        info!(user_id = %user_id, count = rows.len(), "Recommendations stored");
        Ok(matches)
    }

    /// Jobs most similar to `job_id`, excluding the job itself
    ///
    /// A job without an indexed embedding has no neighbours yet.
    pub fn related(&self, job_id: &Uuid, k: Option<usize>) -> Vec<ScoredJob> {
        let k = self.effective_k(k);
        self.index.read().related_jobs(job_id, k, Utc::now())
    }
}
