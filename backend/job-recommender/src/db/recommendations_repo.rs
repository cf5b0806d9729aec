use super::{dedupe_last, RecommendationStore};
use crate::error::StoreError;
use crate::models::Recommendation;
use async_trait::async_trait;
use sqlx::{PgPool, QueryBuilder};

#[derive(Clone)]
pub struct PgRecommendationStore {
    pool: PgPool,
}

impl PgRecommendationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecommendationStore for PgRecommendationStore {
    async fn upsert_batch(&self, recommendations: &[Recommendation]) -> Result<u64, StoreError> {
        if recommendations.is_empty() {
            return Ok(0);
        }

        let rows = dedupe_last(recommendations, |r| (r.user_id, r.job_id));
        let mut builder = QueryBuilder::new(
            "INSERT INTO job_recommendation (user_id, job_id, similarity_score, recommended_at) ",
        );
        builder.push_values(rows, |mut b, rec| {
            b.push_bind(rec.user_id)
                .push_bind(rec.job_id)
                .push_bind(rec.similarity_score)
                .push_bind(rec.recommended_at);
        });
        builder.push(
            " ON CONFLICT (user_id, job_id) DO UPDATE \
             SET similarity_score = EXCLUDED.similarity_score, \
                 recommended_at = EXCLUDED.recommended_at",
        );

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
