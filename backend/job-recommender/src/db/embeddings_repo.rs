use super::{dedupe_last, EmbeddingStore};
use crate::error::StoreError;
use crate::models::{JobEmbedding, StoredEmbedding};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::HashMap;
use uuid::Uuid;

/// Rows per INSERT statement, keeps bind parameters under the protocol limit
const MAX_ROWS_PER_STATEMENT: usize = 5_000;

#[derive(Clone)]
pub struct PgEmbeddingStore {
    pool: PgPool,
}

impl PgEmbeddingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn embedding_from_row(row: &PgRow) -> Result<JobEmbedding, StoreError> {
    Ok(JobEmbedding {
        job_id: row.try_get("id")?,
        vector: row.try_get("embedding")?,
        expires_at: row.try_get("expires_at")?,
    })
}

#[async_trait]
impl EmbeddingStore for PgEmbeddingStore {
    async fn upsert(&self, embedding: &JobEmbedding) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_embeddings (id, embedding, expires_at, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE
            SET embedding = EXCLUDED.embedding,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            "#,
        )
        .bind(embedding.job_id)
        .bind(&embedding.vector)
        .bind(embedding.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_batch(&self, embeddings: &[JobEmbedding]) -> Result<u64, StoreError> {
        if embeddings.is_empty() {
            return Ok(0);
        }

        let rows = dedupe_last(embeddings, |e| e.job_id);
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder =
                QueryBuilder::new("INSERT INTO job_embeddings (id, embedding, expires_at) ");
            builder.push_values(chunk, |mut b, embedding| {
                b.push_bind(embedding.job_id)
                    .push_bind(&embedding.vector)
                    .push_bind(embedding.expires_at);
            });
            builder.push(
                " ON CONFLICT (id) DO UPDATE \
                 SET embedding = EXCLUDED.embedding, \
                     expires_at = EXCLUDED.expires_at, \
                     updated_at = NOW()",
            );

            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn load_page(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<JobEmbedding>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, embedding, expires_at
            FROM job_embeddings
            WHERE $1::uuid IS NULL OR id > $1
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(embedding_from_row).collect()
    }

    async fn load_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredEmbedding>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, embedding, expires_at, updated_at
            FROM job_embeddings
            WHERE updated_at > $1
            ORDER BY updated_at, id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StoredEmbedding, StoreError> {
                Ok(StoredEmbedding {
                    embedding: embedding_from_row(row)?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn expirations(
        &self,
        job_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Option<DateTime<Utc>>>, StoreError> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, expires_at
            FROM job_embeddings
            WHERE id = ANY($1::uuid[])
            "#,
        )
        .bind(job_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(Uuid, Option<DateTime<Utc>>), StoreError> {
                Ok((row.try_get("id")?, row.try_get("expires_at")?))
            })
            .collect()
    }
}
