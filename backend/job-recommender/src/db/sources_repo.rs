//! Read-only queries against the backend's job and profile tables

use super::SourceStore;
use crate::error::StoreError;
use crate::models::{SourceJob, SourceProfile};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn load_unembedded_jobs(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SourceJob>, StoreError> {
        // Same text layout the backend publishes as `job_detail`;
        // job_entry.expires_at is a naive UTC timestamp
        let rows = sqlx::query(
            r#"
            SELECT je.id,
                   concat_ws(' ', je.job_title, jd.job_description,
                             jd.responsibilities, jd.skills) AS text,
                   je.expires_at AT TIME ZONE 'UTC' AS expires_at
            FROM job_entry je
            JOIN job_detail jd ON jd.id = je.id
            LEFT JOIN job_embeddings emb ON emb.id = je.id
            WHERE emb.id IS NULL
              AND ($1::uuid IS NULL OR je.id > $1)
            ORDER BY je.id
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SourceJob, StoreError> {
                Ok(SourceJob {
                    job_id: row.try_get("id")?,
                    text: row.try_get("text")?,
                    expires_at: row.try_get("expires_at")?,
                })
            })
            .collect()
    }

    async fn load_profiles(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<SourceProfile>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id,
                   concat_ws(' ', description, skills::text) AS text
            FROM user_profile
            WHERE ($1::uuid IS NULL OR id > $1)
              AND (COALESCE(description, '') <> '' OR skills IS NOT NULL)
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SourceProfile, StoreError> {
                Ok(SourceProfile {
                    user_id: row.try_get("id")?,
                    text: row.try_get("text")?,
                })
            })
            .collect()
    }
}
