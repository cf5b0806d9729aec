use super::IndexStore;
use crate::error::StoreError;
use crate::models::{IndexSnapshot, PersistedIndex, SavedIndex};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const SERVICE_NAME: &str = "job-recommender";

#[derive(Clone)]
pub struct PgIndexStore {
    pool: PgPool,
}

impl PgIndexStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_i64(value: usize, field: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidRow(format!("{} out of range", field)))
}

fn to_usize(value: i64, field: &str) -> Result<usize, StoreError> {
    usize::try_from(value).map_err(|_| StoreError::InvalidRow(format!("negative {}", field)))
}

#[async_trait]
impl IndexStore for PgIndexStore {
    async fn save(&self, snapshot: &IndexSnapshot) -> Result<SavedIndex, StoreError> {
        let mut conn = db_pool::acquire_with_metrics(&self.pool, SERVICE_NAME).await?;
        let mut tx = sqlx::Connection::begin(&mut *conn).await?;

        if let Some(expected) = snapshot.expected_generation {
            let current: Option<i64> = sqlx::query_scalar(
                "SELECT generation FROM job_index WHERE name = $1 FOR UPDATE",
            )
            .bind(&snapshot.name)
            .fetch_optional(&mut *tx)
            .await?;

            if current != Some(expected) {
                return Err(StoreError::GenerationConflict {
                    name: snapshot.name.clone(),
                    expected,
                    found: current,
                });
            }
        }

        let row = sqlx::query(
            r#"
            INSERT INTO job_index (name, index_data, entry_count, generation, updated_at)
            VALUES ($1, $2, $3, 1, NOW())
            ON CONFLICT (name) DO UPDATE
            SET index_data = EXCLUDED.index_data,
                entry_count = EXCLUDED.entry_count,
                generation = job_index.generation + 1,
                updated_at = NOW()
            RETURNING generation, updated_at
            "#,
        )
        .bind(&snapshot.name)
        .bind(&snapshot.blob)
        .bind(to_i64(snapshot.entry_count, "entry_count")?)
        .fetch_one(&mut *tx)
        .await?;
        let saved = SavedIndex {
            generation: row.try_get("generation")?,
            updated_at: row.try_get("updated_at")?,
        };

        if snapshot.replace_map {
            sqlx::query("DELETE FROM job_index_map WHERE index_name = $1")
                .bind(&snapshot.name)
                .execute(&mut *tx)
                .await?;
        }

        if !snapshot.map_entries.is_empty() {
            let positions = snapshot
                .map_entries
                .iter()
                .map(|(position, _)| to_i64(*position, "position"))
                .collect::<Result<Vec<_>, _>>()?;
            let job_ids: Vec<Uuid> = snapshot.map_entries.iter().map(|(_, id)| *id).collect();

            sqlx::query(
                r#"
                INSERT INTO job_index_map (index_name, position, job_id)
                SELECT $1, position, job_id
                FROM unnest($2::bigint[], $3::uuid[]) AS entry(position, job_id)
                ON CONFLICT (index_name, position) DO UPDATE
                SET job_id = EXCLUDED.job_id
                "#,
            )
            .bind(&snapshot.name)
            .bind(&positions)
            .bind(&job_ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(saved)
    }

    async fn load(&self, name: &str) -> Result<Option<PersistedIndex>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, index_data, entry_count, generation, updated_at
            FROM job_index
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<PersistedIndex, StoreError> {
            Ok(PersistedIndex {
                name: row.try_get("name")?,
                blob: row.try_get("index_data")?,
                entry_count: to_usize(row.try_get("entry_count")?, "entry_count")?,
                generation: row.try_get("generation")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn load_map(&self, name: &str) -> Result<Vec<(usize, Uuid)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position, job_id
            FROM job_index_map
            WHERE index_name = $1
            ORDER BY position
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(usize, Uuid), StoreError> {
                Ok((
                    to_usize(row.try_get("position")?, "position")?,
                    row.try_get("job_id")?,
                ))
            })
            .collect()
    }
}
