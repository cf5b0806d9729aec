//! One-shot batch passes against the job recommender tables
//!
//! ```text
//! job-recommender-batch backfill            # embed jobs without an embedding row
//! job-recommender-batch rebuild-index       # rebuild and persist the index from embeddings
//! job-recommender-batch recommend-profiles  # recompute recommendations for every profile
//! ```
//!
//! The mode may also come from `BATCH_MODE`.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use job_recommender::config::Config;
use job_recommender::db::{
    self, PgEmbeddingStore, PgIndexStore, PgRecommendationStore, PgSourceStore,
};
use job_recommender::embedding;
use job_recommender::index::{bootstrap_index, BootstrapOptions};
use job_recommender::services::{BackfillJob, IndexRebuilder, ProfileBatch, RecommendationEngine};

const REBUILD_PAGE_SIZE: i64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchMode {
    Backfill,
    RebuildIndex,
    RecommendProfiles,
}

impl FromStr for BatchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "backfill" => Ok(BatchMode::Backfill),
            "rebuild-index" | "rebuild" => Ok(BatchMode::RebuildIndex),
            "recommend-profiles" | "profiles" => Ok(BatchMode::RecommendProfiles),
            other => Err(anyhow!(
                "unknown batch mode '{}' (expected backfill, rebuild-index or recommend-profiles)",
                other
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_line_number(true)
                .with_file(true)
                .with_target(true),
        )
        .init();

    let mode: BatchMode = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BATCH_MODE").ok())
        .ok_or_else(|| anyhow!("batch mode required as first argument or BATCH_MODE"))?
        .parse()?;

    let config = Config::from_env().map_err(|e| anyhow!("failed to load configuration: {}", e))?;
    info!(mode = ?mode, "Starting job-recommender batch");

    let mut db_cfg = db_pool::DbConfig::for_service("job-recommender-batch");
    db_cfg.database_url = config.database.url.clone();
    let pool = db_pool::create_pool(db_cfg)
        .await
        .context("failed to create database pool")?;
    db::run_migrations(&pool)
        .await
        .context("database migrations failed")?;

    let embedding_store = Arc::new(PgEmbeddingStore::new(pool.clone()));
    let index_store = Arc::new(PgIndexStore::new(pool.clone()));

    match mode {
        BatchMode::Backfill => {
            let embedder = embedding::from_config(&config.embedding)?;
            embedding::verify_dimension(embedder.as_ref(), config.embedding.dimension).await?;

            let job = BackfillJob::new(
                Arc::new(PgSourceStore::new(pool.clone())),
                embedding_store,
                embedder,
                config.backfill.clone(),
            );
            let stats = job.run().await?;
            info!(stats = ?stats, "Backfill finished");
            if stats.failed_chunks > 0 {
                return Err(anyhow!("{} backfill chunks failed", stats.failed_chunks));
            }
        }
        BatchMode::RebuildIndex => {
            let rebuilder = IndexRebuilder::new(
                embedding_store,
                index_store,
                config.index.name.clone(),
                config.embedding.dimension,
                REBUILD_PAGE_SIZE,
            );
            let stats = rebuilder.rebuild().await?;
            info!(
                entries = stats.entries,
                distinct_jobs = stats.distinct_jobs,
                "Index rebuilt; restart the job-recommender service to load it"
            );
        }
        BatchMode::RecommendProfiles => {
            let embedder = embedding::from_config(&config.embedding)?;
            embedding::verify_dimension(embedder.as_ref(), config.embedding.dimension).await?;

            let options = BootstrapOptions {
                name: config.index.name.clone(),
                dimension: config.embedding.dimension,
                persist_interval: config.index.persist_interval(),
                rebuild_on_fallback: true,
                page_size: REBUILD_PAGE_SIZE,
            };
            // Read-only use of the index; the persistence handle is dropped
            let (index, _persistence) =
                bootstrap_index(index_store, embedding_store.as_ref(), &options).await?;

            let engine = Arc::new(RecommendationEngine::new(
                index,
                embedder,
                Arc::new(PgRecommendationStore::new(pool.clone())),
                &config.recommendation,
            ));
            let batch = ProfileBatch::new(
                Arc::new(PgSourceStore::new(pool.clone())),
                engine,
                config.backfill.fetch_size,
                config.backfill.effective_workers(),
            );
            let stats = batch.run().await?;
            info!(stats = ?stats, "Profile batch finished");
            if stats.failures > 0 {
                return Err(anyhow!("{} profiles failed", stats.failures));
            }
        }
    }

    pool.close().await;
    Ok(())
}
