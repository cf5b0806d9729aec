//! Service configuration loaded from the environment

use db_pool::env_utils::parse_env_with_default;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub kafka: KafkaConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub recommendation: RecommendationConfig,
    pub backfill: BackfillConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub host: String,
    pub port: u16,
    /// Run the event consumer alongside the HTTP API
    pub consumer_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    /// Topic prefixes routed to the job handler, e.g. `job.created`
    pub job_topic_prefix: String,
    /// Topic prefixes routed to the profile handler, e.g. `profile.updated`
    pub profile_topic_prefix: String,
    pub session_timeout_ms: u32,
    /// Drop a message after this many redeliveries; 0 never drops
    pub max_redeliveries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Http,
    Hash,
}

impl FromStr for EmbeddingProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(EmbeddingProvider::Http),
            "hash" => Ok(EmbeddingProvider::Hash),
            other => Err(format!("unknown embedding provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub url: String,
    pub dimension: usize,
    pub timeout_secs: u64,
    /// Inputs per request to the embedding server
    pub max_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub name: String,
    pub persist_interval_secs: u64,
    /// Rebuild from stored embeddings when the persisted index is missing or corrupt
    pub rebuild_on_fallback: bool,
}

impl IndexConfig {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    pub threshold: f32,
    pub default_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    pub fetch_size: i64,
    pub chunk_size: usize,
    pub workers: usize,
}

impl BackfillConfig {
    /// Workers actually used: configured count bounded by available CPUs
    pub fn effective_workers(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.workers.clamp(1, cpus.max(1))
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            fetch_size: default_backfill_fetch_size(),
            chunk_size: default_backfill_chunk_size(),
            workers: default_backfill_workers(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let provider: EmbeddingProvider = std::env::var("EMBEDDING_PROVIDER")
            .unwrap_or_else(|_| "http".to_string())
            .parse()?;

        let config = Config {
            app: AppConfig {
                env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                host: std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("APP_PORT")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()?,
                consumer_enabled: parse_env_with_default("CONSUMER_ENABLED", true),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")?,
                max_connections: parse_env_with_default("DATABASE_MAX_CONNECTIONS", 10),
            },
            kafka: KafkaConfig {
                bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
                    .unwrap_or_else(|_| default_kafka_bootstrap_servers()),
                group_id: std::env::var("KAFKA_GROUP_ID")
                    .unwrap_or_else(|_| default_kafka_group_id()),
                job_topic_prefix: std::env::var("KAFKA_JOB_TOPIC_PREFIX")
                    .unwrap_or_else(|_| "job.".to_string()),
                profile_topic_prefix: std::env::var("KAFKA_PROFILE_TOPIC_PREFIX")
                    .unwrap_or_else(|_| "profile.".to_string()),
                session_timeout_ms: parse_env_with_default("KAFKA_SESSION_TIMEOUT_MS", 6000),
                max_redeliveries: parse_env_with_default("EVENT_MAX_REDELIVERIES", default_max_redeliveries()),
            },
            embedding: EmbeddingConfig {
                provider,
                url: std::env::var("EMBEDDING_URL")
                    .unwrap_or_else(|_| "http://localhost:8080".to_string()),
                dimension: parse_env_with_default("EMBEDDING_DIMENSION", default_dimension()),
                timeout_secs: parse_env_with_default("EMBEDDING_TIMEOUT_SECS", 30),
                max_batch: parse_env_with_default("EMBEDDING_MAX_BATCH", 32),
            },
            index: IndexConfig {
                name: std::env::var("INDEX_NAME").unwrap_or_else(|_| default_index_name()),
                persist_interval_secs: parse_env_with_default("INDEX_PERSIST_INTERVAL_SECS", 60),
                rebuild_on_fallback: parse_env_with_default("INDEX_REBUILD_ON_FALLBACK", false),
            },
            recommendation: RecommendationConfig {
                threshold: parse_env_with_default("RECOMMENDATION_THRESHOLD", 0.7),
                default_k: parse_env_with_default("RECOMMENDATION_DEFAULT_K", 5),
            },
            backfill: BackfillConfig {
                fetch_size: parse_env_with_default(
                    "BACKFILL_FETCH_SIZE",
                    default_backfill_fetch_size(),
                ),
                chunk_size: parse_env_with_default(
                    "BACKFILL_CHUNK_SIZE",
                    default_backfill_chunk_size(),
                ),
                workers: parse_env_with_default("BACKFILL_WORKERS", default_backfill_workers()),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("EMBEDDING_DIMENSION must be positive".to_string());
        }
        if !(-1.0..=1.0).contains(&self.recommendation.threshold) {
            return Err("RECOMMENDATION_THRESHOLD must be within [-1, 1]".to_string());
        }
        if self.recommendation.default_k == 0 {
            return Err("RECOMMENDATION_DEFAULT_K must be positive".to_string());
        }
        if self.backfill.fetch_size <= 0 || self.backfill.chunk_size == 0 {
            return Err("backfill fetch and chunk sizes must be positive".to_string());
        }
        if self.index.name.trim().is_empty() {
            return Err("INDEX_NAME must not be empty".to_string());
        }
        Ok(())
    }
}

fn default_kafka_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_kafka_group_id() -> String {
    "job-recommender-group".to_string()
}

pub fn default_max_redeliveries() -> u32 {
    5
}

fn default_index_name() -> String {
    "jobit_job_index".to_string()
}

fn default_dimension() -> usize {
    384
}

fn default_backfill_fetch_size() -> i64 {
    2000
}

fn default_backfill_chunk_size() -> usize {
    100
}

fn default_backfill_workers() -> usize {
    4
}
