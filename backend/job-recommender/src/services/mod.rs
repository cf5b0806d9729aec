//! Business logic driven by events and batch passes

pub mod backfill;
pub mod indexer;
pub mod processor;
pub mod profile_batch;
pub mod rebuild;
pub mod recommendation;
pub mod worker_pool;

pub use backfill::{BackfillJob, BackfillStats};
pub use indexer::{IndexOutcome, JobIndexer};
pub use processor::EventProcessor;
pub use profile_batch::{ProfileBatch, ProfileBatchStats};
pub use rebuild::{IndexRebuilder, RebuildStats};
pub use recommendation::{RecommendationEngine, MAX_K};
pub use worker_pool::{PoolReport, WorkerPool};
