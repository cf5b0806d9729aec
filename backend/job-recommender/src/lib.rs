pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod events;
pub mod handlers;
pub mod index;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{AppError, Result};

pub use index::{JobIndex, SharedJobIndex};
pub use services::{EventProcessor, JobIndexer, RecommendationEngine};
