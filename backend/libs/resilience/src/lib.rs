//! Resilience patterns shared by the backend services
//!
//! This library provides:
//! - **Backoff**: Exponential delay schedule with optional jitter
//! - **Retry**: Bounded retries of an async operation driven by a [`Backoff`],
//!   optionally stopping early on errors a predicate marks as permanent
//! - **Preset Configurations**: Pre-tuned retry settings for the broker,
//!   the embedding server and database writes
//!
//! # Example: reconnecting to a broker
//!
//! ```rust,no_run
//! use resilience::{presets, with_retry};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let result = with_retry(presets::broker_reconnect(), || async {
//!         // connect + subscribe here
//!         Ok::<_, String>(())
//!     })
//!     .await;
//!
//!     if let Err(e) = result {
//!         eprintln!("giving up for this cycle: {e}");
//!     }
//! }
//! ```

pub mod backoff;
pub mod presets;
pub mod retry;

// Re-export main types for convenience
pub use backoff::Backoff;
pub use presets::{broker_reconnect, database_write, embedding_http};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
