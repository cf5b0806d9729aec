//! Preset retry configurations for the dependencies the services talk to

use crate::retry::RetryConfig;
use std::time::Duration;

/// Message broker connect + subscribe
///
/// - 5 retries per reconnect cycle, 500ms doubling up to 30s
/// - Callers loop over cycles indefinitely; this bounds a single cycle only
pub fn broker_reconnect() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

/// Embedding server HTTP calls
///
/// - 2 retries with short backoff; a failing embed call surfaces to the
///   event handler, which relies on broker redelivery for anything longer
pub fn embedding_http() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_backoff: Duration::from_millis(200),
        max_backoff: Duration::from_secs(2),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

/// Idempotent database writes (upserts)
pub fn database_write() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(2),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}
