//! Integration tests for resilience library

use resilience::{presets, with_retry, Backoff, RetryConfig, RetryError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_reconnect_cycle_gives_up_then_next_cycle_succeeds() {
    let attempts = Arc::new(AtomicU32::new(0));

    // First cycle: broker stays down for the whole cycle
    let counter = attempts.clone();
    let first = with_retry(presets::broker_reconnect(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>("connection refused") }
    })
    .await;
    assert!(matches!(
        first,
        Err(RetryError::MaxRetriesExceeded { attempts: 6, .. })
    ));

    // Second cycle: broker is back
    let counter = attempts.clone();
    let second = with_retry(presets::broker_reconnect(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, String>("bound") }
    })
    .await;
    assert_eq!(second.unwrap(), "bound");
    assert_eq!(attempts.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn test_into_inner_returns_last_error() {
    let config = RetryConfig {
        max_retries: 0,
        ..Default::default()
    };
    let err = with_retry(config, || async { Err::<(), _>("boom") })
        .await
        .unwrap_err();
    assert_eq!(err.into_inner(), "boom");
}

#[test]
fn test_backoff_from_config_matches_settings() {
    let config = RetryConfig {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(150),
        backoff_multiplier: 3.0,
        jitter: false,
        ..Default::default()
    };
    let delays: Vec<Duration> = config.backoff().take(3).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(50),
            Duration::from_millis(150),
            Duration::from_millis(150)
        ]
    );

    let capped = Backoff::new(Duration::from_secs(5), Duration::from_secs(1), 2.0, false);
    assert_eq!(capped.max_delay(), Duration::from_secs(1));
}
