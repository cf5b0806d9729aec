//! Event consumer
//!
//! Drives an [`EventTransport`] through connect, bind and consume, routes
//! every delivery by topic prefix to an [`EventHandler`] and settles it:
//!
//! - handled → ack
//! - malformed or unrecognized → ack, never retried
//! - handler failure the input can never get past → ack as rejected
//! - other handler failure → nack with requeue after a backoff pause,
//!   until `max_redeliveries` is hit
//!
//! A dropped connection sends the consumer back to connecting. Each
//! reconnect cycle is bounded by its retry policy; cycles repeat until
//! shutdown is signalled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use resilience::{with_retry, RetryConfig};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::schema::IndexEvent;
use super::transport::{Delivery, DeliveryTag, EventTransport, TopicBinding};
use crate::error::{ServiceError, TransportError};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Bound,
    Consuming,
}

/// Handler the consumer dispatches decoded events to
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_job(&self, event: &IndexEvent) -> Result<(), ServiceError>;

    async fn handle_profile(&self, event: &IndexEvent) -> Result<(), ServiceError>;

    /// Called once after the consumer stops taking deliveries
    async fn on_shutdown(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Job,
    Profile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Processed,
    Malformed,
    Ignored,
    Rejected,
    Failed,
    Dropped,
}

impl Settlement {
    fn label(self) -> &'static str {
        match self {
            Settlement::Processed => "processed",
            Settlement::Malformed => "malformed",
            Settlement::Ignored => "ignored",
            Settlement::Rejected => "rejected",
            Settlement::Failed => "failed",
            Settlement::Dropped => "dropped",
        }
    }
}

/// Counters for one consumer run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub processed: u64,
    pub malformed: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub failed: u64,
    pub dropped: u64,
    pub connect_cycles: u64,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub job_topic_prefix: String,
    pub profile_topic_prefix: String,
    /// 0 redelivers failed messages forever
    pub max_redeliveries: u32,
    /// Retry policy for one connect + bind cycle; its backoff also paces
    /// redeliveries of a failing message
    pub reconnect: RetryConfig,
}

pub struct EventConsumer<T: EventTransport> {
    transport: T,
    handler: Arc<dyn EventHandler>,
    options: ConsumerOptions,
    shutdown: watch::Receiver<bool>,
    state: ConsumerState,
    failures: HashMap<DeliveryTag, u32>,
    stats: ConsumerStats,
}

impl<T: EventTransport> EventConsumer<T> {
    pub fn new(
        transport: T,
        handler: Arc<dyn EventHandler>,
        options: ConsumerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            handler,
            options,
            shutdown,
            state: ConsumerState::Disconnected,
            failures: HashMap::new(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    fn bindings(&self) -> Vec<TopicBinding> {
        vec![
            TopicBinding::prefix(&self.options.job_topic_prefix),
            TopicBinding::prefix(&self.options.profile_topic_prefix),
        ]
    }

    fn route(&self, topic: &str) -> Option<Route> {
        if topic.starts_with(&self.options.job_topic_prefix) {
            Some(Route::Job)
        } else if topic.starts_with(&self.options.profile_topic_prefix) {
            Some(Route::Profile)
        } else {
            None
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Consume until shutdown is signalled or the transport closes
    pub async fn run(mut self) -> ConsumerStats {
        let bindings = self.bindings();
        let mut cycle_pause = self.options.reconnect.backoff();

        'cycles: loop {
            if self.shutdown_requested() {
                break;
            }

            self.state = ConsumerState::Connecting;
            self.stats.connect_cycles += 1;
            if self.stats.connect_cycles > 1 {
                metrics::record_reconnect();
            }

            let transport = &self.transport;
            let connect = with_retry(self.options.reconnect.clone(), || async {
                transport.connect().await?;
                transport.bind(&bindings).await
            });

            let connected = tokio::select! {
                result = connect => result,
                _ = self.shutdown.changed() => break 'cycles,
            };

            if let Err(e) = connected {
                self.transport.disconnect();
                self.state = ConsumerState::Disconnected;
                let pause = cycle_pause.next_delay();
                error!(error = %e, pause = ?pause, "Broker connect cycle failed; retrying");
                tokio::select! {
                    _ = tokio::time::sleep(pause) => continue 'cycles,
                    _ = self.shutdown.changed() => break 'cycles,
                }
            }

            cycle_pause.reset();
            self.state = ConsumerState::Bound;
            info!(bindings = ?bindings, "Event consumer bound");
            self.state = ConsumerState::Consuming;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.shutdown.changed() => break 'cycles,
                    next = self.transport.next_delivery() => next,
                };

                match next {
                    Ok(Some(delivery)) => self.process(delivery).await,
                    Ok(None) => {
                        info!("Transport closed; stopping event consumer");
                        break 'cycles;
                    }
                    Err(e) => {
                        warn!(error = %e, "Lost broker connection; reconnecting");
                        self.transport.disconnect();
                        self.state = ConsumerState::Disconnected;
                        continue 'cycles;
                    }
                }

                // The in-flight message is settled before shutdown is honoured
                if self.shutdown_requested() {
                    break 'cycles;
                }
            }
        }

        self.handler.on_shutdown().await;
        self.transport.disconnect();
        self.state = ConsumerState::Disconnected;
        info!(stats = ?self.stats, "Event consumer stopped");
        self.stats
    }

    async fn process(&mut self, delivery: Delivery) {
        let previous_failures = self.failures.get(&delivery.tag).copied().unwrap_or(0);
        if delivery.redelivered || previous_failures > 0 {
            metrics::record_redelivery();
        }

        let Some(route) = self.route(&delivery.topic) else {
            debug!(topic = %delivery.topic, "No route for topic");
            self.settle(&delivery, "unknown", Settlement::Ignored).await;
            return;
        };

        let event = match IndexEvent::decode(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    topic = %delivery.topic,
                    offset = delivery.tag.offset,
                    error = %e,
                    "Malformed event; acknowledging without retry"
                );
                self.settle(&delivery, "unknown", Settlement::Malformed).await;
                return;
            }
        };

        let kind = event.kind();
        let routed = match (&event, route) {
            (IndexEvent::JobCreated(_) | IndexEvent::JobUpdated(_), Route::Job) => true,
            (IndexEvent::ProfileUpdated(_), Route::Profile) => true,
            _ => false,
        };
        if !routed {
            debug!(topic = %delivery.topic, kind, "Ignoring event not handled on this topic");
            self.settle(&delivery, kind, Settlement::Ignored).await;
            return;
        }

        let started = Instant::now();
        let result = match route {
            Route::Job => self.handler.handle_job(&event).await,
            Route::Profile => self.handler.handle_profile(&event).await,
        };
        metrics::observe_event_duration(kind, started.elapsed());

        match result {
            Ok(()) => {
                self.failures.remove(&delivery.tag);
                self.settle(&delivery, kind, Settlement::Processed).await;
            }
            Err(e) if e.is_permanent() => {
                self.failures.remove(&delivery.tag);
                warn!(
                    topic = %delivery.topic,
                    offset = delivery.tag.offset,
                    error = %e,
                    "Event input rejected; acknowledging without retry"
                );
                self.settle(&delivery, kind, Settlement::Rejected).await;
            }
            Err(e) => {
                let failures = previous_failures + 1;
                let max = self.options.max_redeliveries;
                if max > 0 && failures > max {
                    self.failures.remove(&delivery.tag);
                    error!(
                        topic = %delivery.topic,
                        offset = delivery.tag.offset,
                        failures,
                        error = %e,
                        "Event failed after maximum redeliveries; dropping"
                    );
                    self.settle(&delivery, kind, Settlement::Dropped).await;
                } else {
                    self.failures.insert(delivery.tag.clone(), failures);
                    error!(
                        topic = %delivery.topic,
                        offset = delivery.tag.offset,
                        failures,
                        error = %e,
                        "Event handling failed; requeueing"
                    );
                    self.settle(&delivery, kind, Settlement::Failed).await;
                    self.pause_before_redelivery(failures).await;
                }
            }
        }
    }

    /// Back off before the requeued message comes round again
    async fn pause_before_redelivery(&mut self, failures: u32) {
        let mut backoff = self.options.reconnect.backoff();
        let pause = (1..failures).fold(backoff.next_delay(), |_, _| backoff.next_delay());
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn settle(&mut self, delivery: &Delivery, kind: &str, settlement: Settlement) {
        let result: Result<(), TransportError> = match settlement {
            Settlement::Failed => self.transport.nack(delivery, true).await,
            _ => self.transport.ack(delivery).await,
        };
        if let Err(e) = result {
            // Unsettled messages come back after reconnect
            warn!(topic = %delivery.topic, error = %e, "Failed to settle delivery");
        }

        match settlement {
            Settlement::Processed => self.stats.processed += 1,
            Settlement::Malformed => self.stats.malformed += 1,
            Settlement::Ignored => self.stats.ignored += 1,
            Settlement::Rejected => self.stats.rejected += 1,
            Settlement::Failed => self.stats.failed += 1,
            Settlement::Dropped => self.stats.dropped += 1,
        }
        metrics::record_event(kind, settlement.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EmbeddingError, StoreError};
    use crate::events::InMemoryTransport;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<IndexEvent>>,
        profiles: Mutex<Vec<IndexEvent>>,
        fail_jobs: AtomicUsize,
        reject_jobs: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_job(&self, event: &IndexEvent) -> Result<(), ServiceError> {
            if self
                .fail_jobs
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::InvalidRow("unavailable".into()).into());
            }
            if self
                .reject_jobs
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EmbeddingError::EmptyInput.into());
            }
            self.jobs.lock().push(event.clone());
            Ok(())
        }

        async fn handle_profile(&self, event: &IndexEvent) -> Result<(), ServiceError> {
            self.profiles.lock().push(event.clone());
            Ok(())
        }

        async fn on_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options(max_redeliveries: u32) -> ConsumerOptions {
        ConsumerOptions {
            job_topic_prefix: "job.".into(),
            profile_topic_prefix: "profile.".into(),
            max_redeliveries,
            reconnect: RetryConfig {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter: false,
            },
        }
    }

    fn job_event(job_id: &str) -> String {
        serde_json::json!({
            "event_type": "job.created",
            "data": {"job_id": job_id, "job_detail": "rust engineer"}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_routes_and_acks_every_delivery() {
        let transport = InMemoryTransport::new();
        let handler = Arc::new(Recorder::default());
        let (_tx, rx) = watch::channel(false);

        transport.publish("job.created", job_event("7d8f6c1e-3a0b-4c55-9b0e-1f2a3b4c5d6e"));
        transport.publish(
            "profile.updated",
            serde_json::json!({
                "event_type": "profile.updated",
                "data": {"user_id": "0c4a7f2e-5b1d-4e3f-8a9b-6c7d8e9f0a1b", "profile_detail": "python"}
            })
            .to_string(),
        );

        let stats = EventConsumer::new(transport.clone(), handler.clone(), options(0), rx)
            .run()
            .await;

        assert_eq!(stats.processed, 2);
        assert_eq!(handler.jobs.lock().len(), 1);
        assert_eq!(handler.profiles.lock().len(), 1);
        assert_eq!(transport.acked().len(), 2);
        assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_acked_and_consumption_continues() {
        let transport = InMemoryTransport::new();
        let handler = Arc::new(Recorder::default());
        let (_tx, rx) = watch::channel(false);

        let bad = transport.publish("job.created", "{not json");
        let unknown = transport.publish(
            "job.archived",
            r#"{"event_type":"job.archived","data":{}}"#,
        );
        transport.publish("job.created", job_event("7d8f6c1e-3a0b-4c55-9b0e-1f2a3b4c5d6e"));

        let stats = EventConsumer::new(transport.clone(), handler.clone(), options(0), rx)
            .run()
            .await;

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.processed, 1);
        let acked = transport.acked();
        assert!(acked.contains(&bad));
        assert!(acked.contains(&unknown));
        assert!(transport.nacked().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_requeues_until_success() {
        let transport = InMemoryTransport::new();
        let handler = Arc::new(Recorder::default());
        handler.fail_jobs.store(2, Ordering::SeqCst);
        let (_tx, rx) = watch::channel(false);

        let tag = transport.publish("job.updated", job_event("7d8f6c1e-3a0b-4c55-9b0e-1f2a3b4c5d6e"));

        let stats = EventConsumer::new(transport.clone(), handler.clone(), options(0), rx)
            .run()
            .await;

        assert_eq!(stats.failed, 2);
        assert_eq!(stats.processed, 1);
        assert_eq!(transport.nacked(), vec![(tag.clone(), true), (tag.clone(), true)]);
        assert_eq!(transport.acked(), vec![tag]);
    }

    #[tokio::test]
    async fn test_drops_after_max_redeliveries() {
        let transport = InMemoryTransport::new();
        let handler = Arc::new(Recorder::default());
        handler.fail_jobs.store(10, Ordering::SeqCst);
        let (_tx, rx) = watch::channel(false);

        let tag = transport.publish("job.updated", job_event("7d8f6c1e-3a0b-4c55-9b0e-1f2a3b4c5d6e"));

        let stats = EventConsumer::new(transport.clone(), handler.clone(), options(2), rx)
            .run()
            .await;

        // First delivery plus two redeliveries
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(transport.acked(), vec![tag]);
        assert!(handler.jobs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_acked_without_redelivery() {
        let transport = InMemoryTransport::new();
        let handler = Arc::new(Recorder::default());
        handler.reject_jobs.store(1, Ordering::SeqCst);
        let (_tx, rx) = watch::channel(false);

        let rejected = transport.publish("job.created", job_event("7d8f6c1e-3a0b-4c55-9b0e-1f2a3b4c5d6e"));
        let next = transport.publish("job.created", job_event("0c4a7f2e-5b1d-4e3f-8a9b-6c7d8e9f0a1b"));

        let stats = EventConsumer::new(transport.clone(), handler.clone(), options(0), rx)
            .run()
            .await;

        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.processed, 1);
        assert!(transport.nacked().is_empty());
        assert_eq!(transport.acked(), vec![rejected, next]);
        assert_eq!(handler.jobs.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_failed_cycles_and_dropped_connection() {
        let transport = InMemoryTransport::new();
        let handler = Arc::new(Recorder::default());
        let (_tx, rx) = watch::channel(false);

        // Two attempts per cycle, so the first cycle fails entirely
        transport.fail_next_connects(3);
        transport.fail_next_receives(1);
        transport.publish("job.created", job_event("7d8f6c1e-3a0b-4c55-9b0e-1f2a3b4c5d6e"));

        let stats = EventConsumer::new(transport.clone(), handler.clone(), options(0), rx)
            .run()
            .await;

        assert_eq!(stats.processed, 1);
        assert_eq!(stats.connect_cycles, 3);
        assert_eq!(transport.connect_attempts(), 5);
        assert_eq!(transport.bind_calls(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_consumer() {
        let transport = InMemoryTransport::open_ended();
        let handler = Arc::new(Recorder::default());
        let (tx, rx) = watch::channel(false);

        let consumer = EventConsumer::new(transport.clone(), handler.clone(), options(0), rx);
        let task = tokio::spawn(consumer.run());

        transport.publish("job.created", job_event("7d8f6c1e-3a0b-4c55-9b0e-1f2a3b4c5d6e"));
        for _ in 0..100 {
            if !transport.acked().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
    }
}
