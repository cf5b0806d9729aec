//! End-to-end event flow: transport → consumer → indexer / engine → stores

use std::sync::Arc;
use std::time::Duration;

use job_recommender::config::{default_max_redeliveries, RecommendationConfig};
use job_recommender::db::{InMemoryEmbeddingStore, InMemoryIndexStore, InMemoryRecommendationStore};
use job_recommender::embedding::HashEmbedder;
use job_recommender::events::{ConsumerOptions, ConsumerStats, EventConsumer, InMemoryTransport};
use job_recommender::index::{bootstrap_index, BootstrapOptions, SharedJobIndex};
use job_recommender::services::{EventProcessor, JobIndexer, RecommendationEngine};
use resilience::RetryConfig;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

const DIM: usize = 64;

struct Harness {
    embeddings: Arc<InMemoryEmbeddingStore>,
    index_store: Arc<InMemoryIndexStore>,
    recommendations: Arc<InMemoryRecommendationStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            embeddings: Arc::new(InMemoryEmbeddingStore::new()),
            index_store: Arc::new(InMemoryIndexStore::new()),
            recommendations: Arc::new(InMemoryRecommendationStore::new()),
        }
    }

    fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            name: "jobit_job_index".into(),
            dimension: DIM,
            persist_interval: Duration::from_secs(3600),
            rebuild_on_fallback: false,
            page_size: 100,
        }
    }

    /// Start from whatever is persisted and consume until the transport drains
    async fn run(&self, transport: InMemoryTransport) -> (ConsumerStats, SharedJobIndex) {
        let embedder = Arc::new(HashEmbedder::new(DIM));
        let (index, persistence) = bootstrap_index(
            self.index_store.clone(),
            self.embeddings.as_ref(),
            &self.bootstrap_options(),
        )
        .await
        .unwrap();

        let engine = Arc::new(RecommendationEngine::new(
            index.clone(),
            embedder.clone(),
            self.recommendations.clone(),
            &RecommendationConfig {
                threshold: 0.7,
                default_k: 5,
            },
        ));
        let indexer = JobIndexer::new(embedder, self.embeddings.clone(), index.clone());
        let processor = Arc::new(EventProcessor::new(indexer, engine, persistence, index.clone()));

        let (_tx, rx) = watch::channel(false);
        let consumer = EventConsumer::new(
            transport,
            processor,
            ConsumerOptions {
                job_topic_prefix: "job.".into(),
                profile_topic_prefix: "profile.".into(),
                max_redeliveries: default_max_redeliveries(),
                reconnect: RetryConfig {
                    max_retries: 2,
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(5),
                    backoff_multiplier: 2.0,
                    jitter: false,
                },
            },
            rx,
        );
        (consumer.run().await, index)
    }
}

fn job_event(event_type: &str, job_id: Uuid, detail: Option<&str>) -> String {
    let mut data = json!({ "job_id": job_id.to_string(), "job_expiration": null });
    if let Some(detail) = detail {
        data["job_detail"] = json!(detail);
    }
    json!({
        "event_type": event_type,
        "timestamp": "2025-03-01T12:00:00Z",
        "data": data,
    })
    .to_string()
}

fn profile_event(user_id: Uuid, detail: &str) -> String {
    json!({
        "event_type": "profile.updated",
        "timestamp": "2025-03-01T12:05:00",
        "data": { "user_id": user_id.to_string(), "profile_detail": detail },
    })
    .to_string()
}

#[tokio::test]
async fn job_events_feed_profile_recommendations() {
    let harness = Harness::new();
    let transport = InMemoryTransport::new();
    let rust_job = Uuid::new_v4();
    let chef_job = Uuid::new_v4();
    let user = Uuid::new_v4();

    transport.publish(
        "job.created",
        job_event("job.created", rust_job, Some("Rust backend engineer async tokio postgres")),
    );
    transport.publish(
        "job.created",
        job_event("job.created", chef_job, Some("Pastry chef for a busy bakery")),
    );
    transport.publish(
        "profile.updated",
        profile_event(user, "Rust backend engineer async tokio postgres"),
    );

    let (stats, index) = harness.run(transport.clone()).await;

    assert_eq!(stats.processed, 3);
    assert_eq!(index.read().len(), 2);
    let recs = harness.recommendations.for_user(&user);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].job_id, rust_job);
    assert!(recs[0].similarity_score >= 0.7);
}

#[tokio::test]
async fn missing_job_detail_is_acked_and_next_message_processed() {
    let harness = Harness::new();
    let transport = InMemoryTransport::new();
    let good = Uuid::new_v4();

    let bad_tag = transport.publish("job.created", job_event("job.created", Uuid::new_v4(), None));
    transport.publish("job.created", job_event("job.created", good, Some("site reliability engineer")));

    let (stats, index) = harness.run(transport.clone()).await;

    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.processed, 1);
    assert!(transport.acked().contains(&bad_tag));
    assert!(transport.nacked().is_empty());
    assert!(index.read().contains(&good));
}

#[tokio::test]
async fn unembeddable_job_detail_does_not_block_later_events() {
    let harness = Harness::new();
    let transport = InMemoryTransport::new();
    let punctuation_only = Uuid::new_v4();
    let valid = Uuid::new_v4();

    let stuck = transport.publish(
        "job.created",
        job_event("job.created", punctuation_only, Some("!!! ---")),
    );
    let next = transport.publish(
        "job.created",
        job_event("job.created", valid, Some("rust engineer")),
    );

    let (stats, index) = tokio::time::timeout(Duration::from_secs(5), harness.run(transport.clone()))
        .await
        .expect("consumer must drain the queue");

    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);
    assert!(transport.nacked().is_empty());
    assert_eq!(transport.acked(), vec![stuck, next]);
    let index = index.read();
    assert!(!index.contains(&punctuation_only));
    assert!(index.contains(&valid));
}

#[tokio::test]
async fn replayed_update_keeps_one_row_per_job() {
    let harness = Harness::new();
    let transport = InMemoryTransport::new();
    let job = Uuid::new_v4();
    let event = job_event("job.updated", job, Some("product designer figma"));

    transport.publish("job.updated", event.clone());
    transport.publish("job.updated", event);

    let (stats, index) = harness.run(transport).await;

    assert_eq!(stats.processed, 2);
    assert_eq!(harness.embeddings.len(), 1);
    assert_eq!(index.read().len(), 1);
}

#[tokio::test]
async fn transient_store_failure_is_redelivered() {
    let harness = Harness::new();
    let transport = InMemoryTransport::new();
    let job = Uuid::new_v4();
    harness.embeddings.fail_next_upserts(1);

    let tag = transport.publish("job.created", job_event("job.created", job, Some("nurse")));

    let (stats, index) = harness.run(transport.clone()).await;

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(transport.nacked(), vec![(tag, true)]);
    assert!(index.read().contains(&job));
}

#[tokio::test]
async fn consumer_survives_broker_outage() {
    let harness = Harness::new();
    let transport = InMemoryTransport::new();
    // First cycle (three attempts) fails, second cycle connects
    transport.fail_next_connects(4);
    transport.publish(
        "job.created",
        job_event("job.created", Uuid::new_v4(), Some("warehouse operator")),
    );

    let (stats, _) = harness.run(transport.clone()).await;

    assert_eq!(stats.connect_cycles, 2);
    assert_eq!(stats.processed, 1);
    assert_eq!(transport.bind_calls(), 1);
}

#[tokio::test]
async fn restart_resumes_from_persisted_index() {
    let harness = Harness::new();
    let first = InMemoryTransport::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    first.publish("job.created", job_event("job.created", a, Some("backend engineer rust")));
    first.publish("job.created", job_event("job.created", b, Some("backend engineer go")));

    let (_, before) = harness.run(first).await;
    let related_before = before.read().related_jobs(&a, 5, chrono::Utc::now());

    // Nothing new on the second run; the index comes back from the store
    let (_, after) = harness.run(InMemoryTransport::new()).await;
    let related_after = after.read().related_jobs(&a, 5, chrono::Utc::now());

    assert_eq!(after.read().len(), 2);
    assert_eq!(related_before, related_after);
}
