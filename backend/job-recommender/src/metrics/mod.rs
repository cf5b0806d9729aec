//! Prometheus metrics for the job recommender
//!
//! Event handling, index lifecycle, recommendation output and HTTP traffic.

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Duration;

static EVENTS_PROCESSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "job_recommender_events_processed_total",
        "Inbound events by kind and outcome (processed/malformed/ignored/rejected/failed/dropped)",
        &["kind", "outcome"]
    )
    .expect("Failed to register events processed metric")
});

static EVENT_HANDLER_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "job_recommender_event_handler_duration_seconds",
        "Time spent handling one event, embedding included",
        &["kind"],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register event handler duration metric")
});

static EVENT_REDELIVERIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "job_recommender_event_redeliveries_total",
        "Deliveries that were already seen by this consumer"
    )
    .expect("Failed to register event redeliveries metric")
});

static CONSUMER_RECONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "job_recommender_consumer_reconnects_total",
        "Transport reconnect cycles started by the event consumer"
    )
    .expect("Failed to register consumer reconnects metric")
});

static INDEX_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "job_index_entries",
        "Number of vectors held by the in-memory job index"
    )
    .expect("Failed to register index size metric")
});

static INDEX_PERSISTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "job_index_persists_total",
        "Index persistence cycles (success/error/conflict)",
        &["status"]
    )
    .expect("Failed to register index persists metric")
});

static INDEX_LOAD_FALLBACKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "job_index_load_fallbacks_total",
        "Startup loads that fell back to an empty index",
        &["reason"]
    )
    .expect("Failed to register index load fallback metric")
});

static RECOMMENDATIONS_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "job_recommendations_written_total",
        "Recommendation rows upserted"
    )
    .expect("Failed to register recommendations written metric")
});

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "job_recommender_http_requests_total",
        "HTTP requests handled by job-recommender",
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP requests metric")
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "job_recommender_http_request_duration_seconds",
        "HTTP request latencies for job-recommender",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register HTTP request duration metric")
});

/// Record the outcome of one event
pub fn record_event(kind: &str, outcome: &str) {
    EVENTS_PROCESSED_TOTAL
        .with_label_values(&[kind, outcome])
        .inc();
}

pub fn observe_event_duration(kind: &str, duration: Duration) {
    EVENT_HANDLER_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(duration.as_secs_f64());
}

pub fn record_redelivery() {
    EVENT_REDELIVERIES_TOTAL.inc();
}

pub fn record_reconnect() {
    CONSUMER_RECONNECTS_TOTAL.inc();
}

pub fn set_index_size(entries: usize) {
    INDEX_SIZE.set(entries as i64);
}

pub fn record_persist(status: &str) {
    INDEX_PERSISTS_TOTAL.with_label_values(&[status]).inc();
}

pub fn persist_count(status: &str) -> u64 {
    INDEX_PERSISTS_TOTAL.with_label_values(&[status]).get()
}

/// Record a load that degraded to an empty index
pub fn record_load_fallback(reason: &str) {
    INDEX_LOAD_FALLBACKS_TOTAL
        .with_label_values(&[reason])
        .inc();
}

pub fn load_fallback_count(reason: &str) -> u64 {
    INDEX_LOAD_FALLBACKS_TOTAL
        .with_label_values(&[reason])
        .get()
}

pub fn record_recommendations(count: usize) {
    RECOMMENDATIONS_WRITTEN_TOTAL.inc_by(count as u64);
}

pub fn observe_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// Render the default registry in Prometheus text format
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %err, "Failed to encode metrics");
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
