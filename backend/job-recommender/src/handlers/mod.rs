//! HTTP handlers

pub mod health;
pub mod related;

use actix_web::web;

use crate::error::AppError;

pub use related::{get_related_jobs, RelatedJobsResponse, RelatedQuery};

/// Register every route on an app or scope
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _req| {
        AppError::BadRequest(err.to_string()).into()
    }))
    .route("/health", web::get().to(health::live))
    // Health endpoints for K8s probes
    .route("/api/v1/health/live", web::get().to(health::live))
    .route("/api/v1/health/ready", web::get().to(health::ready))
    .route("/metrics", web::get().to(crate::metrics::serve_metrics))
    .service(get_related_jobs);
}
