//! Related-jobs API
//!
//! Serves nearest neighbours of a job from the live index. Jobs that have
//! no embedding yet get an empty list rather than an error.

use actix_web::{routes, web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::ScoredJob;
use crate::services::RecommendationEngine;

/// Query parameters for GET /jobs/{job_id}/related
#[derive(Debug, Deserialize)]
pub struct RelatedQuery {
    /// Number of neighbours (default from config, max 100)
    pub k: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelatedJobsResponse {
    pub job_id: Uuid,
    pub related: Vec<ScoredJob>,
    pub count: usize,
}

#[routes]
#[get("/jobs/{job_id}/related")]
#[get("/api/v1/jobs/{job_id}/related")]
pub async fn get_related_jobs(
    engine: web::Data<RecommendationEngine>,
    path: web::Path<String>,
    query: web::Query<RelatedQuery>,
) -> Result<HttpResponse> {
    let raw = path.into_inner();
    let job_id = Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::BadRequest(format!("invalid job id: {}", raw)))?;

    let related = engine.related(&job_id, query.k);
    debug!(job_id = %job_id, count = related.len(), "Related jobs served");

    Ok(HttpResponse::Ok().json(RelatedJobsResponse {
        job_id,
        count: related.len(),
        related,
    }))
}
