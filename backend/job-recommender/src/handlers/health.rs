use actix_web::{web, HttpResponse};
use serde::Serialize;

use crate::services::RecommendationEngine;

#[derive(Debug, Serialize)]
struct ReadyResponse<'a> {
    status: &'a str,
    index: String,
    entries: usize,
    distinct_jobs: usize,
}

pub async fn live() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Ready as soon as an index is in memory, even an empty one
pub async fn ready(engine: web::Data<RecommendationEngine>) -> HttpResponse {
    let index = engine.index().read();
    HttpResponse::Ok().json(ReadyResponse {
        status: "ready",
        index: index.name().to_string(),
        entries: index.len(),
        distinct_jobs: index.distinct_jobs(),
    })
}
