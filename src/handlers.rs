//! # HTTP Request Handlers
//!
//! The HTTP façade over [`crate::resilience::RateLimiter`]: one route per
//! engine operation (`take`/`wait`/`put`/`get`), an admin reset endpoint,
//! and the two Kubernetes probes. Handlers stay thin - all admission logic
//! lives in the engine, these just extract/deserialize the request and
//! shape the response.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::engine::{TakeOptions, TakeResult};
use crate::error::ThrottlerError;
use crate::health::HealthChecker;
use crate::throttler::Throttler;

pub type SharedState = Arc<Throttler>;

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    #[serde(default = "default_put_count")]
    pub count: i64,
}

fn default_put_count() -> i64 {
    1
}

fn take_response(result: TakeResult) -> impl IntoResponse {
    let status = if result.conformant { StatusCode::OK } else { StatusCode::TOO_MANY_REQUESTS };
    let mut resp = (status, Json(result)).into_response();
    resp.headers_mut().insert("X-RateLimit-Limit", result.limit.to_string().parse().unwrap());
    resp.headers_mut().insert("X-RateLimit-Remaining", result.remaining.to_string().parse().unwrap());
    resp.headers_mut().insert("X-RateLimit-Reset", result.reset.to_string().parse().unwrap());
    resp
}

/// `POST /v1/:bucket_type/:key/take` - attempts to consume tokens without
/// blocking, returning `429` with rate-limit headers when denied.
pub async fn take(
    State(state): State<SharedState>,
    Path((bucket_type, key)): Path<(String, String)>,
    body: Option<Json<TakeOptions>>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let opts = body.map(|Json(b)| b).unwrap_or_default();
    state.validator.validate_key(&key)?;
    state.validator.validate_take_options(&opts)?;

    let result = state.limiter.take(&bucket_type, &key, opts).await?;
    state.metrics.record_take(&bucket_type, result.conformant).await;
    Ok(take_response(result))
}

/// `POST /v1/:bucket_type/:key/wait` - blocks until the bucket can admit
/// the requested tokens, then returns `200`.
pub async fn wait(
    State(state): State<SharedState>,
    Path((bucket_type, key)): Path<(String, String)>,
    body: Option<Json<TakeOptions>>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let opts = body.map(|Json(b)| b).unwrap_or_default();
    state.validator.validate_key(&key)?;
    state.validator.validate_take_options(&opts)?;

    let result = state.limiter.wait(&bucket_type, &key, opts).await?;
    state.metrics.record_take(&bucket_type, result.conformant).await;
    Ok(take_response(result))
}

/// `POST /v1/:bucket_type/:key/put` - returns tokens to a bucket (or
/// removes them with a negative `count`).
pub async fn put(
    State(state): State<SharedState>,
    Path((bucket_type, key)): Path<(String, String)>,
    body: Option<Json<PutRequest>>,
) -> Result<impl IntoResponse, ThrottlerError> {
    state.validator.validate_key(&key)?;
    let count = body.map(|Json(b)| b.count).unwrap_or(1);
    let result = state.limiter.put(&bucket_type, &key, count).await?;
    Ok(Json(result))
}

/// `GET /v1/:bucket_type/:key` - reports current bucket state without
/// consuming any tokens.
pub async fn get(
    State(state): State<SharedState>,
    Path((bucket_type, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ThrottlerError> {
    state.validator.validate_key(&key)?;
    let result = state.limiter.get(&bucket_type, &key).await?;
    Ok(Json(result))
}

/// `POST /v1/admin/reset-all` - flushes every bucket. Intended for
/// operator/test use, not exposed to regular callers behind a gateway.
pub async fn reset_all(State(state): State<SharedState>) -> Result<impl IntoResponse, ThrottlerError> {
    state.limiter.reset_all().await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// `GET /health` - liveness probe. Always `200` as long as the process is
/// serving requests; does not touch the store.
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

/// `GET /ready` - readiness probe. Reports the ping monitor's cached
/// failure count rather than issuing a fresh synchronous `PING` per
/// request, which would make every readiness check pay a store round trip.
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let health = HealthChecker::check(&state);
    let status = if health.status == "healthy" { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let global_metrics = state.metrics.global().await;

    (status, Json(json!({ "health": health, "metrics": global_metrics })))
}
