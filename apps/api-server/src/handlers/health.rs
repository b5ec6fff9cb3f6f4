//! Health check endpoint.

use actix_web::{HttpResponse, web};
use bazaar_shared::ApiResponse;
use serde::Serialize;

use crate::middleware::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub store: String,
}

/// Health check endpoint - returns server status and bucket store reachability.
///
/// GET /api/health
pub async fn health_check(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    state
        .limiter
        .ping()
        .await
        .map_err(|e| AppError::ServiceUnavailable(format!("{} store: {}", state.backend, e)))?;

    let response = HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        store: state.backend.to_string(),
    };

    Ok(HttpResponse::Ok().json(ApiResponse::ok(response)))
}
