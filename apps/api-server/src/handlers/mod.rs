//! HTTP handlers and route configuration.

mod health;

use actix_web::{HttpRequest, HttpResponse, web};

use crate::middleware::error::AppError;

/// Configure all application routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/api").route("/health", web::get().to(health::health_check)));
}

/// Fallback for unknown paths.
pub async fn not_found(req: HttpRequest) -> HttpResponse {
    AppError::NotFound(req.path().to_string()).response_for(&req)
}
