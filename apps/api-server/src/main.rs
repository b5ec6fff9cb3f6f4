//! # Bazaar API Server
//!
//! The Actix-web entry point. Every request passes the admission gate
//! before reaching a handler.

use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use bazaar_core::ports::RateLimiter;
use tracing_actix_web::TracingLogger;

mod config;
mod handlers;
mod middleware;
mod observability;
mod state;
mod telemetry;

use config::AppConfig;
use middleware::rate_limit::AdmissionGate;
use observability::RequestIdMiddleware;
use state::AppState;
use telemetry::TelemetryConfig;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    telemetry::init_telemetry(&TelemetryConfig::from_env());

    let config = AppConfig::from_env().map_err(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::io::Error::other(e)
    })?;

    tracing::info!(
        "Starting Bazaar API Server on {}:{}",
        config.host,
        config.port
    );

    // Build application state; the bucket store is connected once here
    let state = AppState::new(&config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize application state");
        std::io::Error::other(e)
    })?;

    let limiter: Arc<dyn RateLimiter> = state.limiter.clone();
    let trust_proxy_headers = config.trust_proxy_headers;

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .wrap(AdmissionGate::new(limiter.clone()).trust_proxy_headers(trust_proxy_headers))
            .wrap(RequestIdMiddleware)
            .wrap(TracingLogger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(handlers::configure_routes)
            .default_service(web::to(handlers::not_found))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}
