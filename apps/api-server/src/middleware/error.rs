//! Error handling middleware - RFC 7807 compliant responses.

use std::time::Duration;

use actix_web::{
    HttpMessage, HttpRequest, HttpResponse, HttpResponseBuilder, ResponseError, http::StatusCode,
};
use bazaar_shared::ErrorResponse;

use crate::observability::RequestId;

/// Application-level error type that converts to RFC 7807 responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Too many requests, retry after {}ms", retry_after.as_millis())]
    TooManyRequests { retry_after: Duration, limit: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Whole seconds for a `Retry-After` header, rounded up and never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_millis().div_ceil(1000).max(1) as u64
}

impl AppError {
    /// Render the error for `req`, tagging the problem with its path and request ID.
    pub fn response_for(&self, req: &HttpRequest) -> HttpResponse {
        let mut problem = self.problem().with_instance(req.path());
        if let Some(id) = req.extensions().get::<RequestId>() {
            problem = problem.with_request_id(id.as_str());
        }
        self.builder().json(problem)
    }

    fn problem(&self) -> ErrorResponse {
        match self {
            AppError::TooManyRequests { retry_after, .. } => {
                ErrorResponse::too_many_requests(format!(
                    "Request exceeds rate limit. Try again in {} seconds.",
                    retry_after_secs(*retry_after)
                ))
            }
            AppError::NotFound(path) => {
                ErrorResponse::not_found(format!("Can't find {} on this server", path))
            }
            AppError::ServiceUnavailable(detail) => {
                tracing::error!("Service unavailable: {}", detail);
                ErrorResponse::service_unavailable()
            }
        }
    }

    fn builder(&self) -> HttpResponseBuilder {
        let mut builder = HttpResponse::build(self.status_code());
        if let AppError::TooManyRequests { retry_after, limit } = self {
            builder
                .insert_header(("Retry-After", retry_after_secs(*retry_after).to_string()))
                .insert_header(("X-RateLimit-Limit", limit.to_string()))
                .insert_header(("X-RateLimit-Remaining", "0"));
        }
        builder
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        self.builder().json(self.problem())
    }
}

/// Result type alias for handlers.
pub type AppResult<T> = Result<T, AppError>;
