//! Admission gate - rate limiting middleware in front of every route.

use actix_web::{
    Error,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header::{HeaderName, HeaderValue},
};
use std::future::{Future, Ready, ready};
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use bazaar_core::ports::RateLimiter;

use super::error::AppError;

/// Rate limiting middleware factory.
pub struct AdmissionGate {
    limiter: Arc<dyn RateLimiter>,
    trust_proxy_headers: bool,
}

impl AdmissionGate {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            trust_proxy_headers: false,
        }
    }

    /// Key clients by `Forwarded`/`X-Forwarded-For` instead of the socket peer.
    /// Only safe behind a proxy that overwrites those headers.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for AdmissionGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AdmissionGateService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AdmissionGateService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            trust_proxy_headers: self.trust_proxy_headers,
        }))
    }
}

pub struct AdmissionGateService<S> {
    service: Rc<S>,
    limiter: Arc<dyn RateLimiter>,
    trust_proxy_headers: bool,
}

impl<S, B> Service<ServiceRequest> for AdmissionGateService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let limiter = self.limiter.clone();
        let service = self.service.clone();
        let identity = client_identity(&req, self.trust_proxy_headers);

        Box::pin(async move {
            let verdict = limiter.admit(&identity, chrono::Utc::now()).await;

            if !verdict.allowed {
                tracing::warn!(
                    identity = %identity,
                    retry_after_ms = verdict.retry_after.as_millis() as u64,
                    degraded = verdict.degraded,
                    "Rate limit exceeded"
                );

                let error = AppError::TooManyRequests {
                    retry_after: verdict.retry_after,
                    limit: verdict.limit,
                };
                let (http_req, _payload) = req.into_parts();
                let response = error.response_for(&http_req);

                return Ok(ServiceResponse::new(http_req, response).map_into_right_body());
            }

            let mut res = service.call(req).await?;

            // A degraded admission says nothing about the bucket.
            if !verdict.degraded {
                let headers = res.headers_mut();
                headers.insert(
                    HeaderName::from_static("x-ratelimit-limit"),
                    HeaderValue::from(verdict.limit),
                );
                headers.insert(
                    HeaderName::from_static("x-ratelimit-remaining"),
                    HeaderValue::from(verdict.remaining),
                );
            }

            Ok(res.map_into_left_body())
        })
    }
}

/// Client identity used as the bucket key: the peer IP without its port.
fn client_identity(req: &ServiceRequest, trust_proxy_headers: bool) -> String {
    let info = req.connection_info();
    let addr = if trust_proxy_headers {
        info.realip_remote_addr()
    } else {
        info.peer_addr()
    };

    addr.map(host_only).unwrap_or_else(|| "unknown".to_string())
}

fn host_only(addr: &str) -> String {
    match addr.parse::<SocketAddr>() {
        Ok(socket) => socket.ip().to_string(),
        Err(_) => addr.trim_start_matches('[').trim_end_matches(']').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpResponse, http::StatusCode, test, web};
    use bazaar_core::{FailurePolicy, RateLimitConfig, TokenBucketLimiter};
    use bazaar_core::domain::BucketRecord;
    use bazaar_core::ports::{BucketStore, SaveOutcome, StoreError};
    use bazaar_infra::InMemoryBucketStore;
    use std::time::Duration;

    fn limiter(capacity: u32, store: Arc<dyn BucketStore>) -> Arc<dyn RateLimiter> {
        let config = RateLimitConfig::per_window(capacity, Duration::from_secs(60));
        Arc::new(TokenBucketLimiter::new(store, config).unwrap())
    }

    fn from_peer(ip: &str) -> test::TestRequest {
        test::TestRequest::get()
            .uri("/")
            .peer_addr(format!("{}:40000", ip).parse().unwrap())
    }

    struct DownStore;

    #[async_trait::async_trait]
    impl BucketStore for DownStore {
        async fn load(&self, _identity: &str) -> Result<Option<BucketRecord>, StoreError> {
            Err(StoreError::Unavailable("refused".to_string()))
        }

        async fn save(
            &self,
            _identity: &str,
            _record: &BucketRecord,
        ) -> Result<SaveOutcome, StoreError> {
            Err(StoreError::Unavailable("refused".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("refused".to_string()))
        }
    }

    #[actix_web::test]
    async fn test_rejects_with_429_after_capacity() {
        let limiter = limiter(2, Arc::new(InMemoryBucketStore::new()));
        let app = test::init_service(
            App::new()
                .wrap(AdmissionGate::new(limiter))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let res = test::call_service(&app, from_peer("203.0.113.9").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers().get("X-RateLimit-Limit").unwrap(), "2");
        assert_eq!(res.headers().get("X-RateLimit-Remaining").unwrap(), "1");

        let res = test::call_service(&app, from_peer("203.0.113.9").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = test::call_service(&app, from_peer("203.0.113.9").to_request()).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        // 2 per minute: one token every 30 seconds.
        let retry_after: u64 = res
            .headers()
            .get("Retry-After")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((29..=30).contains(&retry_after));

        // Another client has its own bucket.
        let res = test::call_service(&app, from_peer("198.51.100.1").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_rejection_body_is_problem_document() {
        let limiter = limiter(1, Arc::new(InMemoryBucketStore::new()));
        let app = test::init_service(
            App::new()
                .wrap(AdmissionGate::new(limiter))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        test::call_service(&app, from_peer("203.0.113.9").to_request()).await;
        let res = test::call_service(&app, from_peer("203.0.113.9").to_request()).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

        let body: serde_json::Value = test::read_body_json(res).await;
        assert_eq!(body["status"], 429);
        assert_eq!(body["title"], "Too Many Requests");
        assert_eq!(body["instance"], "/");
    }

    #[actix_web::test]
    async fn test_store_outage_follows_policy() {
        let closed = limiter(5, Arc::new(DownStore));
        let app = test::init_service(
            App::new()
                .wrap(AdmissionGate::new(closed))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;
        let res = test::call_service(&app, from_peer("203.0.113.9").to_request()).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

        let config = RateLimitConfig::per_window(5, Duration::from_secs(60))
            .with_failure_policy(FailurePolicy::Open);
        let open: Arc<dyn RateLimiter> =
            Arc::new(TokenBucketLimiter::new(Arc::new(DownStore), config).unwrap());
        let app = test::init_service(
            App::new()
                .wrap(AdmissionGate::new(open))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;
        let res = test::call_service(&app, from_peer("203.0.113.9").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get("x-ratelimit-limit").is_none());
        assert!(res.headers().get("x-ratelimit-remaining").is_none());
    }

    #[actix_web::test]
    async fn test_forwarded_header_ignored_unless_trusted() {
        let store = Arc::new(InMemoryBucketStore::new());
        let app = test::init_service(
            App::new()
                .wrap(AdmissionGate::new(limiter(1, store.clone())))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let spoofed = from_peer("203.0.113.9").insert_header(("X-Forwarded-For", "192.0.2.1"));
        test::call_service(&app, spoofed.to_request()).await;

        assert!(store.load("203.0.113.9").await.unwrap().is_some());
        assert!(store.load("192.0.2.1").await.unwrap().is_none());

        let trusted_store = Arc::new(InMemoryBucketStore::new());
        let app = test::init_service(
            App::new()
                .wrap(
                    AdmissionGate::new(limiter(1, trusted_store.clone())).trust_proxy_headers(true),
                )
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let proxied = from_peer("10.0.0.2").insert_header(("X-Forwarded-For", "192.0.2.1"));
        test::call_service(&app, proxied.to_request()).await;
        assert!(trusted_store.load("192.0.2.1").await.unwrap().is_some());
    }

    #[::core::prelude::v1::test]
    fn test_host_only_strips_port() {
        assert_eq!(host_only("203.0.113.9:40000"), "203.0.113.9");
        assert_eq!(host_only("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(host_only("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(host_only("203.0.113.9"), "203.0.113.9");
    }
}
