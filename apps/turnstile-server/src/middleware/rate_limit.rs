//! Admission middleware - per-identity rate limiting in front of the routes
//! it wraps.

use actix_web::{
    Error, HttpMessage, HttpResponse,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header::{HeaderName, HeaderValue},
};
use std::future::{Future, Ready, ready};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing_actix_web::RequestId;
use turnstile_core::{IdentityKey, LimitPolicy, RateDecisionEngine, Verdict};
use turnstile_shared::{ErrorResponse, headers};

/// How identities and limits are derived from a request.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub limits: LimitPolicy,
    /// Header carrying the caller's token.
    pub token_header: HeaderName,
    /// Take the client IP from `Forwarded` / `X-Forwarded-For` instead of
    /// the socket peer. Only safe behind a proxy that sets them.
    pub trust_forwarded_headers: bool,
}

/// Admission middleware factory.
#[derive(Clone)]
pub struct AdmissionMiddleware {
    engine: Arc<RateDecisionEngine>,
    config: Arc<AdmissionConfig>,
}

impl AdmissionMiddleware {
    pub fn new(engine: Arc<RateDecisionEngine>, config: AdmissionConfig) -> Self {
        Self {
            engine,
            config: Arc::new(config),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AdmissionMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AdmissionMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AdmissionMiddlewareService {
            service: Rc::new(service),
            engine: self.engine.clone(),
            config: self.config.clone(),
        }))
    }
}

pub struct AdmissionMiddlewareService<S> {
    service: Rc<S>,
    engine: Arc<RateDecisionEngine>,
    config: Arc<AdmissionConfig>,
}

impl<S, B> Service<ServiceRequest> for AdmissionMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let engine = self.engine.clone();
        let (key, limit) = resolve_identity(&req, &self.config);

        if key == IdentityKey::Unknown {
            tracing::warn!("No token or peer address on request, using shared identity");
        }

        Box::pin(async move {
            match engine.evaluate(&key, limit).await {
                Ok(Verdict::Allowed {
                    remaining,
                    reset_in,
                }) => {
                    tracing::debug!(
                        identity = %key.redacted(),
                        limit,
                        remaining,
                        "Request admitted"
                    );

                    let mut res = service.call(req).await?;
                    let response_headers = res.headers_mut();
                    response_headers.insert(
                        HeaderName::from_static(headers::RATE_LIMIT_LIMIT),
                        HeaderValue::from(limit),
                    );
                    response_headers.insert(
                        HeaderName::from_static(headers::RATE_LIMIT_REMAINING),
                        HeaderValue::from(remaining),
                    );
                    response_headers.insert(
                        HeaderName::from_static(headers::RATE_LIMIT_RESET),
                        HeaderValue::from(whole_seconds(reset_in)),
                    );
                    Ok(res.map_into_left_body())
                }
                Ok(Verdict::Denied { retry_after }) => {
                    let retry_after = whole_seconds(retry_after);
                    tracing::warn!(
                        identity = %key.redacted(),
                        limit,
                        retry_after_secs = retry_after,
                        "Rate limit exceeded"
                    );

                    let error = with_request_id(ErrorResponse::too_many_requests(retry_after), &req);
                    let response = HttpResponse::TooManyRequests()
                        .insert_header((headers::RETRY_AFTER, retry_after.to_string()))
                        .insert_header((headers::RATE_LIMIT_LIMIT, limit.to_string()))
                        .insert_header((headers::RATE_LIMIT_REMAINING, "0"))
                        .json(error);

                    Ok(req.into_response(response).map_into_right_body())
                }
                Err(e) => {
                    // Fail closed: an unmetered request is never let through.
                    tracing::error!(
                        identity = %key.redacted(),
                        error = %e,
                        "Counter store unavailable, rejecting request"
                    );

                    let error = with_request_id(ErrorResponse::internal_error(), &req);
                    let response = HttpResponse::InternalServerError().json(error);

                    Ok(req.into_response(response).map_into_right_body())
                }
            }
        })
    }
}

/// Pick the identity key and limit for a request.
fn resolve_identity(req: &ServiceRequest, config: &AdmissionConfig) -> (IdentityKey, u32) {
    let token = req
        .headers()
        .get(&config.token_header)
        .and_then(|v| v.to_str().ok());

    let peer = if config.trust_forwarded_headers {
        req.connection_info()
            .realip_remote_addr()
            .map(str::to_owned)
    } else {
        req.peer_addr().map(|addr| addr.ip().to_string())
    };

    config.limits.resolve(token, peer.as_deref())
}

fn with_request_id(error: ErrorResponse, req: &ServiceRequest) -> ErrorResponse {
    match req.extensions().get::<RequestId>() {
        Some(id) => error.with_request_id(id.to_string()),
        None => error,
    }
}

/// Whole seconds, rounded up so callers never retry early.
fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, test, web};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use turnstile_core::domain::{Deadline, Record};
    use turnstile_core::ports::{CounterStore, IncrementOutcome, StoreError};
    use turnstile_core::EngineConfig;
    use turnstile_infra::InMemoryCounterStore;

    /// A store whose every call fails.
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn get(&self, _key: &str, _deadline: Deadline) -> Result<Option<Record>, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        async fn increment_and_refresh(
            &self,
            _key: &str,
            _window: Duration,
            _deadline: Deadline,
        ) -> Result<IncrementOutcome, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        async fn set_with_expiry(
            &self,
            _key: &str,
            _record: Record,
            _ttl: Duration,
            _deadline: Deadline,
        ) -> Result<(), StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        async fn set_if_absent(
            &self,
            _key: &str,
            _record: Record,
            _ttl: Duration,
            _deadline: Deadline,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        async fn time_to_live(
            &self,
            _key: &str,
            _deadline: Deadline,
        ) -> Result<Option<Duration>, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }
    }

    fn middleware(
        store: Arc<dyn CounterStore>,
        trust_forwarded_headers: bool,
    ) -> AdmissionMiddleware {
        let engine = RateDecisionEngine::new(
            store,
            EngineConfig {
                window: Duration::from_secs(3),
                block_duration: Duration::from_secs(30),
                store_timeout: Duration::from_millis(250),
            },
        );
        AdmissionMiddleware::new(
            Arc::new(engine),
            AdmissionConfig {
                limits: LimitPolicy {
                    per_ip: 3,
                    per_token: 5,
                },
                token_header: HeaderName::from_static("api_key"),
                trust_forwarded_headers,
            },
        )
    }

    /// App whose single handler counts how often it was reached.
    macro_rules! counting_app {
        ($store:expr, $hits:expr) => {
            counting_app!($store, $hits, false)
        };
        ($store:expr, $hits:expr, $trust:expr) => {{
            let hits = $hits.clone();
            test::init_service(App::new().wrap(middleware($store, $trust)).default_service(web::to(
                move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        HttpResponse::Ok().body("Hello, World!")
                    }
                },
            )))
            .await
        }};
    }

    fn from_ip(addr: &str) -> test::TestRequest {
        let peer: SocketAddr = addr.parse().unwrap();
        test::TestRequest::get().uri("/").peer_addr(peer)
    }

    fn header(res: &ServiceResponse<impl actix_web::body::MessageBody>, name: &str) -> String {
        res.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[actix_web::test]
    async fn test_ip_limit_then_block() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = counting_app!(Arc::new(InMemoryCounterStore::new()), hits);

        for expected in ["2", "1", "0"] {
            let res = test::call_service(&app, from_ip("192.168.1.1:12345").to_request()).await;
            assert_eq!(res.status(), 200);
            assert_eq!(header(&res, "X-RateLimit-Limit"), "3");
            assert_eq!(header(&res, "X-RateLimit-Remaining"), expected);
            assert_eq!(header(&res, "X-RateLimit-Reset"), "3");
        }

        let res = test::call_service(&app, from_ip("192.168.1.1:12345").to_request()).await;
        assert_eq!(res.status(), 429);
        assert_eq!(header(&res, "Retry-After"), "30");
        assert_eq!(header(&res, "X-RateLimit-Remaining"), "0");

        let body: ErrorResponse = test::read_body_json(res).await;
        assert_eq!(body.status, 429);
        assert_eq!(body.retry_after, Some(30));
        assert!(
            body.detail
                .unwrap()
                .starts_with(turnstile_shared::response::TOO_MANY_REQUESTS_DETAIL)
        );

        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[actix_web::test]
    async fn test_port_does_not_split_identity() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = counting_app!(Arc::new(InMemoryCounterStore::new()), hits);

        for port in [1000, 2000, 3000] {
            let res =
                test::call_service(&app, from_ip(&format!("10.0.0.1:{}", port)).to_request()).await;
            assert_eq!(res.status(), 200);
        }

        let res = test::call_service(&app, from_ip("10.0.0.1:4000").to_request()).await;
        assert_eq!(res.status(), 429);

        // A different address is unaffected.
        let res = test::call_service(&app, from_ip("10.0.0.2:4000").to_request()).await;
        assert_eq!(res.status(), 200);
    }

    #[actix_web::test]
    async fn test_token_limit_follows_token() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = counting_app!(Arc::new(InMemoryCounterStore::new()), hits);

        for i in 0..5 {
            let req = from_ip(&format!("10.0.0.{}:80", i + 1))
                .insert_header(("API_KEY", "test-token"))
                .to_request();
            let res = test::call_service(&app, req).await;
            assert_eq!(res.status(), 200);
            assert_eq!(header(&res, "X-RateLimit-Limit"), "5");
        }

        let req = from_ip("10.0.0.99:80")
            .insert_header(("API_KEY", "test-token"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), 429);

        // The IPs that carried the token still have their own budget.
        let res = test::call_service(&app, from_ip("10.0.0.1:80").to_request()).await;
        assert_eq!(res.status(), 200);
        assert_eq!(header(&res, "X-RateLimit-Remaining"), "2");
    }

    #[actix_web::test]
    async fn test_blank_token_uses_ip_limit() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = counting_app!(Arc::new(InMemoryCounterStore::new()), hits);

        let req = from_ip("10.0.0.5:80")
            .insert_header(("API_KEY", "  "))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), 200);
        assert_eq!(header(&res, "X-RateLimit-Limit"), "3");
    }

    #[actix_web::test]
    async fn test_store_failure_fails_closed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = counting_app!(Arc::new(DownStore), hits);

        let res = test::call_service(&app, from_ip("10.0.0.1:80").to_request()).await;
        assert_eq!(res.status(), 500);

        let body: ErrorResponse = test::read_body_json(res).await;
        assert_eq!(body.status, 500);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_trusted_forwarded_for_sets_identity() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryCounterStore::new());
        let app = counting_app!(store.clone(), hits, true);

        // Different proxies, same original client.
        for proxy in ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"] {
            let req = from_ip(proxy)
                .insert_header(("X-Forwarded-For", "203.0.113.5:1234, 10.0.0.1"))
                .to_request();
            let res = test::call_service(&app, req).await;
            assert_eq!(res.status(), 200);
        }

        let deadline = Deadline::after(Duration::from_secs(1));
        assert_eq!(
            store.get("ip:203.0.113.5", deadline).await.unwrap(),
            Some(Record::Counter(3))
        );
        assert_eq!(store.get("ip:10.0.0.1", deadline).await.unwrap(), None);

        let req = from_ip("10.0.0.4:80")
            .insert_header(("X-Forwarded-For", "203.0.113.5"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), 429);
    }

    #[actix_web::test]
    async fn test_forwarded_for_ignored_when_untrusted() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryCounterStore::new());
        let app = counting_app!(store.clone(), hits, false);

        for proxy in ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80", "10.0.0.4:80"] {
            let req = from_ip(proxy)
                .insert_header(("X-Forwarded-For", "203.0.113.5:1234, 10.0.0.1"))
                .to_request();
            let res = test::call_service(&app, req).await;
            assert_eq!(res.status(), 200);
            assert_eq!(header(&res, "X-RateLimit-Remaining"), "2");
        }

        let deadline = Deadline::after(Duration::from_secs(1));
        assert_eq!(store.get("ip:203.0.113.5", deadline).await.unwrap(), None);
        assert_eq!(
            store.get("ip:10.0.0.1", deadline).await.unwrap(),
            Some(Record::Counter(1))
        );
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[actix_web::test]
    async fn test_whole_seconds_rounds_up() {
        assert_eq!(whole_seconds(Duration::from_secs(3)), 3);
        assert_eq!(whole_seconds(Duration::from_millis(2001)), 3);
        assert_eq!(whole_seconds(Duration::ZERO), 0);
    }
}
