//! Router assembly: routes, the rate limit gate and CORS.

use crate::config::AppConfig;
use crate::rate_limiter::{DefaultKeyGenerator, KeyGenerator, RateLimitResult, RateLimiter};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use otp_core::{GatewayResponse, HttpStatus};
use otp_web_axum::{
    health, not_found, rate_limited, send_otp, sms_webhook, verify_otp, AppState,
    AxumHeaderConverter, AxumResponseConverter,
};
use otp_web_generic::{HeaderConverter, ResponseConverter};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

/// Rate limiter plus the policy for which requests it sees.
#[derive(Clone)]
pub struct RateLimitGate {
    pub limiter: RateLimiter,
    pub keys: Arc<dyn KeyGenerator>,
}

impl RateLimitGate {
    pub fn new(limiter: RateLimiter) -> Self {
        let keys = Arc::new(DefaultKeyGenerator::new(limiter.config().trust_proxy));
        Self { limiter, keys }
    }

    fn client_key(&self, request: &Request) -> String {
        let headers = AxumHeaderConverter::to_generic_headers(request.headers());
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        self.keys.generate_key(&headers, peer)
    }
}

/// Admit or reject requests under the gated prefix before they reach a handler.
async fn rate_limit_gate(State(gate): State<RateLimitGate>, request: Request, next: Next) -> Response {
    if !gate.limiter.config().covers(request.uri().path()) {
        return next.run(request).await;
    }

    let key = gate.client_key(&request);
    let span = tracing::info_span!(
        "gated_request",
        request_id = %uuid::Uuid::new_v4(),
        method = %request.method(),
        path = %request.uri().path(),
        client = %key,
    );

    async move {
        let limit = gate.limiter.config().max_requests;
        match gate.limiter.check_rate_limit(&key).await {
            RateLimitResult::Allowed { remaining } => {
                let mut response = next.run(request).await;
                set_quota_headers(&mut response, limit, remaining);
                tracing::debug!(status = response.status().as_u16(), "request handled");
                response
            }
            RateLimitResult::Limited { retry_after } => {
                let mut response = rate_limited(retry_after);
                set_quota_headers(&mut response, limit, 0);
                response
            }
        }
    }
    .instrument(span)
    .await
}

fn set_quota_headers(response: &mut Response, limit: u32, remaining: u32) {
    let headers = response.headers_mut();
    headers.insert("ratelimit-limit", HeaderValue::from(limit));
    headers.insert("ratelimit-remaining", HeaderValue::from(remaining));
}

/// A panicking handler still produces a JSON 500 carrying the panic message.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "internal server error".to_string());
    tracing::error!("handler panicked: {}", message);
    AxumResponseConverter::from_gateway_response(GatewayResponse::error(
        HttpStatus::InternalServerError,
        &message,
    ))
}

/// Build the full application router.
pub fn build_router(config: &AppConfig, state: AppState, limiter: RateLimiter) -> Router {
    // Wrong methods on known paths answer 404 as well.
    let mut router = Router::new()
        .route("/", get(health).fallback(not_found))
        .route("/otp/send", post(send_otp).fallback(not_found))
        .route("/otp/verify", post(verify_otp).fallback(not_found));

    if config.webhook.enabled {
        router = router.route(&config.webhook.path, post(sms_webhook).fallback(not_found));
    }

    let gate = RateLimitGate::new(limiter);
    let router = router
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(gate, rate_limit_gate));

    if config.server.cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}
