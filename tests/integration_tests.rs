use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use otp_core::*;
use otp_twilio::{compute_signature, TwilioClient};
use otp_web_axum::AppState;
use otp_web_generic::{OtpProcessor, WebhookProcessor};
use otpgate::config::AppConfig;
use otpgate::rate_limiter::RateLimiter;
use otpgate::server::build_router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

/// Provider double that answers with a fixed status or a fixed failure.
struct MockProvider {
    status: &'static str,
    failure: Option<&'static str>,
    calls: AtomicUsize,
}

impl MockProvider {
    fn answering(status: &'static str) -> Arc<Self> {
        Arc::new(Self {
            status,
            failure: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(message: &'static str) -> Arc<Self> {
        Arc::new(Self {
            status: "",
            failure: Some(message),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self) -> Result<VerificationResponse, VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failure {
            Some(message) => Err(VerifyError::Http(message.to_string())),
            None => Ok(VerificationResponse {
                status: self.status.to_string(),
                provider: "mock",
                raw: json!({ "status": self.status }),
            }),
        }
    }
}

#[async_trait]
impl VerifyClient for MockProvider {
    fn provider(&self) -> &'static str {
        "mock"
    }

    async fn send_code(
        &self,
        _req: VerificationRequest<'_>,
    ) -> Result<VerificationResponse, VerifyError> {
        self.answer()
    }

    async fn check_code(
        &self,
        _check: VerificationCheck<'_>,
    ) -> Result<VerificationResponse, VerifyError> {
        self.answer()
    }
}

/// Provider whose client code blows up instead of returning an error.
struct PanickingProvider;

#[async_trait]
impl VerifyClient for PanickingProvider {
    fn provider(&self) -> &'static str {
        "panicking"
    }

    async fn send_code(
        &self,
        _req: VerificationRequest<'_>,
    ) -> Result<VerificationResponse, VerifyError> {
        panic!("verification client state corrupted")
    }

    async fn check_code(
        &self,
        _check: VerificationCheck<'_>,
    ) -> Result<VerificationResponse, VerifyError> {
        panic!("verification client state corrupted")
    }
}

fn app_with(config: &AppConfig, provider: Arc<dyn VerifyClient>) -> Router {
    let twilio = Arc::new(TwilioClient::new("AC123", "secret", "VA123"));
    let state = AppState {
        otp: OtpProcessor::new(provider),
        webhooks: WebhookProcessor::new(InboundRegistry::new().with(twilio))
            .with_reply(config.webhook.reply.clone()),
        webhook_provider: "twilio",
    };
    build_router(config, state, RateLimiter::new(config.rate_limit.clone()))
}

fn app(provider: Arc<MockProvider>) -> Router {
    app_with(&AppConfig::default(), provider)
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn from_peer(mut request: Request<Body>, peer: &str) -> Request<Body> {
    let addr: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_service_and_time() {
    let response = app(MockProvider::answering("pending"))
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["service"], "OTP");
    let stamp = body["time"].as_str().unwrap();
    assert!(
        time::OffsetDateTime::parse(stamp, &time::format_description::well_known::Rfc3339).is_ok()
    );
}

#[tokio::test]
async fn send_without_phone_never_reaches_provider() {
    let provider = MockProvider::answering("pending");
    let response = app(provider.clone())
        .oneshot(post_json("/otp/send", json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await, json!({ "error": "phone required" }));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn verify_without_code_never_reaches_provider() {
    let provider = MockProvider::answering("approved");
    let app = app(provider.clone());

    for body in [json!({ "phone": "+15551234567" }), json!({ "code": "000000" })] {
        let response = app.clone().oneshot(post_json("/otp/verify", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({ "error": "phone and code required" })
        );
    }
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn send_relays_provider_status() {
    let response = app(MockProvider::answering("pending"))
        .oneshot(post_json("/otp/send", json!({ "phone": "+15551234567" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["ratelimit-limit"], "5");
    assert_eq!(response.headers()["ratelimit-remaining"], "4");
    assert_eq!(json_body(response).await, json!({ "status": "pending" }));
}

#[tokio::test]
async fn approved_code_is_valid() {
    let response = app(MockProvider::answering("approved"))
        .oneshot(post_json(
            "/otp/verify",
            json!({ "phone": "+15551234567", "code": "000000" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({ "status": "approved", "valid": true })
    );
}

#[tokio::test]
async fn repeated_check_gives_identical_answers() {
    let app = app(MockProvider::answering("pending"));
    let request = || post_json("/otp/verify", json!({ "phone": "+15551234567", "code": "123456" }));

    let first = json_body(app.clone().oneshot(request()).await.unwrap()).await;
    let second = json_body(app.clone().oneshot(request()).await.unwrap()).await;
    assert_eq!(first, json!({ "status": "pending", "valid": false }));
    assert_eq!(first, second);
}

#[tokio::test]
async fn provider_failure_is_500_with_its_message_and_no_retry() {
    let provider = MockProvider::failing("getaddrinfo ENOTFOUND verify.twilio.com");
    let response = app(provider.clone())
        .oneshot(post_json("/otp/send", json!({ "phone": "+15551234567" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json_body(response).await,
        json!({ "error": "getaddrinfo ENOTFOUND verify.twilio.com" })
    );
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn sixth_rapid_send_is_rate_limited() {
    let provider = MockProvider::answering("pending");
    let app = app(provider.clone());

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(from_peer(
                post_json("/otp/send", json!({ "phone": "+15551234567" })),
                "192.0.2.10:40000",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(from_peer(
            post_json("/otp/send", json!({ "phone": "+15551234567" })),
            "192.0.2.10:40001",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 60);
    assert_eq!(response.headers()["ratelimit-limit"], "5");
    assert_eq!(response.headers()["ratelimit-remaining"], "0");
    assert!(json_body(response).await["error"].is_string());
    assert_eq!(provider.calls(), 5);
}

#[tokio::test]
async fn send_and_verify_share_one_window() {
    let app = app(MockProvider::answering("approved"));
    let peer = "192.0.2.20:40000";

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(from_peer(post_json("/otp/send", json!({ "phone": "+1555" })), peer))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(from_peer(
                post_json("/otp/verify", json!({ "phone": "+1555", "code": "1" })),
                peer,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app
        .clone()
        .oneshot(from_peer(
            post_json("/otp/verify", json!({ "phone": "+1555", "code": "1" })),
            peer,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn invalid_requests_still_consume_quota() {
    let provider = MockProvider::answering("pending");
    let app = app(provider.clone());

    for _ in 0..5 {
        let response = app.clone().oneshot(post_json("/otp/send", json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    let response = app
        .clone()
        .oneshot(post_json("/otp/send", json!({ "phone": "+15551234567" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn clients_are_limited_separately() {
    let app = app(MockProvider::answering("pending"));

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(from_peer(post_json("/otp/send", json!({ "phone": "+1555" })), "192.0.2.1:1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app
        .clone()
        .oneshot(from_peer(post_json("/otp/send", json!({ "phone": "+1555" })), "192.0.2.2:1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn forwarded_for_is_used_only_behind_trusted_proxy() {
    let mut config = AppConfig::default();
    config.rate_limit.trust_proxy = true;
    config.rate_limit.max_requests = 1;
    let app = app_with(&config, MockProvider::answering("pending"));

    let request = |client: &str| {
        let mut req = post_json("/otp/send", json!({ "phone": "+1555" }));
        req.headers_mut()
            .insert("x-forwarded-for", client.parse().unwrap());
        from_peer(req, "10.0.0.1:8080")
    };

    let ok = app.clone().oneshot(request("203.0.113.1")).await.unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let other = app.clone().oneshot(request("203.0.113.2")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
    let again = app.clone().oneshot(request("203.0.113.1")).await.unwrap();
    assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn routes_outside_the_prefix_are_not_limited() {
    let app = app(MockProvider::answering("pending"));

    for _ in 0..10 {
        let response = app
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn unknown_routes_are_404() {
    let app = app(MockProvider::answering("pending"));

    let response = app
        .clone()
        .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await, json!({ "error": "not found" }));

    let response = app
        .oneshot(Request::get("/otp/send").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disabled_limiter_admits_everything() {
    let mut config = AppConfig::default();
    config.rate_limit.enabled = false;
    let app = app_with(&config, MockProvider::answering("pending"));

    for _ in 0..10 {
        let response = app
            .clone()
            .oneshot(post_json("/otp/send", json!({ "phone": "+1555" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn concurrent_burst_admits_exactly_the_limit() {
    use futures::future;

    let provider = MockProvider::answering("pending");
    let app = app(provider.clone());

    let requests = (0..20).map(|_| {
        let app = app.clone();
        async move {
            app.oneshot(post_json("/otp/send", json!({ "phone": "+15551234567" })))
                .await
                .unwrap()
                .status()
        }
    });
    let statuses = future::join_all(requests).await;

    let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let limited = statuses
        .iter()
        .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!(ok, 5);
    assert_eq!(limited, 15);
    assert_eq!(provider.calls(), 5);
}

#[tokio::test]
async fn sms_webhook_acknowledges_with_twiml() {
    let response = app(MockProvider::answering("pending"))
        .oneshot(
            Request::post("/sms-webhook")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(
                    "MessageSid=SM1&From=%2B15550001111&To=%2B15550002222&Body=STOP",
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/xml");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(body.to_vec()).unwrap();
    assert!(body.starts_with("<?xml"));
    assert!(body.contains("<Message>Thanks, your message was received.</Message>"));
}

#[tokio::test]
async fn sms_webhook_rejects_garbage() {
    let response = app(MockProvider::answering("pending"))
        .oneshot(
            Request::post("/sms-webhook")
                .body(Body::from("Body=missing+sender"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn disabled_webhook_route_is_404() {
    let mut config = AppConfig::default();
    config.webhook.enabled = false;
    let response = app_with(&config, MockProvider::answering("pending"))
        .oneshot(Request::post("/sms-webhook").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_preflight_is_answered() {
    let response = app(MockProvider::answering("pending"))
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/otp/send")
                .header(header::ORIGIN, "https://app.example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn panicking_provider_becomes_500() {
    let response = app_with(&AppConfig::default(), Arc::new(PanickingProvider))
        .oneshot(post_json("/otp/send", json!({ "phone": "+15551234567" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().contains_key("ratelimit-remaining"));
    assert_eq!(
        json_body(response).await,
        json!({ "error": "verification client state corrupted" })
    );
}

const PUBLIC_WEBHOOK_URL: &str = "https://gate.example.com/sms-webhook";

fn signed_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.twilio.account_sid = "AC123".into();
    config.twilio.auth_token = "secret".into();
    config.twilio.verify_service_sid = "VA123".into();
    config.twilio.verify_signatures = true;
    config.twilio.webhook_url = Some(PUBLIC_WEBHOOK_URL.into());
    config
}

fn inbound_sms(signature: Option<String>) -> Request<Body> {
    let form = "MessageSid=SM9&From=%2B15550001111&To=%2B15550002222&Body=hello";
    let mut builder = Request::post("/sms-webhook")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(signature) = signature {
        builder = builder.header("X-Twilio-Signature", signature);
    }
    builder.body(Body::from(form)).unwrap()
}

#[tokio::test]
async fn built_app_enforces_webhook_signatures() {
    let config = signed_config();
    let (app, _limiter) = otpgate::build_app(&config).unwrap();

    let response = app.clone().oneshot(inbound_sms(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(inbound_sms(Some("bm90IGEgc2lnbmF0dXJl".into())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let params = vec![
        ("MessageSid".to_string(), "SM9".to_string()),
        ("From".to_string(), "+15550001111".to_string()),
        ("To".to_string(), "+15550002222".to_string()),
        ("Body".to_string(), "hello".to_string()),
    ];
    let signature = compute_signature("secret", PUBLIC_WEBHOOK_URL, &params).unwrap();
    let response = app.oneshot(inbound_sms(Some(signature))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/xml");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8(body.to_vec())
        .unwrap()
        .contains("<Response><Message>"));
}

#[tokio::test]
async fn built_app_skips_signatures_unless_enabled() {
    let mut config = signed_config();
    config.twilio.verify_signatures = false;
    let (app, _limiter) = otpgate::build_app(&config).unwrap();

    let response = app.oneshot(inbound_sms(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[test]
fn twilio_client_follows_config() {
    let mut config = signed_config();
    config.twilio.base_url = "http://127.0.0.1:9".into();
    let client = otpgate::twilio_client(&config).unwrap();
    assert_eq!(client.webhook_url.as_deref(), Some(PUBLIC_WEBHOOK_URL));
    assert_eq!(client.base_url, "http://127.0.0.1:9");
    assert_eq!(client.service_sid, "VA123");

    config.twilio.verify_signatures = false;
    assert!(otpgate::twilio_client(&config).unwrap().webhook_url.is_none());
}

#[tokio::test]
async fn built_app_surfaces_unreachable_provider_as_500() {
    let mut config = signed_config();
    // Nothing listens on the discard port.
    config.twilio.base_url = "http://127.0.0.1:9".into();
    config.server.timeout_seconds = 2;
    let (app, _limiter) = otpgate::build_app(&config).unwrap();

    let response = app
        .oneshot(post_json("/otp/send", json!({ "phone": "+15551234567", "channel": "call" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(response).await["error"].is_string());
}
