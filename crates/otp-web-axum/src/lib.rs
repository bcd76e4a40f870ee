use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use otp_core::{GatewayError, GatewayResponse, Headers};
use otp_web_generic::{HeaderConverter, OtpProcessor, ResponseConverter, WebhookProcessor};
use std::time::Duration;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Clone)]
pub struct AppState {
    pub otp: OtpProcessor,
    pub webhooks: WebhookProcessor,
    /// Provider whose callbacks arrive on the SMS webhook route.
    pub webhook_provider: &'static str,
}

/// Axum-specific header converter
pub struct AxumHeaderConverter;

impl HeaderConverter for AxumHeaderConverter {
    type HeaderType = HeaderMap;

    fn to_generic_headers(headers: &Self::HeaderType) -> Headers {
        headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

/// Axum-specific response converter
pub struct AxumResponseConverter;

impl ResponseConverter for AxumResponseConverter {
    type ResponseType = Response;

    fn from_gateway_response(response: GatewayResponse) -> Self::ResponseType {
        let status = StatusCode::from_u16(response.status.as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut out = (status, response.body).into_response();
        let headers = out.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&response.content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        for (name, value) in response.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }
        out
    }
}

/// Handler: GET /
pub async fn health() -> impl IntoResponse {
    let time = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Json(serde_json::json!({
        "ok": true,
        "service": "OTP",
        "time": time,
    }))
}

/// Handler: POST /otp/send
pub async fn send_otp(State(state): State<AppState>, body: Bytes) -> Response {
    AxumResponseConverter::from_gateway_response(state.otp.send_code(&body).await)
}

/// Handler: POST /otp/verify
pub async fn verify_otp(State(state): State<AppState>, body: Bytes) -> Response {
    AxumResponseConverter::from_gateway_response(state.otp.check_code(&body).await)
}

/// Handler: POST /sms-webhook
pub async fn sms_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let generic_headers = AxumHeaderConverter::to_generic_headers(&headers);
    let response = state
        .webhooks
        .process_webhook(state.webhook_provider, generic_headers, &body);
    AxumResponseConverter::from_gateway_response(response)
}

/// Fallback for unmatched method/path pairs.
pub async fn not_found() -> Response {
    AxumResponseConverter::from_gateway_response(GatewayError::NotFound.into())
}

/// 429 reply for requests the rate limiter turned away.
pub fn rate_limited(retry_after: Duration) -> Response {
    AxumResponseConverter::from_gateway_response(GatewayError::RateLimited { retry_after }.into())
}
