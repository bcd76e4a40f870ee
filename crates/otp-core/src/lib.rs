//! # OTP Core
//!
//! Core traits and types for the otpgate phone verification gateway.
//!
//! This crate provides the provider-agnostic building blocks:
//! - [`VerifyClient`] trait for starting and checking verifications
//! - [`InboundWebhook`] trait for processing provider callbacks
//! - Common types for requests, results, errors and generic HTTP replies
//!
//! ## Example
//!
//! ```rust,ignore
//! use otp_core::{Channel, VerificationRequest, VerifyClient};
//!
//! // Any verification provider implements VerifyClient
//! let response = client.send_code(VerificationRequest {
//!     to: "+15551234567",
//!     channel: Channel::Sms,
//! }).await?;
//! println!("status: {}", response.status);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Provider status that marks a successful code check.
pub const APPROVED: &str = "approved";

/// Errors raised by a verification provider
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// HTTP communication error
    #[error("http error: {0}")]
    Http(String),
    /// Authentication/authorization error
    #[error("authentication error: {0}")]
    Auth(String),
    /// Invalid request parameters
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Provider returned an error
    #[error("provider error: {0}")]
    Provider(String),
    /// Provider did not answer in time
    #[error("timeout: {0}")]
    Timeout(String),
    /// Unexpected error occurred
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl VerifyError {
    /// The underlying message, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            VerifyError::Http(m)
            | VerifyError::Auth(m)
            | VerifyError::Invalid(m)
            | VerifyError::Provider(m)
            | VerifyError::Timeout(m)
            | VerifyError::Unexpected(m) => m,
        }
    }
}

/// Request-level failures of the OTP endpoints
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    MissingFields(String),
    #[error("{0}")]
    InvalidBody(String),
    #[error("rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Provider(#[from] VerifyError),
}

impl GatewayError {
    pub fn status(&self) -> HttpStatus {
        match self {
            GatewayError::MissingFields(_) | GatewayError::InvalidBody(_) => {
                HttpStatus::BadRequest
            }
            GatewayError::RateLimited { .. } => HttpStatus::TooManyRequests,
            GatewayError::NotFound => HttpStatus::NotFound,
            GatewayError::Provider(_) => HttpStatus::InternalServerError,
        }
    }
}

/// Web-specific error types for webhook processing
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("provider not found: {0}")]
    ProviderNotFound(String),
    #[error("signature verification failed: {0}")]
    VerificationFailed(String),
    #[error("parsing failed: {0}")]
    ParseError(String),
    #[error("provider error: {0}")]
    Verify(#[from] VerifyError),
}

/// HTTP status code for web responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    Ok = 200,
    BadRequest = 400,
    Unauthorized = 401,
    NotFound = 404,
    TooManyRequests = 429,
    InternalServerError = 500,
}

impl HttpStatus {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Delivery channel for a verification code.
///
/// Parsed case-insensitively; `call` is accepted for voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Channel {
    #[default]
    Sms,
    Voice,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Voice => "voice",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sms" => Ok(Channel::Sms),
            "voice" | "call" => Ok(Channel::Voice),
            other => Err(VerifyError::Invalid(format!("unknown channel: {}", other))),
        }
    }
}

impl TryFrom<String> for Channel {
    type Error = VerifyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Start a verification for `to`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VerificationRequest<'a> {
    pub to: &'a str,
    pub channel: Channel,
}

/// Check `code` against the pending verification for `to`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VerificationCheck<'a> {
    pub to: &'a str,
    pub code: &'a str,
}

/// What the provider answered.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResponse {
    /// Status in the provider's own vocabulary, e.g. "pending" or "approved".
    pub status: String,
    /// Name of the backend/provider that produced the response, e.g. "twilio".
    pub provider: &'static str,
    /// Raw provider payload for debugging / audit.
    pub raw: serde_json::Value,
}

/// Normalized body returned to API callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
}

impl VerificationResult {
    /// Result of starting a verification: the status only.
    pub fn sent(response: VerificationResponse) -> Self {
        Self {
            status: response.status,
            valid: None,
        }
    }

    /// Result of a code check. `valid` only holds for the approved status.
    pub fn checked(response: VerificationResponse) -> Self {
        let valid = response.status == APPROVED;
        Self {
            status: response.status,
            valid: Some(valid),
        }
    }
}

#[async_trait]
pub trait VerifyClient: Send + Sync {
    /// Stable provider key, e.g. "twilio".
    fn provider(&self) -> &'static str;

    /// Ask the provider to create a verification challenge for `req.to`.
    async fn send_code(
        &self,
        req: VerificationRequest<'_>,
    ) -> Result<VerificationResponse, VerifyError>;

    /// Ask the provider to validate a code.
    async fn check_code(
        &self,
        check: VerificationCheck<'_>,
    ) -> Result<VerificationResponse, VerifyError>;
}

/// Lightweight header representation to avoid tying the core to any HTTP framework.
pub type Headers = Vec<(String, String)>;

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Keep the last four digits of a phone number for logging.
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}

/// Generic response that can be converted to any framework's response type
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: HttpStatus,
    pub body: String,
    pub content_type: String,
    pub headers: Headers,
}

impl GatewayResponse {
    pub fn json<T: Serialize>(status: HttpStatus, value: &T) -> Self {
        Self {
            status,
            body: serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
            content_type: "application/json".to_string(),
            headers: Vec::new(),
        }
    }

    pub fn error(status: HttpStatus, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    pub fn xml(status: HttpStatus, body: String) -> Self {
        Self {
            status,
            body,
            content_type: "text/xml".to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

impl From<GatewayError> for GatewayResponse {
    fn from(err: GatewayError) -> Self {
        let status = err.status();
        match err {
            // Provider text goes out verbatim.
            GatewayError::Provider(e) => GatewayResponse::error(status, e.message()),
            GatewayError::RateLimited { retry_after } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                GatewayResponse::error(status, "Too many requests, please try again later.")
                    .with_header("retry-after", secs.to_string())
            }
            other => GatewayResponse::error(status, &other.to_string()),
        }
    }
}

/// Normalized inbound message (e.g., an SMS sent to the service number).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: Option<OffsetDateTime>,
    pub provider: &'static str,
    pub raw: serde_json::Value,
}

/// Provider-agnostic inbound webhook interface.
pub trait InboundWebhook: Send + Sync {
    /// Stable provider key, e.g., "twilio".
    fn provider(&self) -> &'static str;

    /// Parse the incoming HTTP payload (headers + raw body) into a normalized `InboundMessage`.
    fn parse_inbound(&self, headers: &Headers, body: &[u8]) -> Result<InboundMessage, VerifyError>;

    /// Optional signature verification (no-op by default).
    fn verify(&self, _headers: &Headers, _body: &[u8]) -> Result<(), VerifyError> {
        Ok(())
    }

    /// Body the provider expects back once the callback has been accepted.
    fn acknowledge(&self, message: &InboundMessage, reply: Option<&str>) -> GatewayResponse;
}

/// Runtime registry so apps can register any combination of webhook providers.
#[derive(Default, Clone)]
pub struct InboundRegistry {
    map: Arc<HashMap<&'static str, Arc<dyn InboundWebhook>>>,
}

impl InboundRegistry {
    pub fn new() -> Self {
        Self {
            map: Arc::new(HashMap::new()),
        }
    }

    pub fn with(mut self, hook: Arc<dyn InboundWebhook>) -> Self {
        let mut m = (*self.map).clone();
        m.insert(hook.provider(), hook);
        self.map = Arc::new(m);
        self
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn InboundWebhook>> {
        self.map.get(provider).cloned()
    }
}
