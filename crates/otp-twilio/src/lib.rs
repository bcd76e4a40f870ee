//! # Twilio Verify Provider
//!
//! Twilio Verify v2 backend for otpgate.
//!
//! - Start verifications over SMS or voice
//! - Check submitted codes
//! - Parse inbound SMS webhooks, validate `X-Twilio-Signature`, answer with TwiML
//!
//! ## Example
//!
//! ```rust,ignore
//! use otp_core::{Channel, VerificationRequest, VerifyClient};
//! use otp_twilio::TwilioClient;
//!
//! let client = TwilioClient::new("ACxxxx", "auth_token", "VAxxxx");
//! let response = client.send_code(VerificationRequest {
//!     to: "+15551234567",
//!     channel: Channel::Sms,
//! }).await?;
//! assert_eq!(response.status, "pending");
//! ```

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use otp_core::{
    header_value, mask_phone, Channel, GatewayResponse, Headers, HttpStatus, InboundMessage,
    InboundWebhook, VerificationCheck, VerificationRequest, VerificationResponse, VerifyClient,
    VerifyError,
};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const PROVIDER: &str = "twilio";
const SIGNATURE_HEADER: &str = "x-twilio-signature";

pub const DEFAULT_BASE_URL: &str = "https://verify.twilio.com";

type HmacSha1 = Hmac<Sha1>;

/// Twilio Verify REST client.
#[derive(Clone, Debug)]
pub struct TwilioClient {
    /// Account SID, used as the Basic auth user.
    pub account_sid: String,
    /// Auth token, Basic auth password and webhook signing key.
    pub auth_token: String,
    /// Verify service SID (`VA...`).
    pub service_sid: String,
    /// API base URL; override for testing/mocking.
    pub base_url: String,
    /// Public URL Twilio posts inbound SMS to. Signatures are only checked when set.
    pub webhook_url: Option<String>,
    http: reqwest::Client,
}

impl TwilioClient {
    pub fn new<S: Into<String>>(account_sid: S, auth_token: S, service_sid: S) -> Self {
        Self::with_base_url(account_sid, auth_token, service_sid, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url<S: Into<String>>(
        account_sid: S,
        auth_token: S,
        service_sid: S,
        base_url: String,
    ) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            service_sid: service_sid.into(),
            base_url,
            webhook_url: None,
            http: reqwest::Client::new(),
        }
    }

    /// Bound every provider call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, VerifyError> {
        self.http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerifyError::Unexpected(format!("http client: {}", e)))?;
        Ok(self)
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    fn service_url(&self, resource: &str) -> String {
        format!(
            "{}/v2/Services/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.service_sid,
            resource
        )
    }

    async fn post_form<T: Serialize + ?Sized>(
        &self,
        url: String,
        form: &T,
    ) -> Result<TwilioVerification, VerifyError> {
        let res = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        let raw_text = res.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let message = serde_json::from_str::<TwilioErrorBody>(&raw_text)
                .map(|b| b.message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status, raw_text));
            warn!(status = status.as_u16(), "Twilio rejected request: {}", message);
            return Err(match status.as_u16() {
                401 | 403 => VerifyError::Auth(message),
                _ => VerifyError::Provider(message),
            });
        }

        let raw: serde_json::Value = serde_json::from_str(&raw_text)
            .map_err(|e| VerifyError::Provider(format!("unreadable response: {}", e)))?;
        let status = raw
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| VerifyError::Provider("response carries no status".into()))?
            .to_string();

        Ok(TwilioVerification { status, raw })
    }
}

fn transport_error(e: reqwest::Error) -> VerifyError {
    if e.is_timeout() {
        VerifyError::Timeout(e.to_string())
    } else {
        VerifyError::Http(e.to_string())
    }
}

/// Twilio names the voice channel `call`.
fn wire_channel(channel: Channel) -> &'static str {
    match channel {
        Channel::Sms => "sms",
        Channel::Voice => "call",
    }
}

#[derive(Debug, Serialize)]
struct TwilioVerificationForm<'a> {
    #[serde(rename = "To")]
    to: &'a str,
    #[serde(rename = "Channel")]
    channel: &'a str,
}

#[derive(Debug, Serialize)]
struct TwilioCheckForm<'a> {
    #[serde(rename = "To")]
    to: &'a str,
    #[serde(rename = "Code")]
    code: &'a str,
}

#[derive(Debug)]
struct TwilioVerification {
    status: String,
    raw: serde_json::Value,
}

impl From<TwilioVerification> for VerificationResponse {
    fn from(v: TwilioVerification) -> Self {
        VerificationResponse {
            status: v.status,
            provider: PROVIDER,
            raw: v.raw,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TwilioErrorBody {
    message: String,
}

#[async_trait]
impl VerifyClient for TwilioClient {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn send_code(
        &self,
        req: VerificationRequest<'_>,
    ) -> Result<VerificationResponse, VerifyError> {
        let form = TwilioVerificationForm {
            to: req.to,
            channel: wire_channel(req.channel),
        };
        let verification = self
            .post_form(self.service_url("Verifications"), &form)
            .await?;
        info!(
            to = %mask_phone(req.to),
            channel = %req.channel,
            status = %verification.status,
            "verification started"
        );
        Ok(verification.into())
    }

    async fn check_code(
        &self,
        check: VerificationCheck<'_>,
    ) -> Result<VerificationResponse, VerifyError> {
        let form = TwilioCheckForm {
            to: check.to,
            code: check.code,
        };
        let verification = self
            .post_form(self.service_url("VerificationCheck"), &form)
            .await?;
        info!(
            to = %mask_phone(check.to),
            status = %verification.status,
            "verification checked"
        );
        Ok(verification.into())
    }
}

/// Inbound SMS webhook payload (`application/x-www-form-urlencoded`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TwilioInbound {
    #[serde(rename = "MessageSid")]
    pub message_sid: Option<String>,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(flatten)]
    pub extra: HashMap<String, String>,
}

impl From<TwilioInbound> for InboundMessage {
    fn from(t: TwilioInbound) -> Self {
        let raw = serde_json::to_value(&t).unwrap_or_default();
        InboundMessage {
            id: t.message_sid,
            from: t.from,
            to: t.to,
            text: t.body,
            // Twilio does not stamp inbound SMS; record arrival time.
            timestamp: Some(time::OffsetDateTime::now_utc()),
            provider: PROVIDER,
            raw,
        }
    }
}

/// Compute the `X-Twilio-Signature` value for a form POST to `url`.
pub fn compute_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
) -> Result<String, VerifyError> {
    let mac = signing_mac(auth_token, url, params)?;
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn signing_mac(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
) -> Result<HmacSha1, VerifyError> {
    let mut sorted = params.to_vec();
    sorted.sort();

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes())
        .map_err(|e| VerifyError::Unexpected(format!("hmac key: {}", e)))?;
    mac.update(url.as_bytes());
    for (k, v) in &sorted {
        mac.update(k.as_bytes());
        mac.update(v.as_bytes());
    }
    Ok(mac)
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// TwiML acknowledgment, optionally replying with `message`.
pub fn twiml_response(message: Option<&str>) -> String {
    let mut body = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
    if let Some(text) = message {
        body.push_str("<Message>");
        body.push_str(&escape_xml(text));
        body.push_str("</Message>");
    }
    body.push_str("</Response>");
    body
}

impl InboundWebhook for TwilioClient {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn parse_inbound(&self, _headers: &Headers, body: &[u8]) -> Result<InboundMessage, VerifyError> {
        let inbound: TwilioInbound = serde_urlencoded::from_bytes(body)
            .map_err(|e| VerifyError::Invalid(format!("form decode: {}", e)))?;
        Ok(inbound.into())
    }

    fn verify(&self, headers: &Headers, body: &[u8]) -> Result<(), VerifyError> {
        let Some(url) = self.webhook_url.as_deref() else {
            return Ok(());
        };
        let provided = header_value(headers, SIGNATURE_HEADER)
            .ok_or_else(|| VerifyError::Auth("missing X-Twilio-Signature header".into()))?;
        let provided = STANDARD
            .decode(provided.trim())
            .map_err(|_| VerifyError::Auth("malformed signature".into()))?;

        let params: Vec<(String, String)> = url::form_urlencoded::parse(body).into_owned().collect();
        signing_mac(&self.auth_token, url, &params)?
            .verify_slice(&provided)
            .map_err(|_| VerifyError::Auth("signature mismatch".into()))?;
        debug!("webhook signature verified");
        Ok(())
    }

    fn acknowledge(&self, _message: &InboundMessage, reply: Option<&str>) -> GatewayResponse {
        GatewayResponse::xml(HttpStatus::Ok, twiml_response(reply))
    }
}
