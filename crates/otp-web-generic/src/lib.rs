use otp_core::{
    mask_phone, Channel, GatewayError, GatewayResponse, Headers, HttpStatus, InboundMessage,
    InboundRegistry, VerificationCheck, VerificationRequest, VerificationResult, VerifyClient,
    VerifyError, WebhookError,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Body of `POST /otp/send`.
#[derive(Debug, Default, Deserialize)]
pub struct SendCodeBody {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
}

/// Body of `POST /otp/verify`.
#[derive(Debug, Default, Deserialize)]
pub struct CheckCodeBody {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|v| !v.is_empty())
}

/// Empty bodies read as `{}` so they fail on the missing field instead.
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidBody(format!("invalid JSON body: {}", e)))
}

/// Framework-agnostic processor for the OTP endpoints
#[derive(Clone)]
pub struct OtpProcessor {
    client: Arc<dyn VerifyClient>,
    default_channel: Channel,
}

impl OtpProcessor {
    pub fn new(client: Arc<dyn VerifyClient>) -> Self {
        Self {
            client,
            default_channel: Channel::default(),
        }
    }

    pub fn with_default_channel(mut self, channel: Channel) -> Self {
        self.default_channel = channel;
        self
    }

    /// `POST /otp/send`: start a verification and report the provider status.
    pub async fn send_code(&self, body: &[u8]) -> GatewayResponse {
        match self.send_code_internal(body).await {
            Ok(result) => GatewayResponse::json(HttpStatus::Ok, &result),
            Err(e) => self.error_to_response(e),
        }
    }

    /// `POST /otp/verify`: check a code and report `{status, valid}`.
    pub async fn check_code(&self, body: &[u8]) -> GatewayResponse {
        match self.check_code_internal(body).await {
            Ok(result) => GatewayResponse::json(HttpStatus::Ok, &result),
            Err(e) => self.error_to_response(e),
        }
    }

    async fn send_code_internal(&self, body: &[u8]) -> Result<VerificationResult, GatewayError> {
        let body: SendCodeBody = parse_body(body)?;
        let phone = present(&body.phone)
            .ok_or_else(|| GatewayError::MissingFields("phone required".into()))?;

        let response = self
            .client
            .send_code(VerificationRequest {
                to: phone,
                channel: body.channel.unwrap_or(self.default_channel),
            })
            .await?;
        Ok(VerificationResult::sent(response))
    }

    async fn check_code_internal(&self, body: &[u8]) -> Result<VerificationResult, GatewayError> {
        let body: CheckCodeBody = parse_body(body)?;
        let (Some(phone), Some(code)) = (present(&body.phone), present(&body.code)) else {
            return Err(GatewayError::MissingFields("phone and code required".into()));
        };

        let response = self
            .client
            .check_code(VerificationCheck { to: phone, code })
            .await?;
        Ok(VerificationResult::checked(response))
    }

    fn error_to_response(&self, error: GatewayError) -> GatewayResponse {
        if let GatewayError::Provider(e) = &error {
            warn!(provider = self.client.provider(), "verification call failed: {}", e);
        }
        error.into()
    }
}

/// Framework-agnostic webhook processor for inbound provider callbacks
#[derive(Clone)]
pub struct WebhookProcessor {
    registry: InboundRegistry,
    reply: Option<String>,
}

impl WebhookProcessor {
    pub fn new(registry: InboundRegistry) -> Self {
        Self {
            registry,
            reply: None,
        }
    }

    /// Text sent back to the sender in the acknowledgment.
    pub fn with_reply(mut self, reply: Option<String>) -> Self {
        self.reply = reply;
        self
    }

    /// Process an incoming webhook request and return a framework-agnostic response
    pub fn process_webhook(
        &self,
        provider: &str,
        headers: Headers,
        body: &[u8],
    ) -> GatewayResponse {
        match self.process_webhook_internal(provider, headers, body) {
            Ok(response) => response,
            Err(e) => self.error_to_response(e),
        }
    }

    fn process_webhook_internal(
        &self,
        provider: &str,
        headers: Headers,
        body: &[u8],
    ) -> Result<GatewayResponse, WebhookError> {
        let hook = self
            .registry
            .get(provider)
            .ok_or_else(|| WebhookError::ProviderNotFound(provider.to_string()))?;

        // Only an authentication failure blames the caller.
        hook.verify(&headers, body).map_err(|e| match e {
            VerifyError::Auth(msg) => WebhookError::VerificationFailed(msg),
            other => WebhookError::Verify(other),
        })?;

        let message: InboundMessage = hook
            .parse_inbound(&headers, body)
            .map_err(|e| WebhookError::ParseError(e.to_string()))?;

        info!(
            provider = message.provider,
            id = ?message.id,
            from = %mask_phone(&message.from),
            to = %mask_phone(&message.to),
            chars = message.text.chars().count(),
            "inbound message received"
        );

        Ok(hook.acknowledge(&message, self.reply.as_deref()))
    }

    fn error_to_response(&self, error: WebhookError) -> GatewayResponse {
        warn!("webhook rejected: {}", error);
        match error {
            WebhookError::ProviderNotFound(_) => {
                GatewayResponse::error(HttpStatus::NotFound, "unknown provider")
            }
            WebhookError::VerificationFailed(msg) => GatewayResponse::error(
                HttpStatus::Unauthorized,
                &format!("verification failed: {}", msg),
            ),
            WebhookError::ParseError(msg) => {
                GatewayResponse::error(HttpStatus::BadRequest, &format!("parse error: {}", msg))
            }
            WebhookError::Verify(e) => {
                GatewayResponse::error(HttpStatus::InternalServerError, e.message())
            }
        }
    }
}

/// Helper trait for framework adapters to convert headers
pub trait HeaderConverter {
    type HeaderType;

    fn to_generic_headers(headers: &Self::HeaderType) -> Headers;
}

/// Helper trait for framework adapters to convert responses
pub trait ResponseConverter {
    type ResponseType;

    fn from_gateway_response(response: GatewayResponse) -> Self::ResponseType;
}
