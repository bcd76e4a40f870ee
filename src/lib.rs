//! # otpgate
//!
//! A small HTTP gateway in front of a phone verification provider.
//!
//! ## Endpoints
//!
//! - `GET /` health check
//! - `POST /otp/send` with `{phone, channel?}` starts a verification
//! - `POST /otp/verify` with `{phone, code}` checks a code and reports `{status, valid}`
//! - `POST /sms-webhook` acknowledges inbound SMS callbacks
//!
//! Every path under `/otp/` goes through a fixed-window rate limiter (5 requests per
//! 60 seconds per client by default). Code generation, delivery and expiry are left to
//! the provider.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use otpgate::prelude::*;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! let (router, limiter) = otpgate::build_app(&config)?;
//! ```

pub mod config;
pub mod rate_limiter;
pub mod server;
pub mod telemetry;

pub use config::*;

use axum::Router;
use otp_core::{InboundRegistry, VerifyClient, VerifyError};
use otp_twilio::TwilioClient;
use otp_web_axum::AppState;
use otp_web_generic::{OtpProcessor, WebhookProcessor};
use rate_limiter::RateLimiter;
use std::sync::Arc;

/// Common imports for otpgate usage
pub mod prelude {
    pub use crate::config::{
        AppConfig, LoggingConfig, ServerConfig, TwilioConfig, WebhookConfig,
    };
    pub use crate::rate_limiter::{
        DefaultKeyGenerator, KeyGenerator, RateLimitConfig, RateLimitResult, RateLimitStatus,
        RateLimiter,
    };
    pub use crate::server::{build_router, RateLimitGate};
    pub use otp_core::*;
}

/// Build the Twilio client described by `config`.
pub fn twilio_client(config: &AppConfig) -> Result<TwilioClient, VerifyError> {
    let twilio = &config.twilio;
    let mut client = TwilioClient::with_base_url(
        twilio.account_sid.clone(),
        twilio.auth_token.clone(),
        twilio.verify_service_sid.clone(),
        twilio.base_url.clone(),
    )
    .with_timeout(config.server.timeout())?;

    if twilio.verify_signatures {
        if let Some(url) = &twilio.webhook_url {
            client = client.with_webhook_url(url.clone());
        }
    }
    Ok(client)
}

/// Wire the OTP and webhook processors around a Twilio client.
pub fn app_state(config: &AppConfig, client: Arc<TwilioClient>) -> AppState {
    let verify: Arc<dyn VerifyClient> = client.clone();
    let otp = OtpProcessor::new(verify).with_default_channel(config.twilio.default_channel);
    let webhooks = WebhookProcessor::new(InboundRegistry::new().with(client.clone()))
        .with_reply(config.webhook.reply.clone());

    AppState {
        otp,
        webhooks,
        webhook_provider: VerifyClient::provider(client.as_ref()),
    }
}

/// Build the router and the limiter it shares with the sweeper task.
pub fn build_app(config: &AppConfig) -> Result<(Router, RateLimiter), VerifyError> {
    let client = Arc::new(twilio_client(config)?);
    let limiter = RateLimiter::new(config.rate_limit.clone());
    let router = server::build_router(config, app_state(config, client), limiter.clone());
    Ok((router, limiter))
}
