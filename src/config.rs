use crate::rate_limiter::RateLimitConfig;
use config::{Config, ConfigError, Environment, File};
use otp_core::Channel;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Twilio Verify configuration
    pub twilio: TwilioConfig,
    /// Inbound SMS webhook configuration
    pub webhook: WebhookConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3000)
    pub port: u16,
    /// Provider call timeout in seconds (default: 10)
    pub timeout_seconds: u64,
    /// Allow cross-origin requests (default: true)
    pub cors: bool,
}

/// Twilio Verify configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TwilioConfig {
    /// Twilio Account SID
    pub account_sid: String,
    /// Twilio Auth Token
    pub auth_token: String,
    /// Verify service SID
    pub verify_service_sid: String,
    /// Verify API base URL
    pub base_url: String,
    /// Channel used when a send request names none (default: sms)
    pub default_channel: Channel,
    /// Webhook signature validation (default: false)
    pub verify_signatures: bool,
    /// Public URL Twilio posts inbound SMS to; required for signature validation
    pub webhook_url: Option<String>,
}

/// Inbound SMS webhook configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebhookConfig {
    /// Expose the webhook route (default: true)
    pub enabled: bool,
    /// Route path (default: /sms-webhook)
    pub path: String,
    /// Reply text in the acknowledgment; none sends an empty acknowledgment
    pub reply: Option<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: json or pretty (default: pretty)
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            timeout_seconds: 10,
            cors: true,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            verify_service_sid: String::new(),
            base_url: otp_twilio::DEFAULT_BASE_URL.to_string(),
            default_channel: Channel::Sms,
            verify_signatures: false,
            webhook_url: None,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/sms-webhook".to_string(),
            reply: Some("Thanks, your message was received.".to_string()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with default configuration
            .add_source(Config::try_from(&AppConfig::default())?)
            // Add configuration file based on environment
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (gitignored)
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables (prefixed with OTPGATE_)
            .add_source(Environment::with_prefix("OTPGATE").separator("__"))
            // Plain variables win over everything else
            .set_override_option("twilio.account_sid", env::var("TWILIO_ACCOUNT_SID").ok())?
            .set_override_option("twilio.auth_token", env::var("TWILIO_AUTH_TOKEN").ok())?
            .set_override_option(
                "twilio.verify_service_sid",
                env::var("TWILIO_VERIFY_SERVICE_SID").ok(),
            )?
            .set_override_option("server.port", env::var("PORT").ok())?
            .build()?;

        s.try_deserialize()
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing: Vec<&str> = [
            ("TWILIO_ACCOUNT_SID", &self.twilio.account_sid),
            ("TWILIO_AUTH_TOKEN", &self.twilio.auth_token),
            ("TWILIO_VERIFY_SERVICE_SID", &self.twilio.verify_service_sid),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

        if !missing.is_empty() {
            return Err(ConfigError::Message(format!(
                "missing provider credentials: {}",
                missing.join(", ")
            )));
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(ConfigError::Message(
                "rate_limit.window_seconds must be positive".into(),
            ));
        }
        if self.twilio.verify_signatures && self.twilio.webhook_url.is_none() {
            return Err(ConfigError::Message(
                "twilio.verify_signatures requires twilio.webhook_url".into(),
            ));
        }
        if !self.webhook.path.starts_with('/') {
            return Err(ConfigError::Message("webhook.path must start with '/'".into()));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            twilio: TwilioConfig::default(),
            webhook: WebhookConfig::default(),
            logging: LoggingConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}
