use otp_core::{header_value, Headers};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether to enable rate limiting
    pub enabled: bool,
    /// Maximum number of admitted requests per window
    pub max_requests: u32,
    /// Window duration in seconds
    pub window_seconds: u64,
    /// Every path under this prefix is gated
    pub gated_prefix: String,
    /// Derive the client key from proxy headers instead of the peer address
    pub trust_proxy: bool,
    /// Seconds between sweeps of expired windows (0 disables sweeping)
    pub sweep_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 5,
            window_seconds: 60,
            gated_prefix: "/otp/".to_string(),
            trust_proxy: false,
            sweep_interval_seconds: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// `/otp/` gates `/otp` as well as everything below it.
    pub fn covers(&self, path: &str) -> bool {
        let prefix = self.gated_prefix.as_str();
        path.starts_with(prefix) || path == prefix.trim_end_matches('/')
    }
}

/// Request count of one client inside its current window.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start: Instant,
    count: u32,
}

impl WindowCounter {
    fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    fn reset_after(&self, now: Instant, window: Duration) -> Duration {
        (self.window_start + window).saturating_duration_since(now)
    }
}

/// Fixed-window rate limiter keyed by client.
///
/// At most `max_requests` requests are admitted per key in each window. Windows are
/// fixed, not sliding: a full burst at the end of one window may be followed by
/// another full burst right after it resets.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<String, WindowCounter>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check if a request from `key` should be admitted now.
    pub async fn check_rate_limit(&self, key: &str) -> RateLimitResult {
        self.check_rate_limit_at(key, Instant::now()).await
    }

    /// Check if a request from `key` arriving at `now` should be admitted.
    pub async fn check_rate_limit_at(&self, key: &str, now: Instant) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed {
                remaining: self.config.max_requests,
            };
        }

        let window = self.config.window();
        let mut windows = self.windows.lock().await;
        let counter = windows
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter::fresh(now));

        if counter.expired(now, window) {
            *counter = WindowCounter::fresh(now);
        }

        if counter.count >= self.config.max_requests {
            let retry_after = counter.reset_after(now, window);
            warn!(
                "Rate limit exceeded for key: {}, retry after {:?}",
                key, retry_after
            );
            return RateLimitResult::Limited { retry_after };
        }

        counter.count += 1;
        let remaining = self.config.max_requests - counter.count;
        debug!(
            "Rate limit check passed for key: {}, remaining: {}",
            key, remaining
        );
        RateLimitResult::Allowed { remaining }
    }

    /// Current rate limit status for `key`, if it has been seen.
    pub async fn get_status(&self, key: &str, now: Instant) -> Option<RateLimitStatus> {
        let window = self.config.window();
        let windows = self.windows.lock().await;
        windows.get(key).map(|counter| {
            let (used, reset_after) = if counter.expired(now, window) {
                (0, Duration::ZERO)
            } else {
                (counter.count, counter.reset_after(now, window))
            };
            RateLimitStatus {
                remaining: self.config.max_requests.saturating_sub(used),
                limit: self.config.max_requests,
                reset_after,
            }
        })
    }

    /// Drop every counter whose window has elapsed. Returns how many were removed.
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let window = self.config.window();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|key, counter| {
            let keep = !counter.expired(now, window);
            if !keep {
                debug!("Cleaned up rate limit window for key: {}", key);
            }
            keep
        });
        before - windows.len()
    }

    /// Number of keys currently tracked.
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }

    /// Periodically sweep expired windows. Runs until the task is dropped.
    pub async fn run_sweeper(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        info!("Rate limit sweeper started (interval: {:?})", every);
        loop {
            ticker.tick().await;
            let removed = self.sweep_expired(Instant::now()).await;
            if removed > 0 {
                debug!("Swept {} expired rate limit windows", removed);
            }
        }
    }
}

/// Result of rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Rate limit status information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Remaining requests in the current window
    pub remaining: u32,
    /// Total request limit per window
    pub limit: u32,
    /// Time until the current window resets
    pub reset_after: Duration,
}

/// Derives the client key a request is counted against
pub trait KeyGenerator: Send + Sync {
    fn generate_key(&self, headers: &Headers, peer: Option<SocketAddr>) -> String;

    fn extract_client_ip(&self, headers: &Headers) -> Option<String> {
        // Look for common IP headers
        if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
            let first = forwarded.split(',').next()?.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
        ["x-real-ip", "cf-connecting-ip"]
            .iter()
            .find_map(|name| header_value(headers, name))
            .map(|v| v.trim().to_string())
    }
}

/// Keys by peer IP, or by proxy headers when the proxy is trusted.
#[derive(Debug, Clone, Default)]
pub struct DefaultKeyGenerator {
    pub trust_proxy: bool,
}

impl DefaultKeyGenerator {
    pub fn new(trust_proxy: bool) -> Self {
        Self { trust_proxy }
    }
}

impl KeyGenerator for DefaultKeyGenerator {
    fn generate_key(&self, headers: &Headers, peer: Option<SocketAddr>) -> String {
        if self.trust_proxy {
            if let Some(ip) = self.extract_client_ip(headers) {
                return ip;
            }
        }
        peer.map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
