//! Rate limit policy.
//!
//! A [`LimitRule`] is the serializable form read from configuration files;
//! a [`RateLimiterConfig`] is the validated policy a limiter is built from.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::identity::ClientIdentity;
use crate::error::{Result, TurnstileError};

/// Default cadence of the background sweep that drops expired entries.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Longest window a limiter accepts: 365 days.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Derives the counter key from a client identity.
pub type KeyGenerator = Arc<dyn Fn(&ClientIdentity) -> String + Send + Sync>;

/// A limit as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Window width in milliseconds
    pub window_ms: u64,
    /// Admissions allowed per key per window
    pub max_requests: u32,
    /// Message returned to throttled clients
    #[serde(default = "default_message")]
    pub message: String,
}

impl LimitRule {
    /// Create a rule with the default rejection message.
    pub fn new(window_ms: u64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
            message: default_message(),
        }
    }

    /// Replace the rejection message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Authentication endpoints: 10 attempts per 15 minutes.
    pub fn auth() -> Self {
        Self::new(15 * 60 * 1000, 10)
            .with_message("Too many authentication attempts. Please try again later.")
    }

    /// General API traffic: 100 requests per 15 minutes.
    pub fn api() -> Self {
        Self::new(15 * 60 * 1000, 100)
            .with_message("Too many API requests. Please try again later.")
    }

    /// User data reads: 30 requests per 5 minutes.
    pub fn user_data() -> Self {
        Self::new(5 * 60 * 1000, 30).with_message("Too many requests. Please try again later.")
    }

    /// Validate this rule into a limiter policy.
    pub fn to_config(&self) -> Result<RateLimiterConfig> {
        RateLimiterConfig::new(Duration::from_millis(self.window_ms), self.max_requests)
    }
}

fn default_message() -> String {
    "Too many requests".to_string()
}

/// Validated policy for one limiter instance.
#[derive(Clone)]
pub struct RateLimiterConfig {
    window: Duration,
    window_ms: i64,
    max_requests: u32,
    key_generator: Option<KeyGenerator>,
    cleanup_interval: Duration,
}

impl RateLimiterConfig {
    /// Create a policy admitting `max_requests` per key in each `window`.
    ///
    /// Both values must be non-zero and the window at most [`MAX_WINDOW`].
    pub fn new(window: Duration, max_requests: u32) -> Result<Self> {
        if window.as_millis() == 0 {
            return Err(TurnstileError::InvalidLimit(
                "window must be at least 1ms".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(TurnstileError::InvalidLimit(format!(
                "window must not exceed {}ms",
                MAX_WINDOW.as_millis()
            )));
        }
        let window_ms = i64::try_from(window.as_millis())
            .map_err(|_| TurnstileError::InvalidLimit("window is too large".to_string()))?;
        if max_requests == 0 {
            return Err(TurnstileError::InvalidLimit(
                "max_requests must be positive".to_string(),
            ));
        }

        Ok(Self {
            window,
            window_ms,
            max_requests,
            key_generator: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        })
    }

    /// Use a custom key function instead of `address:agent`.
    pub fn with_key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&ClientIdentity) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    /// Change how often expired entries are swept.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// Derive the counter key for an identity.
    pub fn key_for(&self, identity: &ClientIdentity) -> String {
        match &self.key_generator {
            Some(generator) => generator(identity),
            None => identity.default_key(),
        }
    }
}

impl fmt::Debug for RateLimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterConfig")
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("custom_key", &self.key_generator.is_some())
            .field("cleanup_interval", &self.cleanup_interval)
            .finish()
    }
}
