//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{LimitRule, RateLimiterConfig};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Rate limiting configuration: one rule per protected endpoint class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// How often each limiter sweeps expired entries, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Authentication endpoints
    #[serde(default = "LimitRule::auth")]
    pub auth: LimitRule,

    /// General API traffic
    #[serde(default = "LimitRule::api")]
    pub api: LimitRule,

    /// User data reads
    #[serde(default = "LimitRule::user_data")]
    pub user_data: LimitRule,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
            auth: LimitRule::auth(),
            api: LimitRule::api(),
            user_data: LimitRule::user_data(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

impl RateLimitingConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Build the limiter policy for a rule, applying the shared sweep cadence.
    pub fn limiter_config(&self, rule: &LimitRule) -> Result<RateLimiterConfig> {
        Ok(rule.to_config()?.with_cleanup_interval(self.cleanup_interval()))
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string and validate every rule.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every configured rule describes a usable limiter.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limiting;
        for (name, rule) in [
            ("auth", &limits.auth),
            ("api", &limits.api),
            ("user_data", &limits.user_data),
        ] {
            rule.to_config().map_err(|e| {
                TurnstileError::Config(format!("rate_limiting.{}: {}", name, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.http_addr.port(), 3000);
        assert_eq!(config.rate_limiting.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(config.rate_limiting.auth, LimitRule::auth());
        assert_eq!(config.rate_limiting.api, LimitRule::api());
        assert_eq!(config.rate_limiting.user_data, LimitRule::user_data());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = TurnstileConfig::from_yaml("{}").unwrap();
        assert_eq!(config, TurnstileConfig::default());
    }

    #[test]
    fn test_parse_partial_config() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:8080"
rate_limiting:
  cleanup_interval_secs: 60
  auth:
    window_ms: 60000
    max_requests: 5
    message: "Slow down"
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.rate_limiting.auth.max_requests, 5);
        assert_eq!(config.rate_limiting.auth.message, "Slow down");
        assert_eq!(config.rate_limiting.api, LimitRule::api());

        let limiter = config.rate_limiting.limiter_config(&config.rate_limiting.auth).unwrap();
        assert_eq!(limiter.window(), Duration::from_secs(60));
        assert_eq!(limiter.cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let yaml = r#"
rate_limiting:
  user_data:
    window_ms: 1000
    max_requests: 0
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("rate_limiting.user_data"));
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        let yaml = r#"
rate_limiting:
  api:
    window_ms: 18446744073709551615
    max_requests: 1
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
        assert!(err.to_string().contains("rate_limiting.api"));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = TurnstileConfig::from_yaml("server: [not, a, map]");
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }
}
