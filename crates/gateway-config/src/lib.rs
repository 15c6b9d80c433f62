//! # Gateway Config
//!
//! Configuration for the relay gateway.
//!
//! Configuration is read once at startup from an optional YAML file and then
//! overridden from `GATEWAY_*` environment variables. Every section has
//! working defaults, so an empty file (or none) yields a runnable gateway.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod loader;
mod sections;

pub use loader::{load_config, ConfigError};
pub use sections::{
    AuthConfig, ChannelSeed, LedgerBackend, LedgerConfig, LoggingSettings, PricingConfig,
    QuotaConfig, RoutingConfig, ServerConfig, StreamingConfig, TokenSeed, UpstreamConfig,
};

use serde::{Deserialize, Serialize};

/// Root gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Streaming pipeline
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Quota reservation, settlement and batching
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Model pricing tables
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Channel registry
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Fast-auth cache
    #[serde(default)]
    pub auth: AuthConfig,

    /// Upstream HTTP client
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Ledger backend and seed data
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl GatewayConfig {
    /// Check cross-field constraints
    ///
    /// # Errors
    /// Returns an error naming the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("streaming.idle_timeout", self.streaming.idle_timeout),
            ("streaming.ping_interval", self.streaming.ping_interval),
            ("quota.flush_interval", self.quota.flush_interval),
            ("routing.refresh_interval", self.routing.refresh_interval),
            ("auth.cache_ttl", self.auth.cache_ttl),
            ("auth.sweep_interval", self.auth.sweep_interval),
            (
                "upstream.response_header_timeout",
                self.upstream.response_header_timeout,
            ),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        let s = &self.streaming;
        if s.initial_buffer_size == 0 || s.initial_buffer_size > s.max_buffer_size {
            return Err(ConfigError::Invalid {
                field: "streaming.initial_buffer_size".to_string(),
                message: format!(
                    "must be between 1 and max_buffer_size ({})",
                    s.max_buffer_size
                ),
            });
        }
        if s.steady_buffer_size < s.initial_buffer_size || s.steady_buffer_size > s.max_buffer_size
        {
            return Err(ConfigError::Invalid {
                field: "streaming.steady_buffer_size".to_string(),
                message: "must lie between initial_buffer_size and max_buffer_size".to_string(),
            });
        }
        if self.quota.quota_per_unit <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "quota.quota_per_unit".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.ledger.backend == LedgerBackend::Sqlite && self.ledger.database_url.is_empty() {
            return Err(ConfigError::Invalid {
                field: "ledger.database_url".to_string(),
                message: "required for the sqlite backend".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.streaming.ping_interval, Duration::from_secs(10));
        assert_eq!(config.streaming.initial_buffer_size, 4 * 1024);
        assert_eq!(config.routing.refresh_interval, Duration::from_secs(300));
        assert_eq!(config.auth.cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = GatewayConfig::default();
        config.quota.flush_interval = Duration::ZERO;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("quota.flush_interval"));
    }

    #[test]
    fn test_validate_rejects_inverted_buffers() {
        let mut config = GatewayConfig::default();
        config.streaming.initial_buffer_size = config.streaming.max_buffer_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_with_humantime_durations() {
        let yaml = r"
server:
  port: 8080
streaming:
  idle_timeout: 90s
  ping_enabled: true
  ping_interval: 15s
quota:
  flush_interval: 2s
routing:
  refresh_interval: 1m
pricing:
  model_ratios:
    my-model: 3.0
upstream:
  relay_timeout: 5m
";
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.streaming.idle_timeout, Duration::from_secs(90));
        assert!(config.streaming.ping_enabled);
        assert_eq!(config.quota.flush_interval, Duration::from_secs(2));
        assert_eq!(config.routing.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.pricing.model_ratios.get("my-model"), Some(&3.0));
        assert_eq!(config.upstream.relay_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.upstream.response_header_timeout, Duration::from_secs(30));
        // untouched sections keep defaults
        assert_eq!(config.auth.sweep_interval, Duration::from_secs(600));
    }
}
