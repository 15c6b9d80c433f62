//! Configuration sections.

use gateway_core::{Channel, ChannelId, ProviderType, TokenId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Grace period for in-flight requests on shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Streaming pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Abort a stream after this long without a line from upstream
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Models whose name starts with one of these get twice the idle timeout
    #[serde(default = "default_slow_model_prefixes")]
    pub slow_model_prefixes: Vec<String>,

    /// Emit keep-alive comment frames
    #[serde(default)]
    pub ping_enabled: bool,

    /// Keep-alive interval
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Scanner buffer capacity before the first frame
    #[serde(default = "default_initial_buffer")]
    pub initial_buffer_size: usize,

    /// Scanner buffer capacity after the first frame
    #[serde(default = "default_steady_buffer")]
    pub steady_buffer_size: usize,

    /// Longest accepted line
    #[serde(default = "default_max_buffer")]
    pub max_buffer_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            slow_model_prefixes: default_slow_model_prefixes(),
            ping_enabled: false,
            ping_interval: default_ping_interval(),
            initial_buffer_size: default_initial_buffer(),
            steady_buffer_size: default_steady_buffer(),
            max_buffer_size: default_max_buffer(),
        }
    }
}

impl StreamingConfig {
    /// Idle timeout for `model`
    #[must_use]
    pub fn idle_timeout_for(&self, model: &str) -> Duration {
        if self
            .slow_model_prefixes
            .iter()
            .any(|prefix| model.starts_with(prefix.as_str()))
        {
            self.idle_timeout * 2
        } else {
            self.idle_timeout
        }
    }
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_slow_model_prefixes() -> Vec<String> {
    vec!["o1".to_string(), "o3".to_string(), "o4".to_string()]
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_initial_buffer() -> usize {
    4 * KIB
}

fn default_steady_buffer() -> usize {
    MIB
}

fn default_max_buffer() -> usize {
    10 * MIB
}

/// Quota reservation and batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Accumulator flush interval
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Tokens assumed when reserving for ratio-priced models
    #[serde(default = "default_pre_consumed_tokens")]
    pub pre_consumed_tokens: u32,

    /// Quota units per currency unit
    #[serde(default = "default_quota_per_unit")]
    pub quota_per_unit: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            pre_consumed_tokens: default_pre_consumed_tokens(),
            quota_per_unit: default_quota_per_unit(),
        }
    }
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_pre_consumed_tokens() -> u32 {
    500
}

fn default_quota_per_unit() -> f64 {
    500_000.0
}

/// Model pricing tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Per-token multiplier by model
    #[serde(default = "default_model_ratios")]
    pub model_ratios: HashMap<String, f64>,

    /// Completion-token multiplier by model
    #[serde(default = "default_completion_ratios")]
    pub completion_ratios: HashMap<String, f64>,

    /// Flat price per call by model; takes precedence over ratios
    #[serde(default)]
    pub model_prices: HashMap<String, f64>,

    /// Discount ratio by user group
    #[serde(default = "default_group_ratios")]
    pub group_ratios: HashMap<String, f64>,

    /// Ratio for models missing from `model_ratios`
    #[serde(default = "default_model_ratio")]
    pub default_model_ratio: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            model_ratios: default_model_ratios(),
            completion_ratios: default_completion_ratios(),
            model_prices: HashMap::new(),
            group_ratios: default_group_ratios(),
            default_model_ratio: default_model_ratio(),
        }
    }
}

fn default_model_ratios() -> HashMap<String, f64> {
    [
        ("gpt-4", 15.0),
        ("gpt-4o", 1.25),
        ("gpt-4o-mini", 0.075),
        ("gpt-3.5-turbo", 0.25),
        ("o1", 7.5),
        ("o3-mini", 0.55),
        ("deepseek-chat", 0.135),
        ("deepseek-reasoner", 0.275),
    ]
    .into_iter()
    .map(|(model, ratio)| (model.to_string(), ratio))
    .collect()
}

fn default_completion_ratios() -> HashMap<String, f64> {
    [
        ("gpt-4", 2.0),
        ("gpt-4o", 4.0),
        ("gpt-4o-mini", 4.0),
        ("gpt-3.5-turbo", 3.0),
        ("o1", 4.0),
        ("o3-mini", 4.0),
        ("deepseek-chat", 4.0),
        ("deepseek-reasoner", 4.0),
    ]
    .into_iter()
    .map(|(model, ratio)| (model.to_string(), ratio))
    .collect()
}

fn default_group_ratios() -> HashMap<String, f64> {
    [("default", 1.0), ("vip", 1.0), ("svip", 1.0)]
        .into_iter()
        .map(|(group, ratio)| (group.to_string(), ratio))
        .collect()
}

fn default_model_ratio() -> f64 {
    30.0
}

/// Channel registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Snapshot refresh interval
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
        }
    }
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

/// Fast-auth cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Serve repeat lookups from the in-memory cache
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// How long a verified credential stays cached
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Expired-entry sweep interval
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Key for hashing credentials; a random key is generated when unset
    #[serde(default, skip_serializing)]
    pub hmac_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl: default_cache_ttl(),
            sweep_interval: default_sweep_interval(),
            hmac_secret: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(600)
}

/// Upstream HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// TCP/TLS connect timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Idle pooled connections are closed after this long
    #[serde(default = "default_pool_idle_timeout", with = "humantime_serde")]
    pub pool_idle_timeout: Duration,

    /// Idle pooled connections kept per host
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    /// Deadline for the upstream's response headers
    #[serde(default = "default_response_header_timeout", with = "humantime_serde")]
    pub response_header_timeout: Duration,

    /// Overall deadline for a non-streamed relay; unset means none
    #[serde(default, with = "humantime_serde")]
    pub relay_timeout: Option<Duration>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            pool_idle_timeout: default_pool_idle_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            response_header_timeout: default_response_header_timeout(),
            relay_timeout: None,
        }
    }
}

fn default_response_header_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_pool_max_idle() -> usize {
    20
}

/// Ledger storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// Process memory, lost on restart
    #[default]
    Memory,
    /// SQLite database
    Sqlite,
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: LedgerBackend,

    /// Database URL for the sqlite backend
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Channels inserted at startup when missing
    #[serde(default)]
    pub channels: Vec<ChannelSeed>,

    /// Tokens inserted at startup when missing
    #[serde(default)]
    pub tokens: Vec<TokenSeed>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            database_url: default_database_url(),
            channels: Vec::new(),
            tokens: Vec::new(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://relay.db?mode=rwc".to_string()
}

/// Channel definition in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSeed {
    /// Channel id
    pub id: ChannelId,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Provider type tag
    pub provider_type: String,
    /// Upstream credential
    #[serde(skip_serializing)]
    pub key: String,
    /// Base URL override
    #[serde(default)]
    pub base_url: Option<String>,
    /// Selection weight
    #[serde(default)]
    pub weight: u32,
    /// Enabled flag
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Served models, empty means any
    #[serde(default)]
    pub models: Vec<String>,
    /// Model-name rewrites
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Status-code rewrites
    #[serde(default)]
    pub status_code_mapping: HashMap<String, String>,
    /// Outbound proxy (`http`, `https`, `socks5` or `socks5h` URL)
    #[serde(default)]
    pub proxy: Option<String>,
}

impl ChannelSeed {
    /// Build the runtime channel
    #[must_use]
    pub fn to_channel(&self) -> Channel {
        let mut channel = Channel::new(
            self.id,
            ProviderType::from(self.provider_type.as_str()),
            self.key.clone(),
        )
        .with_weight(self.weight)
        .with_enabled(self.enabled)
        .with_models(self.models.iter().cloned());
        if !self.name.is_empty() {
            channel.name = self.name.clone();
        }
        channel.base_url = self.base_url.clone();
        channel.model_mapping = self.model_mapping.clone();
        channel.status_code_mapping = self.status_code_mapping.clone();
        channel.proxy = self.proxy.clone().filter(|p| !p.is_empty());
        channel
    }
}

/// API token definition in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSeed {
    /// Bearer key (without the `Bearer ` prefix)
    #[serde(skip_serializing)]
    pub key: String,
    /// Token id
    pub token_id: TokenId,
    /// Owning user id
    pub user_id: UserId,
    /// Pricing group
    #[serde(default = "default_group")]
    pub group: String,
    /// Starting user balance
    #[serde(default)]
    pub user_quota: i64,
    /// Starting token balance
    #[serde(default)]
    pub token_quota: i64,
    /// Token ignores its own balance
    #[serde(default)]
    pub unlimited_quota: bool,
}

fn default_group() -> String {
    "default".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines
    #[serde(default)]
    pub json: bool,
    /// Attach an OpenTelemetry layer
    #[serde(default)]
    pub otel_enabled: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel_enabled: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_models_get_double_timeout() {
        let config = StreamingConfig::default();
        assert_eq!(config.idle_timeout_for("gpt-4o"), Duration::from_secs(60));
        assert_eq!(config.idle_timeout_for("o1-preview"), Duration::from_secs(120));
        assert_eq!(config.idle_timeout_for("o3-mini"), Duration::from_secs(120));
    }

    #[test]
    fn test_channel_seed_to_channel() {
        let seed: ChannelSeed = serde_yaml::from_str(
            r"
id: 3
provider_type: deepseek
key: sk-seed
weight: 5
models: [deepseek-chat]
status_code_mapping:
  '429': '503'
",
        )
        .unwrap();

        let channel = seed.to_channel();
        assert_eq!(channel.id, 3);
        assert_eq!(channel.provider_type, ProviderType::DeepSeek);
        assert_eq!(channel.weight, 5);
        assert_eq!(channel.name, "channel-3");
        assert_eq!(channel.map_status(429), 503);
        assert!(channel.enabled);
    }
}
