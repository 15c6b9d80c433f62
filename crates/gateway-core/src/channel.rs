//! Channel definitions.
//!
//! A channel is one configured upstream credential/endpoint. The gateway only
//! ever holds read-only copies; the ledger owns the source of truth.

use crate::types::{ChannelId, ProviderType};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configured upstream provider channel
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    /// Channel identifier
    pub id: ChannelId,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Provider family, used to pick the adaptor
    pub provider_type: ProviderType,
    /// Upstream credential
    pub key: SecretString,
    /// Upstream base URL override
    #[serde(default)]
    pub base_url: Option<String>,
    /// Selection weight, zero still gets picked
    #[serde(default)]
    pub weight: u32,
    /// Disabled channels are never loaded into the registry
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Models served by this channel, empty means any
    #[serde(default)]
    pub models: Vec<String>,
    /// Requested model -> upstream model rewrites
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Upstream status -> caller status rewrites, keyed by decimal code
    #[serde(default)]
    pub status_code_mapping: HashMap<String, String>,
    /// Outbound proxy URL for calls on this channel
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Channel {
    /// Create a channel with no model restriction
    pub fn new(id: ChannelId, provider_type: ProviderType, key: impl Into<String>) -> Self {
        Self {
            id,
            name: format!("channel-{id}"),
            provider_type,
            key: SecretString::new(key.into()),
            base_url: None,
            weight: 0,
            enabled: true,
            models: Vec::new(),
            model_mapping: HashMap::new(),
            status_code_mapping: HashMap::new(),
            proxy: None,
        }
    }

    /// Set the selection weight
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Restrict the channel to the given models
    #[must_use]
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Add a model-name rewrite
    #[must_use]
    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }

    /// Add a status-code rewrite
    #[must_use]
    pub fn with_status_code_mapping(mut self, from: u16, to: u16) -> Self {
        self.status_code_mapping
            .insert(from.to_string(), to.to_string());
        self
    }

    /// Route upstream calls through `proxy`
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Enable or disable the channel
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether this channel serves `model`
    #[must_use]
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    /// Upstream name for a requested model
    #[must_use]
    pub fn map_model(&self, requested: &str) -> String {
        self.model_mapping
            .get(requested)
            .filter(|mapped| !mapped.is_empty())
            .cloned()
            .unwrap_or_else(|| requested.to_string())
    }

    /// Caller-facing status for an upstream status.
    ///
    /// Success is never rewritten and unparseable targets are ignored.
    #[must_use]
    pub fn map_status(&self, status: u16) -> u16 {
        if status == 200 {
            return status;
        }
        self.status_code_mapping
            .get(&status.to_string())
            .and_then(|target| target.trim().parse::<u16>().ok())
            .filter(|target| (100..=599).contains(target))
            .unwrap_or(status)
    }
}

/// Running attempt counters for one channel.
///
/// `success <= total` holds because both only move through [`ChannelStat::record`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStat {
    /// Relay attempts
    pub total: u64,
    /// Successful relay attempts
    pub success: u64,
}

impl ChannelStat {
    /// Count one attempt
    pub fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.success += 1;
        }
    }

    /// Success ratio in `[0, 1]`, zero when nothing was recorded
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f64 / self.total as f64
        }
    }
}
