//! Shared domain types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel identifier as stored by the ledger
pub type ChannelId = i64;

/// User identifier
pub type UserId = i64;

/// API token identifier
pub type TokenId = i64;

/// Unique request identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh request id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing id (e.g. from an `x-request-id` header)
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upstream provider family of a channel.
///
/// Channels are stored with a free-form type tag. Tags the gateway does not
/// know are kept as [`ProviderType::Other`] so the adaptor lookup can reject
/// them with a configuration error instead of failing to load the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderType {
    /// OpenAI
    OpenAI,
    /// Azure OpenAI
    Azure,
    /// Anthropic
    Anthropic,
    /// Google Gemini
    Gemini,
    /// DeepSeek
    DeepSeek,
    /// OpenRouter
    OpenRouter,
    /// Xinference
    Xinference,
    /// Any OpenAI-compatible endpoint
    Custom,
    /// Unrecognised tag
    Other(String),
}

impl ProviderType {
    /// Canonical tag
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::OpenAI => "openai",
            Self::Azure => "azure",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::DeepSeek => "deepseek",
            Self::OpenRouter => "openrouter",
            Self::Xinference => "xinference",
            Self::Custom => "custom",
            Self::Other(tag) => tag,
        }
    }
}

impl From<&str> for ProviderType {
    fn from(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "openai" => Self::OpenAI,
            "azure" => Self::Azure,
            "anthropic" | "claude" => Self::Anthropic,
            "gemini" | "google" => Self::Gemini,
            "deepseek" => Self::DeepSeek,
            "openrouter" => Self::OpenRouter,
            "xinference" => Self::Xinference,
            "custom" => Self::Custom,
            _ => Self::Other(tag.to_string()),
        }
    }
}

impl From<String> for ProviderType {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<ProviderType> for String {
    fn from(provider: ProviderType) -> Self {
        provider.as_str().to_string()
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage reported by an upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Completion tokens
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    /// Create usage, deriving the total
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// No tokens were reported
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

/// Identity claims of an authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Owning user
    pub user_id: UserId,
    /// Token the request was made with
    pub token_id: TokenId,
    /// Pricing group of the user
    #[serde(default = "default_group")]
    pub group: String,
    /// Token is exempt from the balance floor
    #[serde(default)]
    pub unlimited_quota: bool,
}

fn default_group() -> String {
    "default".to_string()
}

impl CallerIdentity {
    /// Create an identity in the default group
    #[must_use]
    pub fn new(user_id: UserId, token_id: TokenId) -> Self {
        Self {
            user_id,
            token_id,
            group: default_group(),
            unlimited_quota: false,
        }
    }

    /// Set the pricing group
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Mark the token as unlimited
    #[must_use]
    pub fn with_unlimited_quota(mut self, unlimited: bool) -> Self {
        self.unlimited_quota = unlimited;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_round_trip_tags() {
        assert_eq!(ProviderType::from("OpenAI"), ProviderType::OpenAI);
        assert_eq!(ProviderType::from("claude"), ProviderType::Anthropic);
        assert_eq!(
            ProviderType::from("mystery"),
            ProviderType::Other("mystery".into())
        );
        assert_eq!(ProviderType::Other("mystery".into()).as_str(), "mystery");
    }

    #[test]
    fn test_provider_type_serde() {
        let parsed: ProviderType = serde_json::from_str("\"deepseek\"").unwrap();
        assert_eq!(parsed, ProviderType::DeepSeek);
        assert_eq!(
            serde_json::to_string(&ProviderType::OpenRouter).unwrap(),
            "\"openrouter\""
        );
    }

    #[test]
    fn test_usage() {
        let usage = Usage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
        assert!(!usage.is_empty());
        assert!(Usage::default().is_empty());
    }

    #[test]
    fn test_request_id_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }
}
