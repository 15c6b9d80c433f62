//! Durable ledger boundary.
//!
//! The ledger owns channels, balances, tokens and channel counters. The relay
//! engine reads and mutates them only through this trait so the storage can
//! be swapped (in-memory for tests, SQL in production).

use crate::channel::Channel;
use crate::error::GatewayResult;
use crate::types::{CallerIdentity, ChannelId, TokenId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Balance that a reservation draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaAccount {
    /// User balance
    User(UserId),
    /// Token balance
    Token(TokenId),
}

/// Category of a batched additive update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// User balance
    UserQuota,
    /// Token balance
    TokenQuota,
    /// Quota a user has spent
    UsedQuota,
    /// Quota spent through a channel
    ChannelUsedQuota,
    /// Requests a user has made
    RequestCount,
}

impl DeltaKind {
    /// All kinds, in flush order
    pub const ALL: [Self; 5] = [
        Self::UserQuota,
        Self::TokenQuota,
        Self::UsedQuota,
        Self::ChannelUsedQuota,
        Self::RequestCount,
    ];

    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserQuota => "user_quota",
            Self::TokenQuota => "token_quota",
            Self::UsedQuota => "used_quota",
            Self::ChannelUsedQuota => "channel_used_quota",
            Self::RequestCount => "request_count",
        }
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token row as seen by authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// Identity carried by requests made with this token
    pub identity: CallerIdentity,
    /// Token is usable
    pub enabled: bool,
    /// Owning user is active
    pub user_enabled: bool,
}

/// Durable store of channels, balances and counters
#[async_trait]
pub trait Ledger: Send + Sync {
    /// All enabled channels
    async fn load_enabled_channels(&self) -> GatewayResult<Vec<Channel>>;

    /// Count one relay attempt against a channel
    async fn record_channel_outcome(&self, channel_id: ChannelId, success: bool)
        -> GatewayResult<()>;

    /// Current balance of an account
    async fn balance(&self, account: QuotaAccount) -> GatewayResult<i64>;

    /// Atomically subtract `amount`, failing with `InsufficientQuota` when
    /// `enforce_floor` is set and the balance would go negative. Returns the
    /// new balance.
    async fn decrease_with_floor(
        &self,
        account: QuotaAccount,
        amount: i64,
        enforce_floor: bool,
    ) -> GatewayResult<i64>;

    /// Apply one additive update
    async fn apply_delta(&self, kind: DeltaKind, id: i64, delta: i64) -> GatewayResult<()>;

    /// Look up a token by its bearer key
    async fn find_token(&self, key: &str) -> GatewayResult<Option<TokenRecord>>;
}
