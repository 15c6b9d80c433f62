//! Process-memory ledger.

use async_trait::async_trait;
use dashmap::DashMap;
use gateway_config::{ChannelSeed, TokenSeed};
use gateway_core::{
    CallerIdentity, Channel, ChannelId, ChannelStat, DeltaKind, GatewayError, GatewayResult,
    Ledger, QuotaAccount, TokenId, TokenRecord, UserId,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct UserRow {
    quota: i64,
    used_quota: i64,
    request_count: i64,
    group: String,
    enabled: bool,
}

#[derive(Debug, Clone)]
struct TokenRow {
    user_id: UserId,
    remain_quota: i64,
    unlimited_quota: bool,
    enabled: bool,
}

/// One additive update as the ledger received it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedDelta {
    /// Update kind
    pub kind: DeltaKind,
    /// Entity id
    pub id: i64,
    /// Signed delta
    pub delta: i64,
}

/// Ledger kept entirely in process memory.
///
/// Also carries fault switches so callers can exercise error paths.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    channels: RwLock<BTreeMap<ChannelId, Channel>>,
    channel_stats: DashMap<ChannelId, ChannelStat>,
    channel_used_quota: DashMap<ChannelId, i64>,
    users: DashMap<UserId, UserRow>,
    tokens: DashMap<TokenId, TokenRow>,
    keys: DashMap<String, TokenId>,
    applied: Mutex<Vec<AppliedDelta>>,
    failing_channel_loads: AtomicUsize,
    failing_stat_writes: AtomicBool,
    failing_delta_writes: AtomicBool,
    token_lookups: AtomicU64,
}

impl InMemoryLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger from config seeds
    #[must_use]
    pub fn from_seeds(channels: &[ChannelSeed], tokens: &[TokenSeed]) -> Self {
        let ledger = Self::new();
        for seed in channels {
            ledger.upsert_channel(seed.to_channel());
        }
        for seed in tokens {
            if !ledger.users.contains_key(&seed.user_id) {
                ledger.insert_user(seed.user_id, seed.user_quota, &seed.group);
            }
            ledger.insert_token(
                &seed.key,
                seed.token_id,
                seed.user_id,
                seed.token_quota,
                seed.unlimited_quota,
            );
        }
        ledger
    }

    /// Insert or replace a channel
    pub fn upsert_channel(&self, channel: Channel) {
        self.channels.write().insert(channel.id, channel);
    }

    /// Insert or replace a user
    pub fn insert_user(&self, user_id: UserId, quota: i64, group: &str) {
        self.users.insert(
            user_id,
            UserRow {
                quota,
                used_quota: 0,
                request_count: 0,
                group: group.to_string(),
                enabled: true,
            },
        );
    }

    /// Insert or replace a token
    pub fn insert_token(
        &self,
        key: &str,
        token_id: TokenId,
        user_id: UserId,
        remain_quota: i64,
        unlimited_quota: bool,
    ) {
        self.tokens.insert(
            token_id,
            TokenRow {
                user_id,
                remain_quota,
                unlimited_quota,
                enabled: true,
            },
        );
        self.keys.insert(key.to_string(), token_id);
    }

    /// Enable or disable a user
    pub fn set_user_enabled(&self, user_id: UserId, enabled: bool) {
        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.enabled = enabled;
        }
    }

    /// Persisted counters for a channel
    #[must_use]
    pub fn channel_stat(&self, channel_id: ChannelId) -> ChannelStat {
        self.channel_stats
            .get(&channel_id)
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Quota spent through a channel
    #[must_use]
    pub fn channel_used_quota(&self, channel_id: ChannelId) -> i64 {
        self.channel_used_quota
            .get(&channel_id)
            .map(|q| *q)
            .unwrap_or_default()
    }

    /// Quota a user has spent
    #[must_use]
    pub fn used_quota(&self, user_id: UserId) -> i64 {
        self.users.get(&user_id).map(|u| u.used_quota).unwrap_or_default()
    }

    /// Requests a user has made
    #[must_use]
    pub fn request_count(&self, user_id: UserId) -> i64 {
        self.users
            .get(&user_id)
            .map(|u| u.request_count)
            .unwrap_or_default()
    }

    /// Every additive update applied so far
    #[must_use]
    pub fn applied_deltas(&self) -> Vec<AppliedDelta> {
        self.applied.lock().clone()
    }

    /// Number of `find_token` calls
    #[must_use]
    pub fn token_lookups(&self) -> u64 {
        self.token_lookups.load(Ordering::SeqCst)
    }

    /// Fail the next `n` channel loads
    pub fn fail_next_channel_loads(&self, n: usize) {
        self.failing_channel_loads.store(n, Ordering::SeqCst);
    }

    /// Fail channel outcome writes while set
    pub fn fail_stat_writes(&self, fail: bool) {
        self.failing_stat_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail additive updates while set
    pub fn fail_delta_writes(&self, fail: bool) {
        self.failing_delta_writes.store(fail, Ordering::SeqCst);
    }

    fn take_channel_load_failure(&self) -> bool {
        self.failing_channel_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn load_enabled_channels(&self) -> GatewayResult<Vec<Channel>> {
        if self.take_channel_load_failure() {
            return Err(GatewayError::ledger("channel table unavailable"));
        }
        Ok(self
            .channels
            .read()
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    async fn record_channel_outcome(
        &self,
        channel_id: ChannelId,
        success: bool,
    ) -> GatewayResult<()> {
        if self.failing_stat_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::ledger("channel stat write failed"));
        }
        self.channel_stats
            .entry(channel_id)
            .or_default()
            .record(success);
        Ok(())
    }

    async fn balance(&self, account: QuotaAccount) -> GatewayResult<i64> {
        match account {
            QuotaAccount::User(id) => self
                .users
                .get(&id)
                .map(|u| u.quota)
                .ok_or_else(|| GatewayError::ledger(format!("user {id} not found"))),
            QuotaAccount::Token(id) => self
                .tokens
                .get(&id)
                .map(|t| t.remain_quota)
                .ok_or_else(|| GatewayError::ledger(format!("token {id} not found"))),
        }
    }

    async fn decrease_with_floor(
        &self,
        account: QuotaAccount,
        amount: i64,
        enforce_floor: bool,
    ) -> GatewayResult<i64> {
        let check = |balance: &mut i64| -> GatewayResult<i64> {
            if enforce_floor && *balance < amount {
                return Err(GatewayError::InsufficientQuota {
                    required: amount,
                    available: *balance,
                });
            }
            *balance -= amount;
            Ok(*balance)
        };

        match account {
            QuotaAccount::User(id) => {
                let mut user = self
                    .users
                    .get_mut(&id)
                    .ok_or_else(|| GatewayError::ledger(format!("user {id} not found")))?;
                check(&mut user.quota)
            }
            QuotaAccount::Token(id) => {
                let mut token = self
                    .tokens
                    .get_mut(&id)
                    .ok_or_else(|| GatewayError::ledger(format!("token {id} not found")))?;
                check(&mut token.remain_quota)
            }
        }
    }

    async fn apply_delta(&self, kind: DeltaKind, id: i64, delta: i64) -> GatewayResult<()> {
        if self.failing_delta_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::ledger("delta write failed"));
        }

        match kind {
            DeltaKind::UserQuota => {
                if let Some(mut user) = self.users.get_mut(&id) {
                    user.quota += delta;
                }
            }
            DeltaKind::TokenQuota => {
                if let Some(mut token) = self.tokens.get_mut(&id) {
                    token.remain_quota += delta;
                }
            }
            DeltaKind::UsedQuota => {
                if let Some(mut user) = self.users.get_mut(&id) {
                    user.used_quota += delta;
                }
            }
            DeltaKind::RequestCount => {
                if let Some(mut user) = self.users.get_mut(&id) {
                    user.request_count += delta;
                }
            }
            DeltaKind::ChannelUsedQuota => {
                *self.channel_used_quota.entry(id).or_default() += delta;
            }
        }

        self.applied.lock().push(AppliedDelta { kind, id, delta });
        Ok(())
    }

    async fn find_token(&self, key: &str) -> GatewayResult<Option<TokenRecord>> {
        self.token_lookups.fetch_add(1, Ordering::SeqCst);

        let Some(token_id) = self.keys.get(key).map(|id| *id) else {
            return Ok(None);
        };
        let Some(token) = self.tokens.get(&token_id).map(|t| t.clone()) else {
            return Ok(None);
        };
        let (group, user_enabled) = self
            .users
            .get(&token.user_id)
            .map(|u| (u.group.clone(), u.enabled))
            .unwrap_or_else(|| ("default".to_string(), false));

        Ok(Some(TokenRecord {
            identity: CallerIdentity::new(token.user_id, token_id)
                .with_group(group)
                .with_unlimited_quota(token.unlimited_quota),
            enabled: token.enabled,
            user_enabled,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::ProviderType;

    #[tokio::test]
    async fn test_decrease_with_floor() {
        let ledger = InMemoryLedger::new();
        ledger.insert_user(1, 100, "default");

        assert_eq!(
            ledger
                .decrease_with_floor(QuotaAccount::User(1), 60, true)
                .await
                .unwrap(),
            40
        );
        let err = ledger
            .decrease_with_floor(QuotaAccount::User(1), 60, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InsufficientQuota {
                required: 60,
                available: 40
            }
        ));
        assert_eq!(ledger.balance(QuotaAccount::User(1)).await.unwrap(), 40);

        // no floor: may go negative
        assert_eq!(
            ledger
                .decrease_with_floor(QuotaAccount::User(1), 60, false)
                .await
                .unwrap(),
            -20
        );
    }

    #[tokio::test]
    async fn test_find_token() {
        let ledger = InMemoryLedger::new();
        ledger.insert_user(7, 1_000, "vip");
        ledger.insert_token("sk-live", 70, 7, 500, true);

        let record = ledger.find_token("sk-live").await.unwrap().unwrap();
        assert_eq!(record.identity.user_id, 7);
        assert_eq!(record.identity.token_id, 70);
        assert_eq!(record.identity.group, "vip");
        assert!(record.identity.unlimited_quota);
        assert!(record.user_enabled);

        assert!(ledger.find_token("sk-nope").await.unwrap().is_none());
        assert_eq!(ledger.token_lookups(), 2);
    }

    #[tokio::test]
    async fn test_channel_load_failures_are_counted_down() {
        let ledger = InMemoryLedger::new();
        ledger.upsert_channel(Channel::new(1, ProviderType::OpenAI, "k"));
        ledger.fail_next_channel_loads(1);

        assert!(ledger.load_enabled_channels().await.is_err());
        assert_eq!(ledger.load_enabled_channels().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_delta_updates_rows() {
        let ledger = InMemoryLedger::new();
        ledger.insert_user(1, 0, "default");
        ledger.apply_delta(DeltaKind::UsedQuota, 1, 30).await.unwrap();
        ledger.apply_delta(DeltaKind::RequestCount, 1, 2).await.unwrap();
        ledger
            .apply_delta(DeltaKind::ChannelUsedQuota, 4, 30)
            .await
            .unwrap();

        assert_eq!(ledger.used_quota(1), 30);
        assert_eq!(ledger.request_count(1), 2);
        assert_eq!(ledger.channel_used_quota(4), 30);
        assert_eq!(ledger.applied_deltas().len(), 3);
    }
}
