//! SQLite-backed ledger.

use async_trait::async_trait;
use gateway_config::{ChannelSeed, TokenSeed};
use gateway_core::{
    CallerIdentity, Channel, ChannelId, DeltaKind, GatewayError, GatewayResult, Ledger,
    ProviderType, QuotaAccount, TokenRecord,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        provider_type TEXT NOT NULL,
        key TEXT NOT NULL,
        base_url TEXT,
        weight INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1,
        models TEXT NOT NULL DEFAULT '',
        model_mapping TEXT NOT NULL DEFAULT '{}',
        status_code_mapping TEXT NOT NULL DEFAULT '{}',
        proxy TEXT,
        total_count INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        used_quota INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        quota INTEGER NOT NULL DEFAULT 0,
        used_quota INTEGER NOT NULL DEFAULT 0,
        request_count INTEGER NOT NULL DEFAULT 0,
        user_group TEXT NOT NULL DEFAULT 'default',
        enabled INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS tokens (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        key TEXT NOT NULL UNIQUE,
        remain_quota INTEGER NOT NULL DEFAULT 0,
        unlimited_quota INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1
    )",
];

fn db_err(e: sqlx::Error) -> GatewayError {
    GatewayError::ledger(e.to_string())
}

/// Ledger stored in a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Connect with a small pool
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        Self::connect_with(url, 5).await
    }

    /// Connect with `max_connections` pooled connections.
    ///
    /// `sqlite::memory:` databases are per connection, so use one connection
    /// for them.
    pub async fn connect_with(url: &str, max_connections: u32) -> GatewayResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect(url)
            .await
            .map_err(db_err)?;
        let ledger = Self { pool };
        ledger.ensure_schema().await?;
        info!(url = %url, "SQLite ledger connected");
        Ok(ledger)
    }

    /// Create missing tables
    pub async fn ensure_schema(&self) -> GatewayResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Insert channels, users and tokens that do not exist yet
    pub async fn seed(&self, channels: &[ChannelSeed], tokens: &[TokenSeed]) -> GatewayResult<()> {
        for seed in channels {
            let models = seed.models.join(",");
            let model_mapping = serde_json::to_string(&seed.model_mapping)?;
            let status_code_mapping = serde_json::to_string(&seed.status_code_mapping)?;
            sqlx::query(
                "INSERT OR IGNORE INTO channels
                    (id, name, provider_type, key, base_url, weight, enabled, models,
                     model_mapping, status_code_mapping, proxy)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(seed.id)
            .bind(&seed.name)
            .bind(&seed.provider_type)
            .bind(&seed.key)
            .bind(seed.base_url.clone())
            .bind(i64::from(seed.weight))
            .bind(seed.enabled)
            .bind(models)
            .bind(model_mapping)
            .bind(status_code_mapping)
            .bind(seed.proxy.clone())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }

        for seed in tokens {
            sqlx::query("INSERT OR IGNORE INTO users (id, quota, user_group) VALUES (?, ?, ?)")
                .bind(seed.user_id)
                .bind(seed.user_quota)
                .bind(&seed.group)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            sqlx::query(
                "INSERT OR IGNORE INTO tokens (id, user_id, key, remain_quota, unlimited_quota)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(seed.token_id)
            .bind(seed.user_id)
            .bind(&seed.key)
            .bind(seed.token_quota)
            .bind(seed.unlimited_quota)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }

        debug!(
            channels = channels.len(),
            tokens = tokens.len(),
            "Ledger seed applied"
        );
        Ok(())
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn channel_from_row(row: &SqliteRow) -> GatewayResult<Channel> {
        let id: i64 = row.try_get("id").map_err(db_err)?;
        let provider_type: String = row.try_get("provider_type").map_err(db_err)?;
        let key: String = row.try_get("key").map_err(db_err)?;
        let weight: i64 = row.try_get("weight").map_err(db_err)?;
        let enabled: i64 = row.try_get("enabled").map_err(db_err)?;
        let models: String = row.try_get("models").map_err(db_err)?;

        let mut channel = Channel::new(id, ProviderType::from(provider_type), key)
            .with_weight(u32::try_from(weight).unwrap_or(0))
            .with_enabled(enabled != 0)
            .with_models(
                models
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty()),
            );

        let name: String = row.try_get("name").map_err(db_err)?;
        if !name.is_empty() {
            channel.name = name;
        }
        channel.base_url = row.try_get("base_url").map_err(db_err)?;
        channel.model_mapping = parse_mapping(id, "model_mapping", row)?;
        channel.status_code_mapping = parse_mapping(id, "status_code_mapping", row)?;
        let proxy: Option<String> = row.try_get("proxy").map_err(db_err)?;
        channel.proxy = proxy.filter(|p| !p.trim().is_empty());
        Ok(channel)
    }
}

fn parse_mapping(
    channel_id: ChannelId,
    column: &str,
    row: &SqliteRow,
) -> GatewayResult<HashMap<String, String>> {
    let raw: String = row.try_get(column).map_err(db_err)?;
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    match serde_json::from_str(&raw) {
        Ok(mapping) => Ok(mapping),
        Err(e) => {
            warn!(channel_id = channel_id, column = column, error = %e, "Ignoring malformed channel mapping");
            Ok(HashMap::new())
        }
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn load_enabled_channels(&self) -> GatewayResult<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT id, name, provider_type, key, base_url, weight, enabled, models,
                    model_mapping, status_code_mapping, proxy
             FROM channels WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::channel_from_row).collect()
    }

    async fn record_channel_outcome(
        &self,
        channel_id: ChannelId,
        success: bool,
    ) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE channels
             SET total_count = total_count + 1,
                 success_count = success_count + ?
             WHERE id = ?",
        )
        .bind(i64::from(success))
        .bind(channel_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn balance(&self, account: QuotaAccount) -> GatewayResult<i64> {
        let (sql, id) = match account {
            QuotaAccount::User(id) => ("SELECT quota FROM users WHERE id = ?", id),
            QuotaAccount::Token(id) => ("SELECT remain_quota FROM tokens WHERE id = ?", id),
        };
        let row = sqlx::query(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| GatewayError::ledger(format!("{account:?} not found")))?;
        row.try_get::<i64, _>(0).map_err(db_err)
    }

    async fn decrease_with_floor(
        &self,
        account: QuotaAccount,
        amount: i64,
        enforce_floor: bool,
    ) -> GatewayResult<i64> {
        let (sql, id) = match account {
            QuotaAccount::User(id) => (
                "UPDATE users SET quota = quota - ?1
                 WHERE id = ?2 AND (?3 = 0 OR quota >= ?1)
                 RETURNING quota",
                id,
            ),
            QuotaAccount::Token(id) => (
                "UPDATE tokens SET remain_quota = remain_quota - ?1
                 WHERE id = ?2 AND (?3 = 0 OR remain_quota >= ?1)
                 RETURNING remain_quota",
                id,
            ),
        };

        let updated = sqlx::query(sql)
            .bind(amount)
            .bind(id)
            .bind(enforce_floor)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match updated {
            Some(row) => row.try_get::<i64, _>(0).map_err(db_err),
            None => {
                let available = self.balance(account).await?;
                Err(GatewayError::InsufficientQuota {
                    required: amount,
                    available,
                })
            }
        }
    }

    async fn apply_delta(&self, kind: DeltaKind, id: i64, delta: i64) -> GatewayResult<()> {
        let sql = match kind {
            DeltaKind::UserQuota => "UPDATE users SET quota = quota + ? WHERE id = ?",
            DeltaKind::TokenQuota => "UPDATE tokens SET remain_quota = remain_quota + ? WHERE id = ?",
            DeltaKind::UsedQuota => "UPDATE users SET used_quota = used_quota + ? WHERE id = ?",
            DeltaKind::RequestCount => {
                "UPDATE users SET request_count = request_count + ? WHERE id = ?"
            }
            DeltaKind::ChannelUsedQuota => {
                "UPDATE channels SET used_quota = used_quota + ? WHERE id = ?"
            }
        };
        sqlx::query(sql)
            .bind(delta)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn find_token(&self, key: &str) -> GatewayResult<Option<TokenRecord>> {
        let row = sqlx::query(
            "SELECT t.id AS token_id, t.user_id, t.unlimited_quota, t.enabled AS token_enabled,
                    u.user_group, u.enabled AS user_enabled
             FROM tokens t LEFT JOIN users u ON u.id = t.user_id
             WHERE t.key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let token_id: i64 = row.try_get("token_id").map_err(db_err)?;
        let user_id: i64 = row.try_get("user_id").map_err(db_err)?;
        let unlimited: i64 = row.try_get("unlimited_quota").map_err(db_err)?;
        let token_enabled: i64 = row.try_get("token_enabled").map_err(db_err)?;
        let group: Option<String> = row.try_get("user_group").map_err(db_err)?;
        let user_enabled: Option<i64> = row.try_get("user_enabled").map_err(db_err)?;

        Ok(Some(TokenRecord {
            identity: CallerIdentity::new(user_id, token_id)
                .with_group(group.unwrap_or_else(|| "default".to_string()))
                .with_unlimited_quota(unlimited != 0),
            enabled: token_enabled != 0,
            user_enabled: user_enabled.unwrap_or(0) != 0,
        }))
    }
}
