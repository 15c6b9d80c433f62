//! Fast-auth cache.
//!
//! Verified credentials are cached for a few minutes, keyed by an
//! HMAC-SHA256 of the key so raw keys never sit in memory longer than the
//! request. Expired entries are evicted on lookup and by [`AuthSweepJob`].
//! A miss falls back to [`Ledger::find_token`] and populates the cache.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use gateway_config::AuthConfig;
use gateway_core::{CallerIdentity, GatewayError, GatewayResult, Ledger, PeriodicJob};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
struct CachedIdentity {
    identity: CallerIdentity,
    expires_at: Instant,
}

/// Credential cache in front of the ledger
pub struct FastAuthCache {
    ledger: Arc<dyn Ledger>,
    mac: HmacSha256,
    ttl: Duration,
    enabled: bool,
    entries: DashMap<String, CachedIdentity>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for FastAuthCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastAuthCache")
            .field("ttl", &self.ttl)
            .field("enabled", &self.enabled)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl FastAuthCache {
    /// Create a cache; a random HMAC key is used when none is configured
    ///
    /// # Errors
    /// Returns error if the HMAC key is rejected
    pub fn new(ledger: Arc<dyn Ledger>, config: &AuthConfig) -> GatewayResult<Self> {
        let secret = match config.hmac_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                let mut random = vec![0_u8; 32];
                rand::thread_rng().fill_bytes(&mut random);
                random
            }
        };
        let mac = HmacSha256::new_from_slice(&secret)
            .map_err(|e| GatewayError::configuration(format!("invalid auth HMAC key: {e}")))?;

        Ok(Self {
            ledger,
            mac,
            ttl: config.cache_ttl,
            enabled: config.cache_enabled,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn fingerprint(&self, key: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Resolve `key` to a caller identity.
    ///
    /// # Errors
    /// Returns `Authentication` for unknown, disabled or orphaned tokens, and
    /// `Ledger` when verification itself fails
    pub async fn authenticate(&self, key: &str) -> GatewayResult<CallerIdentity> {
        let fingerprint = self.fingerprint(key);

        if self.enabled {
            let now = Instant::now();
            let cached = self.entries.get(&fingerprint).map(|e| e.value().clone());
            match cached {
                Some(entry) if entry.expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.identity);
                }
                Some(_) => {
                    self.entries
                        .remove_if(&fingerprint, |_, e| e.expires_at <= now);
                }
                None => {}
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let record = self
            .ledger
            .find_token(key)
            .await?
            .ok_or_else(|| GatewayError::authentication("invalid token"))?;
        if !record.enabled {
            return Err(GatewayError::authentication("token is disabled"));
        }
        if !record.user_enabled {
            return Err(GatewayError::authentication("user is disabled"));
        }

        if self.enabled {
            self.entries.insert(
                fingerprint,
                CachedIdentity {
                    identity: record.identity.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        debug!(user_id = record.identity.user_id, token_id = record.identity.token_id, "Token verified");
        Ok(record.identity)
    }

    /// Drop the cached entry for `key`
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(&self.fingerprint(key));
    }

    /// Remove expired entries; returns how many
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Cached entries, expired ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache hits and misses
    #[must_use]
    pub fn hit_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// Pull the key out of `Authorization: Bearer <key>`
///
/// # Errors
/// Returns `Authentication` when the header is missing or malformed
pub fn bearer_key(headers: &HeaderMap) -> GatewayResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| GatewayError::authentication("missing Authorization header"))?
        .to_str()
        .map_err(|_| GatewayError::authentication("invalid Authorization header"))?;

    let key = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| GatewayError::authentication("expected: Bearer <key>"))?;
    if key.is_empty() {
        return Err(GatewayError::authentication("empty API key"));
    }
    Ok(key)
}

/// Periodic eviction of expired credentials
#[derive(Debug)]
pub struct AuthSweepJob {
    cache: Arc<FastAuthCache>,
}

impl AuthSweepJob {
    /// Sweep `cache`
    #[must_use]
    pub fn new(cache: Arc<FastAuthCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PeriodicJob for AuthSweepJob {
    fn name(&self) -> &'static str {
        "auth_cache_sweep"
    }

    async fn tick(&self) {
        let removed = self.cache.sweep();
        if removed > 0 {
            info!(removed = removed, remaining = self.cache.len(), "Swept expired auth entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_quota::InMemoryLedger;

    fn cache(ledger: &Arc<InMemoryLedger>, ttl: Duration) -> FastAuthCache {
        let config = AuthConfig {
            cache_ttl: ttl,
            hmac_secret: Some("test-secret".to_string()),
            ..AuthConfig::default()
        };
        FastAuthCache::new(ledger.clone(), &config).unwrap()
    }

    fn ledger() -> Arc<InMemoryLedger> {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.insert_user(1, 1_000, "vip");
        ledger.insert_token("sk-good", 10, 1, 500, false);
        ledger
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_then_hit() {
        let ledger = ledger();
        let cache = cache(&ledger, Duration::from_secs(300));

        let identity = cache.authenticate("sk-good").await.unwrap();
        assert_eq!((identity.user_id, identity.token_id), (1, 10));
        assert_eq!(identity.group, "vip");
        cache.authenticate("sk-good").await.unwrap();

        assert_eq!(ledger.token_lookups(), 1);
        assert_eq!(cache.hit_stats(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_reverified() {
        let ledger = ledger();
        let cache = cache(&ledger, Duration::from_secs(300));

        cache.authenticate("sk-good").await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        cache.authenticate("sk-good").await.unwrap();
        assert_eq!(ledger.token_lookups(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let ledger = ledger();
        ledger.insert_token("sk-other", 11, 1, 500, false);
        let cache = Arc::new(cache(&ledger, Duration::from_secs(60)));

        cache.authenticate("sk-good").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.authenticate("sk-other").await.unwrap();

        AuthSweepJob::new(cache.clone()).tick().await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_rejections() {
        let ledger = ledger();
        let cache = cache(&ledger, Duration::from_secs(300));

        let err = cache.authenticate("sk-unknown").await.unwrap_err();
        assert_eq!(err.status_code(), 401);

        ledger.set_user_enabled(1, false);
        let err = cache.authenticate("sk-good").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_fingerprint_is_keyed() {
        let ledger = ledger();
        let a = cache(&ledger, Duration::from_secs(1));
        let b = FastAuthCache::new(ledger.clone(), &AuthConfig::default()).unwrap();
        assert_ne!(a.fingerprint("sk-good"), b.fingerprint("sk-good"));
        assert_eq!(a.fingerprint("sk-good").len(), 64);
    }

    #[test]
    fn test_bearer_key() {
        let mut headers = HeaderMap::new();
        assert!(bearer_key(&headers).is_err());

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_key(&headers).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer sk-good".parse().unwrap());
        assert_eq!(bearer_key(&headers).unwrap(), "sk-good");
    }
}
