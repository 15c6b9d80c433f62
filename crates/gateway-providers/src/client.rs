//! Upstream HTTP clients.
//!
//! Channels without a proxy share one pooled client. Each distinct proxy URL
//! gets its own client, built on first use and kept for the process lifetime.

use dashmap::DashMap;
use gateway_config::UpstreamConfig;
use gateway_core::{GatewayError, GatewayResult};
use reqwest::{Client, Proxy};
use tracing::info;

/// Proxy schemes a channel may use
const PROXY_SCHEMES: [&str; 4] = ["http", "https", "socks5", "socks5h"];

/// Build a pooled client, optionally routed through `proxy`.
///
/// No overall request timeout is set: the relay engine bounds header waits
/// and non-streamed bodies, and the pipeline's idle timeout bounds streams.
///
/// # Errors
/// Returns error if the TLS backend cannot be initialised
pub fn build_client(config: &UpstreamConfig, proxy: Option<Proxy>) -> GatewayResult<Client> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host);
    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| GatewayError::internal(format!("Failed to create HTTP client: {e}")))
}

/// Shared client plus one client per proxy URL
#[derive(Debug)]
pub struct ClientPool {
    config: UpstreamConfig,
    shared: Client,
    proxied: DashMap<String, Client>,
}

impl ClientPool {
    /// Build the shared client
    ///
    /// # Errors
    /// Returns error if the TLS backend cannot be initialised
    pub fn new(config: &UpstreamConfig) -> GatewayResult<Self> {
        Ok(Self {
            config: config.clone(),
            shared: build_client(config, None)?,
            proxied: DashMap::new(),
        })
    }

    /// Client shared by channels without a proxy
    #[must_use]
    pub fn shared(&self) -> Client {
        self.shared.clone()
    }

    /// Client for a channel's proxy setting.
    ///
    /// `None` or a blank URL returns the shared client.
    ///
    /// # Errors
    /// Returns a configuration error for a malformed URL or unsupported scheme
    pub fn client_for(&self, proxy: Option<&str>) -> GatewayResult<Client> {
        let Some(proxy_url) = proxy.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(self.shared());
        };
        if let Some(client) = self.proxied.get(proxy_url) {
            return Ok(client.clone());
        }

        let parsed = url::Url::parse(proxy_url)
            .map_err(|e| GatewayError::configuration(format!("invalid proxy URL: {e}")))?;
        if !PROXY_SCHEMES.contains(&parsed.scheme()) {
            return Err(GatewayError::configuration(format!(
                "unsupported proxy scheme: {}",
                parsed.scheme()
            )));
        }
        let proxy = Proxy::all(parsed.as_str())
            .map_err(|e| GatewayError::configuration(format!("invalid proxy URL: {e}")))?;
        let client = build_client(&self.config, Some(proxy))?;

        info!(scheme = parsed.scheme(), host = ?parsed.host_str(), "Created proxied upstream client");
        Ok(self
            .proxied
            .entry(proxy_url.to_string())
            .or_insert(client)
            .clone())
    }

    /// Number of proxied clients built so far
    #[must_use]
    pub fn proxied_len(&self) -> usize {
        self.proxied.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ClientPool {
        ClientPool::new(&UpstreamConfig::default()).unwrap()
    }

    #[test]
    fn test_channels_without_proxy_share_one_client() {
        let pool = pool();
        pool.client_for(None).unwrap();
        pool.client_for(Some("  ")).unwrap();
        assert_eq!(pool.proxied_len(), 0);
    }

    #[test]
    fn test_one_client_per_proxy_url() {
        let pool = pool();
        pool.client_for(Some("http://127.0.0.1:3128")).unwrap();
        pool.client_for(Some("http://127.0.0.1:3128")).unwrap();
        assert_eq!(pool.proxied_len(), 1);

        pool.client_for(Some("socks5://127.0.0.1:1080")).unwrap();
        assert_eq!(pool.proxied_len(), 2);
    }

    #[test]
    fn test_rejects_bad_proxy() {
        let pool = pool();
        let err = pool.client_for(Some("ftp://127.0.0.1:21")).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
        assert!(pool.client_for(Some("not a url")).is_err());
        assert_eq!(pool.proxied_len(), 0);
    }
}
