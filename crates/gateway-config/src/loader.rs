//! Config file loading and environment overrides.

use crate::{GatewayConfig, LedgerBackend};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// File path
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// Config file is not valid YAML for [`GatewayConfig`]
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        /// File path
        path: String,
        /// Underlying parse error
        #[source]
        source: serde_yaml::Error,
    },
    /// Environment variable holds an unusable value
    #[error("Invalid value for {var}: {value}")]
    Env {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },
    /// A field failed validation
    #[error("Invalid configuration for {field}: {message}")]
    Invalid {
        /// Field path
        field: String,
        /// What is wrong
        message: String,
    },
}

/// Load configuration from `path` (if any), then apply `GATEWAY_*` overrides.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed, an override is
/// malformed, or the result fails validation
pub async fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let shown = path.display().to_string();
            let raw = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: shown.clone(),
                    source,
                })?;
            info!(path = %shown, "Loading configuration file");
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: shown,
                source,
            })?
        }
        None => {
            debug!("No configuration file given, using defaults");
            GatewayConfig::default()
        }
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}

/// Apply overrides from a variable lookup
pub(crate) fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("GATEWAY_HOST") {
        config.server.host = host;
    }
    if let Some(port) = parse_var(&lookup, "GATEWAY_PORT")? {
        config.server.port = port;
    }
    if let Some(secs) = parse_var::<u64, _>(&lookup, "GATEWAY_STREAMING_TIMEOUT")? {
        config.streaming.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(enabled) = parse_var(&lookup, "GATEWAY_PING_ENABLED")? {
        config.streaming.ping_enabled = enabled;
    }
    if let Some(secs) = parse_var::<u64, _>(&lookup, "GATEWAY_PING_INTERVAL")? {
        config.streaming.ping_interval = Duration::from_secs(secs);
    }
    if let Some(bytes) = parse_var(&lookup, "GATEWAY_STREAM_INITIAL_BUFFER")? {
        config.streaming.initial_buffer_size = bytes;
    }
    if let Some(bytes) = parse_var(&lookup, "GATEWAY_STREAM_MAX_BUFFER")? {
        config.streaming.max_buffer_size = bytes;
    }
    if let Some(secs) = parse_var::<u64, _>(&lookup, "GATEWAY_BATCH_UPDATE_INTERVAL")? {
        config.quota.flush_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_var::<u64, _>(&lookup, "GATEWAY_CHANNEL_REFRESH_INTERVAL")? {
        config.routing.refresh_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_var::<u64, _>(&lookup, "GATEWAY_RESPONSE_HEADER_TIMEOUT")? {
        config.upstream.response_header_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_var::<u64, _>(&lookup, "GATEWAY_RELAY_TIMEOUT")? {
        // 0 disables the overall deadline
        config.upstream.relay_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(secret) = lookup("GATEWAY_AUTH_SECRET") {
        config.auth.hmac_secret = Some(secret);
    }
    if let Some(url) = lookup("GATEWAY_DATABASE_URL") {
        config.ledger.backend = LedgerBackend::Sqlite;
        config.ledger.database_url = url;
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => {
                warn!(var = var, value = %value, "Ignoring malformed environment override");
                Err(ConfigError::Env {
                    var: var.to_string(),
                    value,
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        apply_env_overrides(
            &mut config,
            lookup_from(&[
                ("GATEWAY_PORT", "9000"),
                ("GATEWAY_STREAMING_TIMEOUT", "120"),
                ("GATEWAY_PING_ENABLED", "true"),
                ("GATEWAY_BATCH_UPDATE_INTERVAL", "1"),
                ("GATEWAY_DATABASE_URL", "sqlite::memory:"),
            ]),
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.streaming.idle_timeout, Duration::from_secs(120));
        assert!(config.streaming.ping_enabled);
        assert_eq!(config.quota.flush_interval, Duration::from_secs(1));
        assert_eq!(config.ledger.backend, LedgerBackend::Sqlite);
        assert_eq!(config.ledger.database_url, "sqlite::memory:");
    }

    #[test]
    fn test_upstream_timeout_overrides() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.upstream.response_header_timeout, Duration::from_secs(30));
        assert!(config.upstream.relay_timeout.is_none());

        apply_env_overrides(
            &mut config,
            lookup_from(&[
                ("GATEWAY_RESPONSE_HEADER_TIMEOUT", "5"),
                ("GATEWAY_RELAY_TIMEOUT", "300"),
            ]),
        )
        .unwrap();
        assert_eq!(config.upstream.response_header_timeout, Duration::from_secs(5));
        assert_eq!(config.upstream.relay_timeout, Some(Duration::from_secs(300)));

        apply_env_overrides(&mut config, lookup_from(&[("GATEWAY_RELAY_TIMEOUT", "0")])).unwrap();
        assert!(config.upstream.relay_timeout.is_none());
    }

    #[test]
    fn test_malformed_override_is_an_error() {
        let mut config = GatewayConfig::default();
        let err = apply_env_overrides(&mut config, lookup_from(&[("GATEWAY_PORT", "http")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref var, .. } if var == "GATEWAY_PORT"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "streaming:\n  ping_enabled: true\nledger:\n  channels:\n    - id: 1\n      provider_type: openai\n      key: sk-1"
        )
        .unwrap();

        let config = load_config(Some(file.path())).await.unwrap();
        assert!(config.streaming.ping_enabled);
        assert_eq!(config.ledger.channels.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/relay.yaml")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
