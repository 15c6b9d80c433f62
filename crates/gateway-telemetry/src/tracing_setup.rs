//! Logging and tracing setup.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter`, a text or
//! JSON formatting layer and, when enabled, an OpenTelemetry layer.

use gateway_config::LoggingSettings;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::{
    trace::{Config, RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Service name reported to OpenTelemetry
pub const SERVICE_NAME: &str = "relay-gateway";

/// Filter from `RUST_LOG`, falling back to the configured level
#[must_use]
pub fn env_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level))
}

fn tracer_provider() -> TracerProvider {
    let resource = Resource::new(vec![
        opentelemetry::KeyValue::new("service.name", SERVICE_NAME),
        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let tracer_config = Config::default()
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource);

    TracerProvider::builder().with_config(tracer_config).build()
}

/// Initialize logging and, if enabled, OpenTelemetry tracing.
///
/// Returns the tracer provider so the caller can shut it down on exit.
///
/// # Errors
/// Returns error if a global subscriber is already installed
pub fn init_tracing(settings: &LoggingSettings) -> Result<Option<TracerProvider>, TracingError> {
    let fmt_layer = if settings.json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let provider = settings.otel_enabled.then(tracer_provider);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(SERVICE_NAME)));

    tracing_subscriber::registry()
        .with(env_filter(settings))
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TracingError::Init(e.to_string()))?;

    info!(
        level = %settings.level,
        json = settings.json,
        otel = settings.otel_enabled,
        "Logging initialized"
    );

    Ok(provider)
}

/// Shutdown tracing and flush remaining spans
pub fn shutdown_tracing(provider: Option<TracerProvider>) {
    if let Some(provider) = provider {
        for result in provider.force_flush() {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to flush spans");
            }
        }
        drop(provider);
        info!("Tracing shutdown complete");
    }
}

/// Tracing initialization error
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    /// Failed to initialize tracing
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}

/// Create a span for one relay attempt
#[macro_export]
macro_rules! relay_span {
    ($request_id:expr, $model:expr, $channel_id:expr) => {
        tracing::info_span!(
            "relay",
            request_id = %$request_id,
            model = %$model,
            channel_id = $channel_id,
            otel.kind = "client"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_uses_configured_level() {
        let settings = LoggingSettings {
            level: "debug".to_string(),
            ..LoggingSettings::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(env_filter(&settings).to_string(), "debug");
        }
    }

    #[test]
    fn test_relay_span_builds() {
        let span = relay_span!("req-1", "gpt-4o", 3_i64);
        drop(span);
    }
}
