//! Default adaptor registration.

use crate::client::ClientPool;
use crate::openai::OpenAICompatibleAdaptor;
use gateway_core::ProviderType;
use gateway_relay::AdaptorRegistry;
use std::sync::Arc;

/// Providers served by the OpenAI-compatible adaptor
pub const OPENAI_COMPATIBLE: [ProviderType; 5] = [
    ProviderType::OpenAI,
    ProviderType::DeepSeek,
    ProviderType::OpenRouter,
    ProviderType::Xinference,
    ProviderType::Custom,
];

/// Public endpoint of a hosted provider; self-hosted ones have none
#[must_use]
pub fn default_base_url(provider: &ProviderType) -> Option<&'static str> {
    match provider {
        ProviderType::OpenAI => Some("https://api.openai.com"),
        ProviderType::DeepSeek => Some("https://api.deepseek.com"),
        ProviderType::OpenRouter => Some("https://openrouter.ai/api"),
        _ => None,
    }
}

/// Registry with every built-in adaptor, all drawing on `clients`
#[must_use]
pub fn default_registry(clients: &Arc<ClientPool>) -> AdaptorRegistry {
    let mut registry = AdaptorRegistry::new();

    for provider in OPENAI_COMPATIBLE {
        let clients = Arc::clone(clients);
        let base_url = default_base_url(&provider);
        // Xinference rejects stream_options
        let stream_usage = provider != ProviderType::Xinference;
        registry.register(provider, move || {
            Box::new(
                OpenAICompatibleAdaptor::new(Arc::clone(&clients))
                    .with_default_base_url(base_url)
                    .with_stream_usage(stream_usage),
            )
        });
    }

    #[cfg(feature = "azure")]
    {
        let clients = Arc::clone(clients);
        registry.register(ProviderType::Azure, move || {
            Box::new(OpenAICompatibleAdaptor::azure(Arc::clone(&clients)))
        });
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::UpstreamConfig;

    fn clients() -> Arc<ClientPool> {
        Arc::new(ClientPool::new(&UpstreamConfig::default()).unwrap())
    }

    #[test]
    fn test_default_registry() {
        let registry = default_registry(&clients());
        for provider in OPENAI_COMPATIBLE {
            assert!(registry.supports(&provider), "{provider} missing");
            assert_eq!(registry.create(&provider).unwrap().name(), "openai-compatible");
        }
        assert!(!registry.supports(&ProviderType::Anthropic));
        assert!(!registry.supports(&ProviderType::Gemini));
    }

    #[cfg(feature = "azure")]
    #[test]
    fn test_azure_registered() {
        let registry = default_registry(&clients());
        assert_eq!(registry.create(&ProviderType::Azure).unwrap().name(), "azure-openai");
    }

    #[test]
    fn test_default_base_urls() {
        assert_eq!(default_base_url(&ProviderType::OpenAI), Some("https://api.openai.com"));
        assert_eq!(default_base_url(&ProviderType::Xinference), None);
        assert_eq!(default_base_url(&ProviderType::Custom), None);
    }
}
