//! Name → provider lookup, built once per invocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::{LlmSettings, ProviderSettings};
use crate::error::ProviderError;
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::google::GoogleProvider;
use crate::llm::ollama::OllamaProvider;
use crate::llm::openai::OpenAiProvider;
use crate::llm::{Backend, LlmProvider, ProviderClient};

/// Registered providers plus the reason each configured-but-broken one
/// could not be built.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn LlmProvider>>,
    unavailable: BTreeMap<String, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured backend. Never makes a network call.
    ///
    /// Unknown backend names are ignored here and reported by validation.
    pub fn from_settings(settings: &LlmSettings) -> Self {
        let mut registry = Self::new();
        for (name, provider_settings) in &settings.providers {
            let Ok(backend) = name.parse::<Backend>() else {
                warn!(provider = %name, "Ignoring unknown LLM provider in settings");
                continue;
            };
            match build(backend, provider_settings) {
                Ok(client) => {
                    debug!(provider = %name, model = client.model_name(), "Registered LLM provider");
                    registry.register(name.clone(), Arc::new(client));
                }
                Err(reason) => {
                    debug!(provider = %name, %reason, "LLM provider unavailable");
                    registry.unavailable.insert(name.clone(), reason);
                }
            }
        }
        registry
    }

    /// Register (or replace) a provider under `name`.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        let name = name.into();
        self.unavailable.remove(&name);
        self.providers.insert(name, provider);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        if let Some(provider) = self.providers.get(name) {
            return Ok(Arc::clone(provider));
        }
        if let Some(reason) = self.unavailable.get(name) {
            return Err(ProviderError::Unavailable {
                name: name.to_string(),
                reason: reason.clone(),
            });
        }
        if name.parse::<Backend>().is_ok() {
            return Err(ProviderError::Unavailable {
                name: name.to_string(),
                reason: "not configured under [llm.providers]".to_string(),
            });
        }
        Err(ProviderError::Unknown {
            name: name.to_string(),
            available: self.available().join(", "),
        })
    }

    /// Configured providers that could not be built, with the reason.
    pub fn unavailable(&self) -> impl Iterator<Item = (&str, &str)> {
        self.unavailable
            .iter()
            .map(|(name, reason)| (name.as_str(), reason.as_str()))
    }

    /// Names of usable providers, sorted.
    pub fn available(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

fn build(backend: Backend, settings: &ProviderSettings) -> Result<ProviderClient, String> {
    let has_key = settings
        .api_key
        .as_ref()
        .is_some_and(|k| !k.expose_secret().trim().is_empty());
    if backend.requires_api_key() && !has_key {
        return Err("api_key is missing or empty".to_string());
    }

    let client = match backend {
        Backend::OpenAi => OpenAiProvider::new(settings).map(ProviderClient::OpenAi),
        Backend::Anthropic => AnthropicProvider::new(settings).map(ProviderClient::Anthropic),
        Backend::Google => GoogleProvider::new(settings).map(ProviderClient::Google),
        Backend::Ollama => OllamaProvider::new(settings).map(ProviderClient::Ollama),
    };
    client.map_err(|e| e.to_string())
}
