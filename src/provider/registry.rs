//! Provider registry: resolves a `provider:model` spec string (or a
//! registered alias) into a live `ChatProvider`, grounded on
//! `providers/factory.py`.

use super::anthropic::AnthropicProvider;
use super::gemini::GeminiProvider;
use super::openai::OpenAiProvider;
use super::ChatProvider;
use crate::error::ConfigError;
use serde::de::Error as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// One entry in `providers.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    /// Which adapter implementation to construct: "openai", "anthropic", "gemini".
    pub class: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Base URL override (OpenAI-compatible endpoints only).
    #[serde(default)]
    pub base_url: Option<String>,
    pub default_model: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    /// Per-provider override of the orchestrator's default chunk size
    /// (spec.md §6.3's `max_chars`). `None` means use the configured
    /// default.
    #[serde(default)]
    pub max_chars: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    providers: HashMap<String, ProviderEntry>,
    #[serde(default)]
    aliases: HashMap<String, String>,
}

/// The default registry embedded in the binary. Overridable by a
/// `providers.json` file in the configured data directory.
const DEFAULT_REGISTRY_JSON: &str = include_str!("default_registry.json");

pub struct ProviderRegistry {
    providers: HashMap<String, ProviderEntry>,
    aliases: HashMap<String, String>,
}

/// A parsed `provider:model` spec, e.g. `oai:gpt-4.1` or `ds:deepseek-chat`.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub provider_key: String,
    pub model: String,
}

impl ProviderRegistry {
    /// Load the registry from `path` if it exists, falling back to the
    /// embedded default otherwise.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let raw = match path {
            Some(path) if path.exists() => {
                std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?
            }
            _ => DEFAULT_REGISTRY_JSON.to_string(),
        };

        let file: RegistryFile = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.map(|p| p.display().to_string()).unwrap_or_else(|| "<embedded>".into()),
            source: toml::de::Error::custom(e.to_string()),
        })?;

        Ok(Self {
            providers: file.providers,
            aliases: file.aliases,
        })
    }

    /// Resolve an alias to its canonical provider key, or return the input
    /// unchanged if it isn't an alias.
    fn resolve_key<'a>(&'a self, key: &'a str) -> &'a str {
        self.aliases.get(key).map(String::as_str).unwrap_or(key)
    }

    /// Parse `"provider:model"`, e.g. `"oai:gpt-4.1"`. If no `:model` suffix
    /// is given, the provider's `default_model` is used, matching
    /// `config.py::parse_model_spec`.
    pub fn parse_spec(&self, spec: &str) -> Result<ProviderSpec, ConfigError> {
        let (key, model) = match spec.split_once(':') {
            Some((key, model)) => (key, Some(model.to_string())),
            None => (spec, None),
        };

        let provider_key = self.resolve_key(key).to_string();
        let entry = self
            .providers
            .get(&provider_key)
            .ok_or_else(|| ConfigError::InvalidProviderSpec(spec.to_string()))?;

        Ok(ProviderSpec {
            provider_key,
            model: model.unwrap_or_else(|| entry.default_model.clone()),
        })
    }

    /// Maximum source characters per chunk for this provider: the
    /// registry's per-provider override if set, else `default_max_chars`.
    pub fn max_chars_for(&self, provider_key: &str, default_max_chars: u32) -> u32 {
        self.providers
            .get(provider_key)
            .and_then(|entry| entry.max_chars)
            .unwrap_or(default_max_chars)
    }

    /// Build a live `ChatProvider` for the given spec.
    pub fn build(
        &self,
        spec: &ProviderSpec,
        http_client: reqwest::Client,
    ) -> Result<Arc<dyn ChatProvider>, ConfigError> {
        let entry = self
            .providers
            .get(&spec.provider_key)
            .ok_or_else(|| ConfigError::UnknownProvider(spec.provider_key.clone()))?;

        let api_key = std::env::var(&entry.api_key_env).map_err(|_| {
            ConfigError::MissingApiKey(entry.api_key_env.clone(), spec.provider_key.clone())
        })?;

        let provider: Arc<dyn ChatProvider> = match entry.class.as_str() {
            "openai" => {
                let base_url = entry
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
                Arc::new(OpenAiProvider::new(http_client, base_url, api_key))
            }
            "anthropic" => {
                let base_url = entry
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string());
                Arc::new(AnthropicProvider::new(
                    http_client,
                    base_url,
                    api_key,
                    entry.max_output_tokens.unwrap_or(8192),
                ))
            }
            "gemini" => {
                let base_url = entry
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());
                Arc::new(GeminiProvider::new(http_client, base_url, api_key, entry.max_output_tokens))
            }
            other => return Err(ConfigError::InvalidProviderSpec(other.to_string())),
        };

        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_spec_resolves_alias_and_default_model() {
        let registry = ProviderRegistry::load(None).unwrap();
        let spec = registry.parse_spec("oai").unwrap();
        assert_eq!(spec.provider_key, "openai");
        assert!(!spec.model.is_empty());
    }

    #[test]
    fn parse_spec_overrides_model_when_given() {
        let registry = ProviderRegistry::load(None).unwrap();
        let spec = registry.parse_spec("ds:deepseek-reasoner").unwrap();
        assert_eq!(spec.provider_key, "deepseek");
        assert_eq!(spec.model, "deepseek-reasoner");
    }

    #[test]
    fn parse_spec_rejects_unknown_provider() {
        let registry = ProviderRegistry::load(None).unwrap();
        assert!(registry.parse_spec("not-a-provider:foo").is_err());
    }
}
