//! Provider factories, pluggable by string id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::Provider;
use crate::error::{Error, Result};

/// Whether a model config drives streaming or non-streaming calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Use [`Provider::stream`].
    #[default]
    Streaming,
    /// Use [`Provider::complete`].
    NonStreaming,
}

/// Configuration handed to a provider factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Factory id (`"anthropic"`, `"openai"`, ...).
    pub provider_id: String,
    /// Model name.
    pub model: String,
    /// API key. When absent, resolved from `<PROVIDER>_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Streaming or non-streaming execution.
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

impl ModelConfig {
    /// Create a config for a provider/model pair.
    #[must_use]
    pub fn new(provider_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
            api_key: None,
            base_url: None,
            execution_mode: ExecutionMode::default(),
        }
    }

    /// The environment variable holding this provider's API key.
    #[must_use]
    pub fn api_key_env_var(&self) -> String {
        let prefix: String = self
            .provider_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{prefix}_API_KEY")
    }

    /// Resolve the API key: explicit config first, environment second.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(self.api_key_env_var()).ok())
    }
}

/// Creates providers from model configs. Implementations are registered
/// by string id.
pub trait ProviderFactory: Send + Sync {
    /// The id this factory is registered under.
    fn id(&self) -> &str;

    /// Build a provider for the given config.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed configs (missing key,
    /// unsupported execution mode, ...).
    fn create(&self, config: &ModelConfig) -> Result<Arc<dyn Provider>>;
}

/// Registry of provider factories, injected into agents. Read-mostly.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ProviderFactory>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self
            .factories
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ProviderRegistry").field("ids", &ids).finish()
    }
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one with the same id.
    pub fn register(&self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .write()
            .expect("provider registry poisoned")
            .insert(factory.id().to_string(), factory);
    }

    /// Build a provider for `config`.
    ///
    /// # Errors
    ///
    /// Returns a validation error when no factory is registered under
    /// `config.provider_id`, or whatever the factory itself reports.
    pub fn create(&self, config: &ModelConfig) -> Result<Arc<dyn Provider>> {
        let factory = self
            .factories
            .read()
            .expect("provider registry poisoned")
            .get(&config.provider_id)
            .cloned()
            .ok_or_else(|| {
                Error::validation(format!("unknown provider '{}'", config.provider_id))
            })?;
        factory.create(config)
    }

    /// Registered factory ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.factories
            .read()
            .expect("provider registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
