use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::app::config::{AppConfig, ProviderConfig};
use crate::error::{Error, Result};
use crate::models::anthropic::AnthropicProvider;
use crate::models::gemini::GeminiProvider;
use crate::models::ids::{ModelId, ProviderId};
use crate::models::openai::OpenAIProvider;
use crate::models::provider::{ModelProvider, RateLimits};
use crate::platform::CredentialSource;

/// Snapshot of one provider's registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub name: &'static str,
    pub models: Vec<ModelId>,
    pub enabled: bool,
    pub rate_limits: RateLimits,
    pub default_model: ModelId,
}

struct ProviderEntry {
    id: ProviderId,
    models: Vec<ModelId>,
    rate_limits: RateLimits,
    default_model: ModelId,
    enabled: AtomicBool,
    adapter: Option<Arc<dyn ModelProvider>>,
}

impl ProviderEntry {
    fn is_enabled(&self) -> bool {
        self.adapter.is_some() && self.enabled.load(Ordering::Acquire)
    }

    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: self.id,
            name: self.id.display_name(),
            models: self.models.clone(),
            enabled: self.is_enabled(),
            rate_limits: self.rate_limits,
            default_model: self.default_model,
        }
    }
}

/// Known providers, their models and adapters. The set of providers is fixed
/// after construction; only the enabled flag can change.
pub struct ProviderRegistry {
    entries: BTreeMap<ProviderId, ProviderEntry>,
    model_table: BTreeMap<ModelId, ProviderId>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.list_all())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build adapters for every provider that is enabled in config and has a credential.
    pub async fn from_config(config: &AppConfig, credentials: &dyn CredentialSource) -> Result<Self> {
        let mut builder = Self::builder();

        for provider in ProviderId::iter() {
            let Some(provider_config) = config.provider(provider) else {
                debug!("No configuration for {}, skipping", provider);
                continue;
            };

            if !provider_config.enabled {
                info!("Provider {} disabled in configuration", provider);
                builder = builder.register_disabled(provider, provider_config.rate_limits, provider_config.default_model);
                continue;
            }

            match credentials.api_key(provider).await? {
                Some(api_key) => {
                    let adapter = build_adapter(provider, provider_config, api_key)?;
                    builder = builder.register(adapter, provider_config.rate_limits, provider_config.default_model);
                }
                None => {
                    warn!("No API key found for {}, provider disabled", provider);
                    builder = builder.register_disabled(provider, provider_config.rate_limits, provider_config.default_model);
                }
            }
        }

        let registry = builder.build();
        info!(
            "Provider registry ready: {} of {} providers enabled",
            registry.list_enabled().len(),
            registry.entries.len()
        );
        Ok(registry)
    }

    pub fn list_enabled(&self) -> Vec<ProviderDescriptor> {
        self.entries
            .values()
            .filter(|entry| entry.is_enabled())
            .map(ProviderEntry::descriptor)
            .collect()
    }

    pub fn list_all(&self) -> Vec<ProviderDescriptor> {
        self.entries.values().map(ProviderEntry::descriptor).collect()
    }

    pub fn get(&self, id: ProviderId) -> Result<ProviderDescriptor> {
        self.entries
            .get(&id)
            .map(ProviderEntry::descriptor)
            .ok_or_else(|| Error::ProviderNotFound(id.to_string()))
    }

    /// Resolve the provider serving `model` and its adapter.
    pub fn provider_for(&self, model: ModelId) -> Result<(ProviderId, Arc<dyn ModelProvider>)> {
        let provider = self
            .model_table
            .get(&model)
            .copied()
            .ok_or_else(|| Error::UnsupportedModel(model.to_string()))?;

        self.adapter(provider).map(|adapter| (provider, adapter))
    }

    /// Adapter for an enabled provider.
    pub fn adapter(&self, provider: ProviderId) -> Result<Arc<dyn ModelProvider>> {
        let entry = self
            .entries
            .get(&provider)
            .ok_or_else(|| Error::provider_not_initialized(provider.to_string()))?;

        match &entry.adapter {
            Some(adapter) if entry.is_enabled() => Ok(Arc::clone(adapter)),
            _ => Err(Error::provider_not_initialized(provider.to_string())),
        }
    }

    pub fn set_enabled(&self, id: ProviderId, enabled: bool) -> Result<()> {
        let entry = self
            .entries
            .get(&id)
            .ok_or_else(|| Error::ProviderNotFound(id.to_string()))?;

        if enabled && entry.adapter.is_none() {
            return Err(Error::provider_not_initialized(id.to_string()));
        }

        entry.enabled.store(enabled, Ordering::Release);
        info!("Provider {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn list_available_models(&self) -> BTreeSet<ModelId> {
        self.entries
            .values()
            .filter(|entry| entry.is_enabled())
            .flat_map(|entry| entry.models.iter().copied())
            .collect()
    }
}

fn build_adapter(
    provider: ProviderId,
    config: &ProviderConfig,
    api_key: String,
) -> Result<Arc<dyn ModelProvider>> {
    let endpoint = config.endpoint(provider);
    let timeout = config.timeout();
    debug!("Creating {} adapter for {}", provider, endpoint);

    let adapter: Arc<dyn ModelProvider> = match provider {
        ProviderId::OpenAI => Arc::new(OpenAIProvider::with_base_url(api_key, endpoint, timeout)?),
        ProviderId::Anthropic => Arc::new(AnthropicProvider::with_base_url(api_key, endpoint, timeout)?),
        ProviderId::Gemini => Arc::new(GeminiProvider::with_base_url(api_key, endpoint, timeout)?),
    };
    Ok(adapter)
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<ProviderId, ProviderEntry>,
}

impl RegistryBuilder {
    /// Register an enabled provider backed by `adapter`.
    pub fn register(
        mut self,
        adapter: Arc<dyn ModelProvider>,
        rate_limits: RateLimits,
        default_model: ModelId,
    ) -> Self {
        let id = adapter.provider_id();
        self.entries.insert(
            id,
            ProviderEntry {
                id,
                models: id.models(),
                rate_limits,
                default_model,
                enabled: AtomicBool::new(true),
                adapter: Some(adapter),
            },
        );
        self
    }

    /// Register a provider that is known but cannot serve requests.
    pub fn register_disabled(mut self, id: ProviderId, rate_limits: RateLimits, default_model: ModelId) -> Self {
        self.entries.insert(
            id,
            ProviderEntry {
                id,
                models: id.models(),
                rate_limits,
                default_model,
                enabled: AtomicBool::new(false),
                adapter: None,
            },
        );
        self
    }

    pub fn build(self) -> ProviderRegistry {
        let model_table = self
            .entries
            .values()
            .flat_map(|entry| entry.models.iter().map(move |model| (*model, entry.id)))
            .collect();

        ProviderRegistry {
            entries: self.entries,
            model_table,
        }
    }
}
