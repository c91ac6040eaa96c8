use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::cache::CacheConfig;
use crate::models::ids::{ModelId, ProviderId};
use crate::models::provider::RateLimits;
use crate::models::rate_limiter::RateLimiterConfig;
use crate::models::selector::SelectorConfig;
use crate::platform::EnvCredentials;

const ENV_PREFIX: &str = "CONDUCTOR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub providers: BTreeMap<ProviderId, ProviderConfig>,
    pub rate_limiting: RateLimitingConfig,
    pub cache: CacheSettings,
    pub selector: SelectorConfig,
    pub ensemble: EnsembleSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Model used for this provider's ensemble candidate.
    pub default_model: ModelId,
    #[serde(default)]
    pub api_endpoint: Option<String>,
    /// Environment variable holding the API key; the provider's conventional name if unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub timeout_seconds: u64,
    pub rate_limits: RateLimits,
}

impl ProviderConfig {
    pub fn endpoint(&self, provider: ProviderId) -> String {
        self.api_endpoint
            .clone()
            .unwrap_or_else(|| provider.default_endpoint().to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    #[serde(default)]
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnsembleSettings {
    /// Per-candidate deadline. Unset means each call runs to its own HTTP timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_provider_config(provider: ProviderId) -> ProviderConfig {
    let (default_model, rate_limits) = match provider {
        ProviderId::OpenAI => (
            ModelId::Gpt4o,
            RateLimits { requests_per_minute: 60, tokens_per_minute: 90000 },
        ),
        ProviderId::Anthropic => (
            ModelId::Claude35Sonnet,
            RateLimits { requests_per_minute: 50, tokens_per_minute: 40000 },
        ),
        ProviderId::Gemini => (
            ModelId::Gemini15Flash,
            RateLimits { requests_per_minute: 60, tokens_per_minute: 32000 },
        ),
    };

    ProviderConfig {
        enabled: true,
        default_model,
        api_endpoint: None,
        api_key_env: None,
        timeout_seconds: 60,
        rate_limits,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let providers = ProviderId::iter()
            .map(|provider| (provider, default_provider_config(provider)))
            .collect();

        Self {
            providers,
            rate_limiting: RateLimitingConfig {
                enabled: true,
                window_seconds: 60,
            },
            cache: CacheSettings {
                enabled: true,
                max_entries: None,
            },
            selector: SelectorConfig::default(),
            ensemble: EnsembleSettings::default(),
        }
    }
}

impl AppConfig {
    /// Layer built-in defaults, the TOML file (if present) and `CONDUCTOR__*` env overrides.
    pub fn load(config_file: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", config_file);

        let settings = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(
                File::from(config_file)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, config_file: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", config_file);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(config_file, config_content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (provider, provider_config) in &self.providers {
            if provider_config.default_model.provider() != *provider {
                return Err(Error::validation(format!(
                    "Provider {} has default_model {} which belongs to {}",
                    provider,
                    provider_config.default_model,
                    provider_config.default_model.provider()
                )));
            }
            if let Some(endpoint) = &provider_config.api_endpoint {
                let url = url::Url::parse(endpoint).map_err(|e| {
                    Error::validation(format!("Provider {} has invalid api_endpoint: {}", provider, e))
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(Error::validation(format!(
                        "Provider {} api_endpoint must be http(s)", provider
                    )));
                }
            }
            if provider_config.timeout_seconds == 0 {
                return Err(Error::validation(format!("Provider {} has zero timeout", provider)));
            }
            if provider_config.enabled && provider_config.rate_limits.requests_per_minute == 0 {
                return Err(Error::validation(format!(
                    "Provider {} is enabled with a zero request budget", provider
                )));
            }
        }

        if self.rate_limiting.window_seconds == 0 {
            return Err(Error::validation("Rate limit window must be at least one second"));
        }

        if self.selector.code_model == self.selector.default_model {
            return Err(Error::validation(
                "Selector code_model must differ from default_model",
            ));
        }

        if self.cache.max_entries == Some(0) {
            return Err(Error::validation("Cache max_entries must be positive when set"));
        }

        Ok(())
    }

    pub fn provider(&self, provider: ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(&provider)
    }

    pub fn env_credentials(&self) -> EnvCredentials {
        self.providers
            .iter()
            .filter_map(|(provider, cfg)| cfg.api_key_env.as_ref().map(|var| (*provider, var)))
            .fold(EnvCredentials::new(), |creds, (provider, var)| {
                creds.with_variable(provider, var.clone())
            })
    }

    pub fn to_rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            enable_rate_limiting: self.rate_limiting.enabled,
            window: Duration::from_secs(self.rate_limiting.window_seconds),
        }
    }

    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.cache.enabled,
            max_entries: self.cache.max_entries,
        }
    }

    pub fn ensemble_timeout(&self) -> Option<Duration> {
        self.ensemble.timeout_ms.map(Duration::from_millis)
    }
}
