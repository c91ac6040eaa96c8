use std::collections::HashMap;

use async_trait::async_trait;
use keyring::Entry;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::ids::ProviderId;

const KEYRING_SERVICE: &str = "ai.conductor.api_keys";

/// Where provider API keys come from. A missing key is `Ok(None)`, not an error.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn api_key(&self, provider: ProviderId) -> Result<Option<String>>;
}

/// Reads keys from environment variables, one per provider.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    variables: HashMap<ProviderId, String>,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `variable` instead of the provider's conventional name.
    pub fn with_variable(mut self, provider: ProviderId, variable: impl Into<String>) -> Self {
        self.variables.insert(provider, variable.into());
        self
    }

    fn variable_for(&self, provider: ProviderId) -> &str {
        self.variables
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_else(|| provider.default_api_key_env())
    }
}

#[async_trait]
impl CredentialSource for EnvCredentials {
    async fn api_key(&self, provider: ProviderId) -> Result<Option<String>> {
        let variable = self.variable_for(provider);
        match std::env::var(variable) {
            Ok(value) if !value.trim().is_empty() => {
                debug!("Found API key for {} in ${}", provider, variable);
                Ok(Some(value.trim().to_string()))
            }
            _ => Ok(None),
        }
    }
}

/// OS keychain storage for API keys.
#[derive(Debug, Clone)]
pub struct KeyringCredentials {
    service: String,
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }
}

impl KeyringCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, provider: ProviderId, key: &str) -> Result<()> {
        debug!("Storing API key for provider: {}", provider);
        let entry = Entry::new(&self.service, &provider.to_string())?;
        entry.set_password(key)?;
        Ok(())
    }

    pub fn delete(&self, provider: ProviderId) -> Result<()> {
        debug!("Deleting API key for provider: {}", provider);
        let entry = Entry::new(&self.service, &provider.to_string())?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(Error::SecureStorage(e)),
        }
    }
}

#[async_trait]
impl CredentialSource for KeyringCredentials {
    async fn api_key(&self, provider: ProviderId) -> Result<Option<String>> {
        let entry = Entry::new(&self.service, &provider.to_string())?;
        match entry.get_password() {
            Ok(password) if !password.is_empty() => Ok(Some(password)),
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::SecureStorage(e)),
        }
    }
}

/// Tries each source in order and returns the first key found. A failing
/// source is logged and skipped so one broken keychain does not disable startup.
pub struct ChainedCredentials {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl ChainedCredentials {
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl CredentialSource for ChainedCredentials {
    async fn api_key(&self, provider: ProviderId) -> Result<Option<String>> {
        for source in &self.sources {
            match source.api_key(provider).await {
                Ok(Some(key)) => return Ok(Some(key)),
                Ok(None) => continue,
                Err(e) => warn!("Credential lookup for {} failed: {}", provider, e),
            }
        }
        Ok(None)
    }
}

/// Fixed keys, for embedding callers that resolve credentials themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<ProviderId, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: ProviderId, key: impl Into<String>) -> Self {
        self.keys.insert(provider, key.into());
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn api_key(&self, provider: ProviderId) -> Result<Option<String>> {
        Ok(self.keys.get(&provider).cloned())
    }
}
