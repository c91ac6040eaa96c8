use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// One provider's failure inside an ensemble call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub message: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.message)
    }
}

fn join_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Provider not initialized: {provider}")]
    ProviderNotInitialized { provider: String },

    #[error("Rate limit exceeded for provider: {provider}")]
    RateLimitExceeded { provider: String },

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Provider call failed ({provider}): {message}")]
    ProviderCallFailed { provider: String, message: String },

    #[error("All providers failed: {}", join_failures(.failures))]
    AllProvidersFailed { failures: Vec<ProviderFailure> },

    #[error("Malformed response from {provider}: {message}")]
    MalformedUpstreamResponse { provider: String, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Secure storage error: {0}")]
    SecureStorage(#[from] keyring::Error),
}

impl Error {
    pub fn provider_not_initialized(provider: impl Into<String>) -> Self {
        Error::ProviderNotInitialized {
            provider: provider.into(),
        }
    }

    pub fn rate_limited(provider: impl Into<String>) -> Self {
        Error::RateLimitExceeded {
            provider: provider.into(),
        }
    }

    pub fn provider_call(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::ProviderCallFailed {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn malformed(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::MalformedUpstreamResponse {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Failures local to a single backend. The ensemble path absorbs these
    /// as long as some other provider succeeds.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            Error::RateLimitExceeded { .. }
                | Error::ProviderCallFailed { .. }
                | Error::MalformedUpstreamResponse { .. }
                | Error::ProviderNotInitialized { .. }
                | Error::Http(_)
        )
    }
}
