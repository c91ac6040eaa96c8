use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// The backends this crate knows how to talk to.
///
/// `Display`/`FromStr` are used on the CLI and as config keys and should stay stable.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderId {
    OpenAI,
    Anthropic,
    Gemini,
}

impl ProviderId {
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::OpenAI => "OpenAI",
            ProviderId::Anthropic => "Anthropic",
            ProviderId::Gemini => "Google Gemini",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            ProviderId::OpenAI => "OPENAI_API_KEY",
            ProviderId::Anthropic => "ANTHROPIC_API_KEY",
            ProviderId::Gemini => "GEMINI_API_KEY",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderId::OpenAI => "https://api.openai.com",
            ProviderId::Anthropic => "https://api.anthropic.com",
            ProviderId::Gemini => "https://generativelanguage.googleapis.com",
        }
    }

    /// Every model served by this provider, in catalog order.
    pub fn models(&self) -> Vec<ModelId> {
        ModelId::iter().filter(|m| m.provider() == *self).collect()
    }
}

/// Closed set of model identifiers. The `Display` form is the name callers use;
/// the wire name is what the provider's API expects.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum ModelId {
    #[serde(rename = "gpt-4o")]
    #[strum(to_string = "gpt-4o")]
    Gpt4o,
    #[serde(rename = "gpt-4o-mini")]
    #[strum(to_string = "gpt-4o-mini")]
    Gpt4oMini,
    #[serde(rename = "claude-3.5-sonnet")]
    #[strum(to_string = "claude-3.5-sonnet", serialize = "claude-3-5-sonnet-20241022")]
    Claude35Sonnet,
    #[serde(rename = "claude-3.5-haiku")]
    #[strum(to_string = "claude-3.5-haiku", serialize = "claude-3-5-haiku-20241022")]
    Claude35Haiku,
    #[serde(rename = "gemini-1.5-pro")]
    #[strum(to_string = "gemini-1.5-pro")]
    Gemini15Pro,
    #[serde(rename = "gemini-1.5-flash")]
    #[strum(to_string = "gemini-1.5-flash")]
    Gemini15Flash,
    #[serde(rename = "gemini-2.0-flash")]
    #[strum(to_string = "gemini-2.0-flash", serialize = "gemini-2.0-flash-exp")]
    Gemini20Flash,
}

impl ModelId {
    pub fn provider(&self) -> ProviderId {
        match self {
            ModelId::Gpt4o | ModelId::Gpt4oMini => ProviderId::OpenAI,
            ModelId::Claude35Sonnet | ModelId::Claude35Haiku => ProviderId::Anthropic,
            ModelId::Gemini15Pro | ModelId::Gemini15Flash | ModelId::Gemini20Flash => {
                ProviderId::Gemini
            }
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            ModelId::Gpt4o => "gpt-4o",
            ModelId::Gpt4oMini => "gpt-4o-mini",
            ModelId::Claude35Sonnet => "claude-3-5-sonnet-20241022",
            ModelId::Claude35Haiku => "claude-3-5-haiku-20241022",
            ModelId::Gemini15Pro => "gemini-1.5-pro",
            ModelId::Gemini15Flash => "gemini-1.5-flash",
            ModelId::Gemini20Flash => "gemini-2.0-flash-exp",
        }
    }

    /// Parse a caller-supplied model name, accepting either the public or the wire name.
    pub fn parse(name: &str) -> crate::error::Result<Self> {
        name.trim()
            .parse()
            .map_err(|_| crate::error::Error::UnsupportedModel(name.to_string()))
    }
}
