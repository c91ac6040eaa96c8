use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::ids::{ModelId, ProviderId};
use crate::models::provider::{Message, TokenUsage};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
}

/// Optional workspace context attached by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub files: Vec<ContextFile>,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl RequestContext {
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(ContextFile {
            path: path.into(),
            content: content.into(),
        });
        self
    }
}

/// Provider-agnostic completion request. Built once and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    id: String,
    messages: Vec<Message>,
    model: Option<ModelId>,
    temperature: f32,
    max_tokens: u32,
    context: Option<RequestContext>,
    stream: bool,
    ensemble: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages,
            model: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            context: None,
            stream: false,
            ensemble: false,
        }
    }

    pub fn with_model(mut self, model: ModelId) -> Self {
        self.model = Some(model);
        self
    }

    /// Pin a model by name; unknown names fail with `UnsupportedModel`.
    pub fn with_model_name(self, name: &str) -> Result<Self> {
        Ok(self.with_model(ModelId::parse(name)?))
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Opt in to running every enabled provider and keeping the best answer.
    pub fn with_ensemble(mut self) -> Self {
        self.ensemble = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn model(&self) -> Option<ModelId> {
        self.model
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn context(&self) -> Option<&RequestContext> {
        self.context.as_ref()
    }

    pub fn has_context_files(&self) -> bool {
        self.context.as_ref().is_some_and(|c| !c.files.is_empty())
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn is_ensemble(&self) -> bool {
        self.ensemble
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub provider: ProviderId,
    pub model: ModelId,
    pub score: u32,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMetadata {
    pub candidate_count: usize,
    pub candidates: Vec<CandidateScore>,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: ModelId,
    pub provider: ProviderId,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub cached: bool,
    pub finish_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ensemble: Option<EnsembleMetadata>,
}
