use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::ids::ModelId;
use crate::orchestrator::types::CompletionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionReason {
    ContextFiles,
    SmallOutputBudget,
    LongMessage,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Requests with attached files; the strongest code model.
    pub code_model: ModelId,
    /// Small output budgets; the cheapest, fastest model.
    pub fast_model: ModelId,
    /// Very long prompts; the largest context window.
    pub long_context_model: ModelId,
    pub default_model: ModelId,
    pub small_output_tokens: u32,
    pub long_message_chars: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            code_model: ModelId::Claude35Sonnet,
            fast_model: ModelId::Gemini15Flash,
            long_context_model: ModelId::Gemini15Pro,
            default_model: ModelId::Gpt4oMini,
            small_output_tokens: 1000,
            long_message_chars: 2000,
        }
    }
}

/// Picks a model for requests that do not pin one. Pure: same request, same answer.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    config: SelectorConfig,
}

impl ModelSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn select(&self, request: &CompletionRequest) -> ModelId {
        let (model, reason) = self.select_with_reason(request);
        debug!("Selected {} for request {} ({:?})", model, request.id(), reason);
        model
    }

    pub fn select_with_reason(&self, request: &CompletionRequest) -> (ModelId, SelectionReason) {
        if request.has_context_files() {
            return (self.config.code_model, SelectionReason::ContextFiles);
        }

        if request.max_tokens() < self.config.small_output_tokens {
            return (self.config.fast_model, SelectionReason::SmallOutputBudget);
        }

        let long_message = request
            .messages()
            .iter()
            .any(|m| m.content.chars().count() > self.config.long_message_chars);
        if long_message {
            return (self.config.long_context_model, SelectionReason::LongMessage);
        }

        (self.config.default_model, SelectionReason::Default)
    }
}
