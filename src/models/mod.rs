pub mod anthropic;
pub mod cache;
pub mod gemini;
pub mod ids;
pub mod openai;
pub mod provider;
pub mod rate_limiter;
pub mod registry;
pub mod scorer;
pub mod selector;
pub mod sse;

#[cfg(test)]
pub(crate) mod testing;

pub use ids::{ModelId, ProviderId};
pub use provider::{
    ChatRequest, ChatResponse, ChatStream, Message, MessageRole, ModelProvider, RateLimits,
    StreamChunk, TokenUsage,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStatus};
pub use registry::{ProviderDescriptor, ProviderRegistry};
pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;
