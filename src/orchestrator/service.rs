use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::config::AppConfig;
use crate::error::{Error, Result};
use crate::models::cache::{fingerprint, CacheConfig, ResponseCache, ENSEMBLE_KEY};
use crate::models::ids::{ModelId, ProviderId};
use crate::models::provider::{ChatRequest, Message, ModelProvider};
use crate::models::rate_limiter::{Clock, RateLimiter, RateLimiterConfig, RateLimiterStatus};
use crate::models::registry::ProviderRegistry;
use crate::models::selector::{ModelSelector, SelectorConfig};
use crate::orchestrator::ensemble::Ensemble;
use crate::orchestrator::stream::FragmentStream;
use crate::orchestrator::types::{CompletionRequest, CompletionResponse};
use crate::platform::CredentialSource;

/// Tunables for an [`Orchestrator`], usually derived from [`AppConfig`].
#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub rate_limiter: RateLimiterConfig,
    pub cache: CacheConfig,
    pub selector: SelectorConfig,
    pub ensemble_timeout: Option<Duration>,
}

impl OrchestratorSettings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            rate_limiter: config.to_rate_limiter_config(),
            cache: config.to_cache_config(),
            selector: config.selector.clone(),
            ensemble_timeout: config.ensemble_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub id: ProviderId,
    pub name: &'static str,
    pub enabled: bool,
    pub models: Vec<ModelId>,
}

/// Entry point for completions. Built once and shared by reference or `Arc`.
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    rate_limiter: RateLimiter,
    cache: ResponseCache,
    selector: ModelSelector,
    ensemble_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(registry: ProviderRegistry, settings: OrchestratorSettings) -> Self {
        let rate_limiter = RateLimiter::new(settings.rate_limiter.clone());
        Self::assemble(registry, settings, rate_limiter)
    }

    /// Same as [`Orchestrator::new`] with a custom clock for the rate windows.
    pub fn with_clock(
        registry: ProviderRegistry,
        settings: OrchestratorSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rate_limiter = RateLimiter::with_clock(settings.rate_limiter.clone(), clock);
        Self::assemble(registry, settings, rate_limiter)
    }

    pub async fn from_config(config: &AppConfig, credentials: &dyn CredentialSource) -> Result<Self> {
        let registry = ProviderRegistry::from_config(config, credentials).await?;
        Ok(Self::new(registry, OrchestratorSettings::from_app_config(config)))
    }

    fn assemble(registry: ProviderRegistry, settings: OrchestratorSettings, rate_limiter: RateLimiter) -> Self {
        for descriptor in registry.list_all() {
            rate_limiter.add_provider(descriptor.id, &descriptor.rate_limits);
        }

        info!("Orchestrator initialized");
        Self {
            registry: Arc::new(registry),
            rate_limiter,
            cache: ResponseCache::new(settings.cache),
            selector: ModelSelector::new(settings.selector),
            ensemble_timeout: settings.ensemble_timeout,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.run(&request).await
    }

    /// Like [`Orchestrator::complete`], but gives up as soon as `token` fires.
    /// Rate-limit slots already taken stay taken and nothing is cached.
    pub async fn complete_with_cancel(
        &self,
        request: CompletionRequest,
        token: CancellationToken,
    ) -> Result<CompletionResponse> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Request {} cancelled", request.id());
                Err(Error::Cancelled)
            }
            result = self.run(&request) => result,
        }
    }

    async fn run(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        if request.is_ensemble() {
            return self.run_ensemble(request).await;
        }

        let model = self.resolve_model(request);
        let key = fingerprint(&model.to_string(), request);
        if let Some(hit) = self.cache.lookup(&key) {
            debug!("Serving request {} from cache", request.id());
            return Ok(hit);
        }

        let (provider, adapter) = self.registry.provider_for(model)?;
        let response = dispatch(&self.rate_limiter, provider, adapter.as_ref(), model, request).await?;

        self.cache.store(key, response.clone());
        Ok(response)
    }

    async fn run_ensemble(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let key = fingerprint(ENSEMBLE_KEY, request);
        if let Some(hit) = self.cache.lookup(&key) {
            debug!("Serving ensemble request {} from cache", request.id());
            return Ok(hit);
        }

        let response = Ensemble::new(&self.registry, &self.rate_limiter)
            .with_timeout(self.ensemble_timeout)
            .run(request)
            .await?;

        self.cache.store(key, response.clone());
        Ok(response)
    }

    fn resolve_model(&self, request: &CompletionRequest) -> ModelId {
        request.model().unwrap_or_else(|| self.selector.select(request))
    }

    /// Stream a single-provider completion. Setup failures come back as the
    /// stream's only item. Streams bypass the cache and the ensemble path.
    pub async fn stream(&self, request: CompletionRequest) -> FragmentStream {
        match self.open_stream(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Could not open stream for request {}: {}", request.id(), e);
                FragmentStream::failed(e)
            }
        }
    }

    /// Like [`Orchestrator::stream`], but stops as soon as `token` fires, during
    /// setup or between fragments. The stream then ends with `Cancelled`.
    pub async fn stream_with_cancel(&self, request: CompletionRequest, token: CancellationToken) -> FragmentStream {
        let id = request.id().to_string();
        let stream = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Stream for request {} cancelled during setup", id);
                FragmentStream::failed(Error::Cancelled)
            }
            stream = self.stream(request) => stream,
        };
        stream.with_cancellation(token)
    }

    async fn open_stream(&self, request: &CompletionRequest) -> Result<FragmentStream> {
        let model = self.resolve_model(request);
        let (provider, adapter) = self.registry.provider_for(model)?;
        self.check_rate_limit(provider)?;

        debug!("Opening {} stream with {}", provider, model);
        let inner = adapter.stream_message(&chat_request(model, request)).await?;
        Ok(FragmentStream::new(provider, model, inner))
    }

    pub fn check_rate_limit(&self, provider: ProviderId) -> Result<()> {
        check_rate_limit(&self.rate_limiter, provider)
    }

    pub fn list_available_models(&self) -> BTreeSet<ModelId> {
        self.registry.list_available_models()
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.registry
            .list_all()
            .into_iter()
            .map(|descriptor| ProviderStatus {
                id: descriptor.id,
                name: descriptor.name,
                enabled: descriptor.enabled,
                models: descriptor.models,
            })
            .collect()
    }

    pub fn rate_limit_status(&self) -> Vec<RateLimiterStatus> {
        self.rate_limiter.get_all_status()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

fn check_rate_limit(rate_limiter: &RateLimiter, provider: ProviderId) -> Result<()> {
    if rate_limiter.check_and_consume(provider) {
        Ok(())
    } else {
        Err(Error::rate_limited(provider.to_string()))
    }
}

/// Attached files go to the backend as a leading system message.
fn chat_request(model: ModelId, request: &CompletionRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages().len() + 1);
    if let Some(context) = request.context().filter(|c| !c.files.is_empty()) {
        let mut text = String::from("Relevant files:\n");
        for file in &context.files {
            text.push_str(&format!("\n--- {} ---\n{}\n", file.path, file.content));
        }
        messages.push(Message::system(text));
    }
    messages.extend_from_slice(request.messages());

    ChatRequest::new(model, messages)
        .with_temperature(request.temperature())
        .with_max_tokens(request.max_tokens())
}

/// One rate-checked backend call, normalized. Does not touch the cache.
pub(crate) async fn dispatch(
    rate_limiter: &RateLimiter,
    provider: ProviderId,
    adapter: &dyn ModelProvider,
    model: ModelId,
    request: &CompletionRequest,
) -> Result<CompletionResponse> {
    check_rate_limit(rate_limiter, provider)?;

    debug!("Dispatching request {} to {} ({})", request.id(), provider, model);
    let started = Instant::now();
    let response = adapter.send_message(&chat_request(model, request)).await?;
    let duration_ms = started.elapsed().as_millis() as u64;

    if let Some(reported) = response.reported_model.as_deref() {
        debug!("{} reported model {}", provider, reported);
    }

    Ok(CompletionResponse {
        content: response.content,
        model,
        provider,
        usage: response.usage,
        duration_ms,
        cached: false,
        finish_reason: response.finish_reason,
        created_at: Utc::now(),
        ensemble: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider::RateLimits;
    use crate::models::rate_limiter::ManualClock;
    use crate::models::testing::ScriptedProvider;
    use crate::orchestrator::types::RequestContext;
    use futures_util::StreamExt;

    fn add_numbers() -> CompletionRequest {
        CompletionRequest::new(vec![Message::user("write a function that adds two numbers")])
    }

    fn single(provider: Arc<ScriptedProvider>, limits: RateLimits, default_model: ModelId) -> Orchestrator {
        let registry = ProviderRegistry::builder()
            .register(provider, limits, default_model)
            .build();
        Orchestrator::new(registry, OrchestratorSettings::default())
    }

    #[tokio::test]
    async fn test_gpt4o_twice_hits_cache() {
        let openai = Arc::new(ScriptedProvider::replying(ProviderId::OpenAI, "function add(a, b) { return a + b }"));
        let orchestrator = single(openai.clone(), RateLimits::default(), ModelId::Gpt4o);

        let first = orchestrator
            .complete(add_numbers().with_model(ModelId::Gpt4o))
            .await
            .unwrap();
        assert!(!first.cached);
        assert_eq!(first.model, ModelId::Gpt4o);

        let second = orchestrator
            .complete(add_numbers().with_model(ModelId::Gpt4o))
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.content, first.content);
        assert_eq!(second.usage, first.usage);
        assert_eq!(second.duration_ms, first.duration_ms);

        assert_eq!(openai.calls(), 1);
        assert_eq!(orchestrator.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_selector_routes_unpinned_requests() {
        let anthropic = Arc::new(ScriptedProvider::replying(ProviderId::Anthropic, "reviewed"));
        let orchestrator = single(anthropic.clone(), RateLimits::default(), ModelId::Claude35Sonnet);

        let request = add_numbers()
            .with_context(RequestContext::default().with_file("src/math.rs", "pub fn add() {}"));
        let response = orchestrator.complete(request).await.unwrap();
        assert_eq!(response.model, ModelId::Claude35Sonnet);
        assert_eq!(response.provider, ProviderId::Anthropic);

        // Default route is gpt-4o-mini, whose provider is not registered here
        assert!(matches!(
            orchestrator.complete(add_numbers()).await,
            Err(Error::UnsupportedModel(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_denies_then_recovers() {
        let clock = Arc::new(ManualClock::new());
        let registry = ProviderRegistry::builder()
            .register(
                Arc::new(ScriptedProvider::replying(ProviderId::OpenAI, "ok")),
                RateLimits { requests_per_minute: 2, tokens_per_minute: 1000 },
                ModelId::Gpt4o,
            )
            .build();
        let orchestrator = Orchestrator::with_clock(registry, OrchestratorSettings::default(), clock.clone());

        // Distinct prompts so the cache does not absorb the calls
        for prompt in ["a", "b"] {
            let request = CompletionRequest::new(vec![Message::user(prompt)]).with_model(ModelId::Gpt4o);
            assert!(orchestrator.complete(request).await.is_ok());
        }

        let third = CompletionRequest::new(vec![Message::user("c")]).with_model(ModelId::Gpt4o);
        assert!(matches!(
            orchestrator.complete(third.clone()).await,
            Err(Error::RateLimitExceeded { .. })
        ));

        clock.advance(Duration::from_secs(61));
        assert!(orchestrator.complete(third).await.is_ok());

        let status = orchestrator.rate_limit_status();
        assert_eq!(status[0].count, 1);
    }

    #[tokio::test]
    async fn test_failed_call_is_not_cached() {
        let openai = Arc::new(ScriptedProvider::failing(ProviderId::OpenAI, "API error 503"));
        let orchestrator = single(openai.clone(), RateLimits::default(), ModelId::Gpt4o);

        for _ in 0..2 {
            assert!(matches!(
                orchestrator.complete(add_numbers().with_model(ModelId::Gpt4o)).await,
                Err(Error::ProviderCallFailed { .. })
            ));
        }
        assert_eq!(openai.calls(), 2);
        assert_eq!(orchestrator.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_ensemble_result_is_cached() {
        let openai = Arc::new(ScriptedProvider::replying(ProviderId::OpenAI, "one"));
        let gemini = Arc::new(ScriptedProvider::failing(ProviderId::Gemini, "quota"));
        let registry = ProviderRegistry::builder()
            .register(openai.clone(), RateLimits::default(), ModelId::Gpt4o)
            .register(gemini.clone(), RateLimits::default(), ModelId::Gemini15Flash)
            .build();
        let orchestrator = Orchestrator::new(registry, OrchestratorSettings::default());

        let first = orchestrator.complete(add_numbers().with_ensemble()).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.ensemble.as_ref().unwrap().candidate_count, 1);

        let second = orchestrator.complete(add_numbers().with_ensemble()).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.ensemble, first.ensemble);
        assert_eq!(openai.calls(), 1);
        assert_eq!(gemini.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_returns_promptly_without_caching() {
        let slow = Arc::new(
            ScriptedProvider::replying(ProviderId::OpenAI, "late").with_delay(Duration::from_secs(30)),
        );
        let orchestrator = single(slow.clone(), RateLimits::default(), ModelId::Gpt4o);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = orchestrator
            .complete_with_cancel(add_numbers().with_model(ModelId::Gpt4o), token)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(orchestrator.cache_len(), 0);
        assert_eq!(orchestrator.rate_limit_status()[0].count, 1);
    }

    #[tokio::test]
    async fn test_stream_fragments() {
        let openai = Arc::new(ScriptedProvider::streaming(ProviderId::OpenAI, &["func", "", "tion add"]));
        let orchestrator = single(openai, RateLimits::default(), ModelId::Gpt4o);

        let stream = orchestrator
            .stream(add_numbers().with_model(ModelId::Gpt4oMini).with_streaming())
            .await;
        assert_eq!(stream.provider(), Some(ProviderId::OpenAI));

        let fragments: Vec<String> = stream.into_stream().map(|f| f.unwrap()).collect().await;
        assert!(fragments.iter().all(|f| !f.is_empty()));
        assert_eq!(fragments.concat(), "function add");
        assert_eq!(orchestrator.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_stream_setup_failure_is_first_item() {
        let openai = Arc::new(ScriptedProvider::streaming(ProviderId::OpenAI, &["x"]));
        let orchestrator = single(openai, RateLimits::default(), ModelId::Gpt4o);

        let mut stream = orchestrator
            .stream(add_numbers().with_model(ModelId::Gemini15Pro))
            .await;
        assert!(matches!(stream.next_fragment().await, Some(Err(Error::UnsupportedModel(_)))));
        assert!(stream.next_fragment().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_cancelled_between_fragments() {
        let openai = Arc::new(ScriptedProvider::streaming(ProviderId::OpenAI, &["fn ", "add", "()"]));
        let orchestrator = single(openai, RateLimits::default(), ModelId::Gpt4o);
        let token = CancellationToken::new();

        let mut stream = orchestrator
            .stream_with_cancel(add_numbers().with_model(ModelId::Gpt4o).with_streaming(), token.clone())
            .await;
        assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "fn ");

        token.cancel();
        assert!(matches!(stream.next_fragment().await, Some(Err(Error::Cancelled))));
        assert!(stream.next_fragment().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_cancelled_during_setup() {
        let slow = Arc::new(
            ScriptedProvider::streaming(ProviderId::OpenAI, &["late"]).with_delay(Duration::from_secs(30)),
        );
        let orchestrator = single(slow, RateLimits::default(), ModelId::Gpt4o);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let mut stream = orchestrator
            .stream_with_cancel(add_numbers().with_model(ModelId::Gpt4o).with_streaming(), token)
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(stream.provider().is_none());
        assert!(matches!(stream.next_fragment().await, Some(Err(Error::Cancelled))));
        assert!(stream.next_fragment().await.is_none());
    }

    #[tokio::test]
    async fn test_status_reporting() {
        let registry = ProviderRegistry::builder()
            .register(
                Arc::new(ScriptedProvider::replying(ProviderId::Gemini, "hi")),
                RateLimits::default(),
                ModelId::Gemini15Flash,
            )
            .register_disabled(ProviderId::OpenAI, RateLimits::default(), ModelId::Gpt4o)
            .build();
        let orchestrator = Orchestrator::new(registry, OrchestratorSettings::default());

        let status = orchestrator.provider_status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].id, ProviderId::OpenAI);
        assert!(!status[0].enabled);
        assert!(status[1].enabled);
        assert!(status[1].models.contains(&ModelId::Gemini20Flash));

        let models = orchestrator.list_available_models();
        assert!(models.iter().all(|m| m.provider() == ProviderId::Gemini));
    }

    #[test]
    fn test_context_files_become_system_message() {
        let request = add_numbers()
            .with_context(RequestContext::default().with_file("lib.rs", "pub fn a() {}"));
        let chat = chat_request(ModelId::Gpt4o, &request);
        assert_eq!(chat.messages.len(), 2);
        assert!(chat.messages[0].content.contains("--- lib.rs ---"));
        assert_eq!(chat.messages[1], request.messages()[0]);
        assert_eq!(chat.temperature, 0.7);
    }
}
