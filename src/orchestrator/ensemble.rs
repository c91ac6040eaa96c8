use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::error::{Error, ProviderFailure, Result};
use crate::models::rate_limiter::RateLimiter;
use crate::models::registry::{ProviderDescriptor, ProviderRegistry};
use crate::models::scorer::{pick_best, score_candidate};
use crate::orchestrator::service::dispatch;
use crate::orchestrator::types::{
    CandidateScore, CompletionRequest, CompletionResponse, EnsembleMetadata,
};

/// Fans one request out to every enabled provider and keeps the best answer.
pub struct Ensemble<'a> {
    registry: &'a ProviderRegistry,
    rate_limiter: &'a RateLimiter,
    timeout: Option<Duration>,
}

impl<'a> Ensemble<'a> {
    pub fn new(registry: &'a ProviderRegistry, rate_limiter: &'a RateLimiter) -> Self {
        Self {
            registry,
            rate_limiter,
            timeout: None,
        }
    }

    /// Bound each candidate call; an overrun counts as that provider's failure.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run every enabled provider concurrently and wait for all of them to settle.
    /// The result is not cached here.
    pub async fn run(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let started = Instant::now();
        let providers = self.registry.list_enabled();
        if providers.is_empty() {
            return Err(Error::provider_not_initialized("any"));
        }

        info!("Running ensemble request {} across {} providers", request.id(), providers.len());

        let outcomes = join_all(providers.iter().map(|descriptor| self.call(descriptor, request))).await;

        let mut candidates = Vec::with_capacity(providers.len());
        let mut failures = Vec::new();
        for (descriptor, outcome) in providers.iter().zip(outcomes) {
            match outcome {
                Ok(response) => candidates.push(score_candidate(response)),
                Err(e) => {
                    if e.is_provider_failure() {
                        warn!("Ensemble candidate {} failed: {}", descriptor.id, e);
                    } else {
                        error!("Ensemble candidate {} failed unexpectedly: {}", descriptor.id, e);
                    }
                    failures.push(ProviderFailure {
                        provider: descriptor.id.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let Some(best) = pick_best(&candidates) else {
            return Err(Error::AllProvidersFailed { failures });
        };

        let metadata = EnsembleMetadata {
            candidate_count: candidates.len(),
            candidates: candidates
                .iter()
                .map(|c| CandidateScore {
                    provider: c.response.provider,
                    model: c.response.model,
                    score: c.score,
                    rationale: c.rationale.clone(),
                })
                .collect(),
            total_duration_ms: started.elapsed().as_millis() as u64,
        };

        let winner = candidates.swap_remove(best);
        debug!(
            "Ensemble winner: {} ({}) with score {}",
            winner.response.provider, winner.response.model, winner.score
        );

        let mut response = winner.response;
        response.ensemble = Some(metadata);
        Ok(response)
    }

    async fn call(
        &self,
        descriptor: &ProviderDescriptor,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let adapter = self.registry.adapter(descriptor.id)?;
        let call = dispatch(
            self.rate_limiter,
            descriptor.id,
            adapter.as_ref(),
            descriptor.default_model,
            request,
        );

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call).await.map_err(|_| {
                Error::provider_call(
                    descriptor.id.to_string(),
                    format!("No response within {}ms", timeout.as_millis()),
                )
            })?,
            None => call.await,
        }
    }
}
