use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::models::ids::ProviderId;
use crate::models::provider::RateLimits;

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub enable_rate_limiting: bool,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enable_rate_limiting: true,
            window: Duration::from_secs(60),
        }
    }
}

/// Fixed window: `count` requests admitted since the window opened, closing at `reset_at`.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    pub count: u32,
    pub reset_at: Instant,
}

#[derive(Debug)]
struct ProviderBudget {
    requests_per_window: u32,
    window: Option<RateWindow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStatus {
    pub provider: ProviderId,
    pub count: u32,
    pub budget: u32,
    pub resets_in: Option<Duration>,
}

/// Per-provider fixed-window request budget. Denies instead of blocking.
#[derive(Debug)]
pub struct RateLimiter {
    budgets: Mutex<BTreeMap<ProviderId, ProviderBudget>>,
    clock: Arc<dyn Clock>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            budgets: Mutex::new(BTreeMap::new()),
            clock,
            config,
        }
    }

    pub fn add_provider(&self, provider: ProviderId, limits: &RateLimits) {
        self.budgets.lock().insert(
            provider,
            ProviderBudget {
                requests_per_window: limits.requests_per_minute,
                window: None,
            },
        );
        info!("Added rate limiter for provider: {} ({} requests/window)",
              provider, limits.requests_per_minute);
    }

    /// Admit one request for `provider` if its current window has budget left.
    pub fn check_and_consume(&self, provider: ProviderId) -> bool {
        if !self.config.enable_rate_limiting {
            return true;
        }

        let now = self.clock.now();
        let mut budgets = self.budgets.lock();

        let Some(budget) = budgets.get_mut(&provider) else {
            debug!("No rate limit configured for {}, allowing request", provider);
            return true;
        };

        let limit = budget.requests_per_window;
        match budget.window {
            Some(ref mut window) if now < window.reset_at => {
                if window.count < limit {
                    window.count += 1;
                    debug!("Rate window for {}: {}/{}", provider, window.count, limit);
                    true
                } else {
                    warn!("Rate limit hit for {} ({}/{} in current window)",
                          provider, window.count, limit);
                    false
                }
            }
            _ if limit == 0 => {
                warn!("Provider {} has a zero request budget", provider);
                false
            }
            _ => {
                budget.window = Some(RateWindow {
                    count: 1,
                    reset_at: now + self.config.window,
                });
                debug!("Opened new rate window for {}", provider);
                true
            }
        }
    }

    pub fn get_status(&self, provider: ProviderId) -> Option<RateLimiterStatus> {
        let now = self.clock.now();
        let budgets = self.budgets.lock();
        budgets.get(&provider).map(|budget| Self::status_of(provider, budget, now))
    }

    pub fn get_all_status(&self) -> Vec<RateLimiterStatus> {
        let now = self.clock.now();
        let budgets = self.budgets.lock();
        budgets
            .iter()
            .map(|(provider, budget)| Self::status_of(*provider, budget, now))
            .collect()
    }

    fn status_of(provider: ProviderId, budget: &ProviderBudget, now: Instant) -> RateLimiterStatus {
        let live = budget.window.filter(|w| now < w.reset_at);
        RateLimiterStatus {
            provider,
            count: live.map(|w| w.count).unwrap_or(0),
            budget: budget.requests_per_window,
            resets_in: live.map(|w| w.reset_at - now),
        }
    }
}

#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with_budget(budget: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(RateLimiterConfig::default(), clock.clone());
        limiter.add_provider(ProviderId::OpenAI, &RateLimits {
            requests_per_minute: budget,
            tokens_per_minute: 1000,
        });
        (limiter, clock)
    }

    #[test]
    fn test_rate_limiter_config_default() {
        let config = RateLimiterConfig::default();
        assert!(config.enable_rate_limiting);
        assert_eq!(config.window, Duration::from_secs(60));
    }

    #[test]
    fn test_allow_allow_deny_within_window() {
        let (limiter, _clock) = limiter_with_budget(2);

        assert!(limiter.check_and_consume(ProviderId::OpenAI));
        assert!(limiter.check_and_consume(ProviderId::OpenAI));
        assert!(!limiter.check_and_consume(ProviderId::OpenAI));
    }

    #[test]
    fn test_window_expiry_allows_again() {
        let (limiter, clock) = limiter_with_budget(2);

        assert!(limiter.check_and_consume(ProviderId::OpenAI));
        assert!(limiter.check_and_consume(ProviderId::OpenAI));
        assert!(!limiter.check_and_consume(ProviderId::OpenAI));

        clock.advance(Duration::from_secs(60));
        assert!(limiter.check_and_consume(ProviderId::OpenAI));

        let status = limiter.get_status(ProviderId::OpenAI).unwrap();
        assert_eq!(status.count, 1);
        assert_eq!(status.resets_in, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_denials_do_not_extend_count() {
        let (limiter, _clock) = limiter_with_budget(1);

        assert!(limiter.check_and_consume(ProviderId::OpenAI));
        for _ in 0..5 {
            assert!(!limiter.check_and_consume(ProviderId::OpenAI));
        }
        assert_eq!(limiter.get_status(ProviderId::OpenAI).unwrap().count, 1);
    }

    #[test]
    fn test_providers_are_independent() {
        let (limiter, _clock) = limiter_with_budget(1);
        limiter.add_provider(ProviderId::Gemini, &RateLimits::default());

        assert!(limiter.check_and_consume(ProviderId::OpenAI));
        assert!(!limiter.check_and_consume(ProviderId::OpenAI));
        assert!(limiter.check_and_consume(ProviderId::Gemini));
    }

    #[test]
    fn test_unknown_provider_and_disabled_limiter_allow() {
        let (limiter, _clock) = limiter_with_budget(1);
        assert!(limiter.check_and_consume(ProviderId::Anthropic));

        let disabled = RateLimiter::new(RateLimiterConfig {
            enable_rate_limiting: false,
            window: Duration::from_secs(60),
        });
        disabled.add_provider(ProviderId::OpenAI, &RateLimits { requests_per_minute: 0, tokens_per_minute: 0 });
        assert!(disabled.check_and_consume(ProviderId::OpenAI));
    }

    #[test]
    fn test_idle_status() {
        let (limiter, _clock) = limiter_with_budget(5);
        let status = limiter.get_all_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].count, 0);
        assert_eq!(status[0].budget, 5);
        assert_eq!(status[0].resets_in, None);
    }
}
