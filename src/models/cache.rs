use std::collections::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::provider::Message;
use crate::orchestrator::types::{CompletionRequest, CompletionResponse, RequestContext};

/// Key used for ensemble results in place of a model name.
pub const ENSEMBLE_KEY: &str = "ensemble";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// `None` keeps every entry. `Some(n)` evicts the least recently used entry past `n`.
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: None,
        }
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    context: Option<&'a RequestContext>,
}

/// Deterministic cache key over the fields that determine a completion.
pub fn fingerprint(model_key: &str, request: &CompletionRequest) -> String {
    let input = FingerprintInput {
        model: model_key,
        messages: request.messages(),
        temperature: request.temperature(),
        context: request.context(),
    };

    // Serializing plain structs and strings cannot fail
    let serialized = serde_json::to_vec(&input).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug)]
struct CacheSlot {
    response: CompletionResponse,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheSlot>,
    tick: u64,
}

/// In-process response cache. Writes replace; concurrent identical misses are harmless.
#[derive(Debug)]
pub struct ResponseCache {
    state: Mutex<CacheState>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            config,
        }
    }

    /// Returns the stored response marked as a cache hit. Usage and duration are the stored ones.
    pub fn lookup(&self, fingerprint: &str) -> Option<CompletionResponse> {
        if !self.config.enabled {
            return None;
        }

        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;

        let slot = state.entries.get_mut(fingerprint)?;
        slot.last_used = tick;

        let mut response = slot.response.clone();
        response.cached = true;
        debug!("Cache hit for {}", fingerprint.get(..12).unwrap_or(fingerprint));
        Some(response)
    }

    pub fn store(&self, fingerprint: String, response: CompletionResponse) {
        if !self.config.enabled {
            return;
        }

        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        state.entries.insert(fingerprint, CacheSlot { response, last_used: tick });

        if let Some(max_entries) = self.config.max_entries {
            while state.entries.len() > max_entries {
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_used)
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(key) => {
                        state.entries.remove(&key);
                        debug!("Evicted least recently used cache entry");
                    }
                    None => break,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }
}
