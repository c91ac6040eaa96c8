//! Heuristic ranking of ensemble candidates.
//!
//! This is a content heuristic, not a semantic judge. It rewards answers that
//! look like complete, runnable code with an explanation, and fast, compact
//! responses. Identical inputs always produce identical scores.

use std::sync::OnceLock;

use regex::Regex;

use crate::orchestrator::types::CompletionResponse;

pub const MAX_SCORE: u32 = 100;

struct Patterns {
    function_def: Regex,
    variable_decl: Regex,
    error_handling: Regex,
    example: Regex,
    import_export: Regex,
    async_kw: Regex,
    await_kw: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        function_def: Regex::new(r"\bfunction\b|\bfn\s+\w+|\bdef\s+\w+|=>").unwrap(),
        variable_decl: Regex::new(r"\b(const|let|var)\s").unwrap(),
        error_handling: Regex::new(r"\b(try|catch|error)\b|Result<").unwrap(),
        example: Regex::new(r"(?i)\b(example|usage)").unwrap(),
        import_export: Regex::new(r"\b(import|export)\b").unwrap(),
        async_kw: Regex::new(r"\basync\b").unwrap(),
        await_kw: Regex::new(r"\bawait\b").unwrap(),
    })
}

/// A candidate response with its score, for the duration of one ensemble call.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub response: CompletionResponse,
    pub score: u32,
    pub rationale: String,
}

pub fn score(response: &CompletionResponse) -> (u32, String) {
    let p = patterns();
    let content = response.content.as_str();
    let mut total = 0u32;
    let mut reasons: Vec<&str> = Vec::new();

    let mut add = |points: u32, reason: &'static str| {
        total += points;
        reasons.push(reason);
    };

    if content.contains("```") && p.function_def.is_match(content) {
        add(25, "code block with function");
    }
    if p.variable_decl.is_match(content) {
        add(15, "variable declarations");
    }
    if p.error_handling.is_match(content) {
        add(10, "error handling");
    }
    if p.example.is_match(content) {
        add(15, "usage example");
    }
    if p.import_export.is_match(content) {
        add(10, "imports/exports");
    }
    if p.async_kw.is_match(content) {
        add(10, "async");
    }
    if p.await_kw.is_match(content) {
        add(10, "await");
    }
    if response.usage.total_tokens < 1000 {
        add(10, "compact");
    }
    if response.duration_ms < 2000 {
        add(15, "fast");
    } else if response.duration_ms < 5000 {
        add(10, "moderate latency");
    }

    let rationale = if reasons.is_empty() {
        "no signals".to_string()
    } else {
        reasons.join(", ")
    };

    (total.min(MAX_SCORE), rationale)
}

pub fn score_candidate(response: CompletionResponse) -> ScoredCandidate {
    let (score, rationale) = score(&response);
    ScoredCandidate { response, score, rationale }
}

/// Highest score wins; on ties the earliest candidate is kept.
pub fn pick_best(candidates: &[ScoredCandidate]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        match best {
            Some(current) if candidates[current].score >= candidate.score => {}
            _ => best = Some(index),
        }
    }
    best
}
