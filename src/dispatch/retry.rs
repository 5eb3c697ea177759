//! Retry policy: failure taxonomy, rate-limit backoff, and the pure
//! next-backend decision.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::gateway::{GatewayErrorKind, ProviderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, timeout, 5xx.
    Transport,
    RateLimited,
    /// Empty, refused or unrepairable response.
    MalformedOutput,
    /// Parsed but violates artifact invariants.
    ValidationError,
    /// Retry budget consumed or no backend left to try.
    Exhausted,
    CatalogUnavailable,
    /// Gateway credentials rejected. Terminal, not the backend's fault.
    Auth,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::MalformedOutput => "malformed_output",
            FailureKind::ValidationError => "validation_error",
            FailureKind::Exhausted => "exhausted",
            FailureKind::CatalogUnavailable => "catalog_unavailable",
            FailureKind::Auth => "auth",
        }
    }

    /// Whether this failure counts against the backend's trust.
    pub fn penalizes_backend(&self) -> bool {
        matches!(
            self,
            FailureKind::Transport | FailureKind::RateLimited | FailureKind::MalformedOutput
        )
    }
}

impl From<&ProviderError> for FailureKind {
    fn from(err: &ProviderError) -> Self {
        match err.kind() {
            GatewayErrorKind::RateLimited => FailureKind::RateLimited,
            GatewayErrorKind::Transport => FailureKind::Transport,
            GatewayErrorKind::Auth => FailureKind::Auth,
            GatewayErrorKind::EmptyResponse => FailureKind::MalformedOutput,
        }
    }
}

// =============================================================================
// BACKOFF
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(with = "crate::gateway::types::duration_ms")]
    pub base: Duration,
    #[serde(with = "crate::gateway::types::duration_ms")]
    pub max: Duration,
    /// Add up to 25% random jitter.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// `base × 2^(n−1)` for the n-th consecutive rate limit, capped at `max`.
    pub fn delay_for(&self, consecutive: u32) -> Duration {
        let exp = consecutive.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let extra = rand::thread_rng().gen_range(0.0..0.25);
        capped.mul_f64(1.0 + extra).min(self.max)
    }
}

/// Consecutive rate-limit counts per backend, shared by every task in a batch.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl RateLimitTracker {
    /// Count one more rate limit and return the new streak length.
    pub fn note(&self, backend_id: &str) -> u32 {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let n = counts.entry(backend_id.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    pub fn reset(&self, backend_id: &str) {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(backend_id);
    }

    pub fn streak(&self, backend_id: &str) -> u32 {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(backend_id)
            .copied()
            .unwrap_or(0)
    }
}

// =============================================================================
// DECISION
// =============================================================================

#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Attempts made so far (1 after the first failure).
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_backend: &'a str,
    pub last_failure: FailureKind,
    /// Every backend tried so far, in order.
    pub tried: &'a [String],
    /// Freshly resolved role list.
    pub candidates: &'a [String],
    /// Backoff owed because of a rate limit, if the last failure was one.
    pub rate_limit_delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { backend: String, delay: Duration },
    GiveUp { kind: FailureKind, reason: &'static str },
}

/// Decide what a failed task does next.
///
/// Prefers a backend not tried yet, then any backend other than the last one.
/// The same backend is only retried back-to-back when it is the only one the
/// role resolves to.
pub fn decide_next(ctx: &RetryContext<'_>) -> RetryDecision {
    if ctx.last_failure == FailureKind::Auth {
        return RetryDecision::GiveUp {
            kind: FailureKind::Auth,
            reason: "gateway rejected credentials",
        };
    }
    if ctx.attempt >= ctx.max_attempts {
        return RetryDecision::GiveUp {
            kind: FailureKind::Exhausted,
            reason: "attempt budget consumed",
        };
    }

    let delay = ctx.rate_limit_delay.unwrap_or(Duration::ZERO);
    let not_last = |id: &&String| id.as_str() != ctx.last_backend;

    let next = ctx
        .candidates
        .iter()
        .filter(not_last)
        .find(|id| !ctx.tried.contains(id))
        .or_else(|| ctx.candidates.iter().find(not_last));

    if let Some(backend) = next {
        return RetryDecision::Retry {
            backend: backend.clone(),
            delay,
        };
    }

    match ctx.candidates {
        [only] if only == ctx.last_backend => RetryDecision::Retry {
            backend: only.clone(),
            delay,
        },
        _ => RetryDecision::GiveUp {
            kind: FailureKind::Exhausted,
            reason: "no backend left to substitute",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn ctx<'a>(
        attempt: u32,
        last: &'a str,
        tried: &'a [String],
        candidates: &'a [String],
    ) -> RetryContext<'a> {
        RetryContext {
            attempt,
            max_attempts: 3,
            last_backend: last,
            last_failure: FailureKind::Transport,
            tried,
            candidates,
            rate_limit_delay: None,
        }
    }

    #[test]
    fn substitutes_next_untried() {
        let tried = ids(&["a"]);
        let cands = ids(&["a", "b", "c"]);
        assert_eq!(
            decide_next(&ctx(1, "a", &tried, &cands)),
            RetryDecision::Retry {
                backend: "b".into(),
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn never_same_backend_twice_when_alternatives_exist() {
        // everything tried already: go back to one that isn't the last
        let tried = ids(&["a", "b"]);
        let cands = ids(&["b", "a"]);
        match decide_next(&ctx(2, "b", &tried, &cands)) {
            RetryDecision::Retry { backend, .. } => assert_eq!(backend, "a"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn single_candidate_is_retried() {
        let tried = ids(&["a"]);
        let cands = ids(&["a"]);
        match decide_next(&ctx(1, "a", &tried, &cands)) {
            RetryDecision::Retry { backend, .. } => assert_eq!(backend, "a"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn gives_up_on_budget_empty_list_or_auth() {
        let tried = ids(&["a"]);
        let cands = ids(&["a", "b"]);
        assert!(matches!(
            decide_next(&ctx(3, "a", &tried, &cands)),
            RetryDecision::GiveUp {
                kind: FailureKind::Exhausted,
                ..
            }
        ));
        assert!(matches!(
            decide_next(&ctx(1, "a", &tried, &[])),
            RetryDecision::GiveUp { .. }
        ));
        let mut auth = ctx(1, "a", &tried, &cands);
        auth.last_failure = FailureKind::Auth;
        assert!(matches!(
            decide_next(&auth),
            RetryDecision::GiveUp {
                kind: FailureKind::Auth,
                ..
            }
        ));
    }

    #[test]
    fn carries_rate_limit_delay() {
        let tried = ids(&["a"]);
        let cands = ids(&["a", "b"]);
        let mut c = ctx(1, "a", &tried, &cands);
        c.last_failure = FailureKind::RateLimited;
        c.rate_limit_delay = Some(Duration::from_secs(4));
        assert_eq!(
            decide_next(&c),
            RetryDecision::Retry {
                backend: "b".into(),
                delay: Duration::from_secs(4)
            }
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = BackoffConfig {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(cfg.delay_for(1), Duration::from_secs(1));
        assert_eq!(cfg.delay_for(2), Duration::from_secs(2));
        assert_eq!(cfg.delay_for(3), Duration::from_secs(4));
        assert_eq!(cfg.delay_for(4), Duration::from_secs(5));
        assert_eq!(cfg.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let cfg = BackoffConfig {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..50 {
            let d = cfg.delay_for(2);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_millis(2_500));
        }
    }

    #[test]
    fn tracker_streaks_reset_on_success() {
        let t = RateLimitTracker::default();
        assert_eq!(t.note("a"), 1);
        assert_eq!(t.note("a"), 2);
        assert_eq!(t.note("b"), 1);
        t.reset("a");
        assert_eq!(t.streak("a"), 0);
        assert_eq!(t.streak("b"), 1);
    }
}
