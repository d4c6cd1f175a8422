//! Multi-tier rate limiting against the shared Redis store
//!
//! Every limiter mutates its state through a single server-side Lua
//! script, so all gateway replicas observe one consistent counter and
//! no process-level lock is needed. Three algorithms are provided
//! (token bucket, sliding window, fixed window) behind one trait, plus
//! a combinator that gates on several limiters at once.
//!
//! Failure semantics: any store error fails the `allow` call; callers
//! must translate that into an admission rejection - over-admitting on
//! a broken limiter is never acceptable.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{LimiterConfig, LimiterGateConfig};
use crate::core_types::UserId;
use crate::kv::Kv;

/// Limiter-layer errors. Never retried at this layer.
#[derive(Error, Debug, Clone)]
pub enum LimiterError {
    #[error("limiter store error: {0}")]
    Store(String),

    #[error("limiter script returned malformed reply")]
    MalformedReply,

    #[error("limiter call exceeded its deadline")]
    Timeout,
}

impl From<redis::RedisError> for LimiterError {
    fn from(e: redis::RedisError) -> Self {
        LimiterError::Store(e.to_string())
    }
}

/// Outcome of a single `allow` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests still admissible in the current window.
    pub remaining: u64,
    /// How long to wait before the next attempt can succeed.
    pub retry_after: Duration,
    /// Configured capacity of the gate.
    pub total: u64,
}

impl Decision {
    pub fn allow(remaining: u64, total: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
            total,
        }
    }

    pub fn reject(remaining: u64, retry_after: Duration, total: u64) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after,
            total,
        }
    }
}

/// A rate limiter gate.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to admit `n` requests under `key`.
    async fn allow(&self, key: &str, n: u64) -> Result<Decision, LimiterError>;
}

/// Algorithm selection at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterKind {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

/// Build one gate of the selected kind from its config.
pub fn build_limiter(
    kind: LimiterKind,
    kv: Kv,
    gate: &LimiterGateConfig,
    precision: Duration,
) -> Arc<dyn RateLimiter> {
    let window = Duration::from_secs(gate.window_secs);
    match kind {
        LimiterKind::TokenBucket => Arc::new(TokenBucketLimiter::new(
            kv,
            gate.rate,
            window,
            gate.rate + gate.burst,
        )),
        LimiterKind::SlidingWindow => {
            Arc::new(SlidingWindowLimiter::new(kv, gate.rate, window, precision))
        }
        LimiterKind::FixedWindow => Arc::new(FixedWindowLimiter::new(kv, gate.rate, window)),
    }
}

/// How a `MultiLimiter` combines its inner decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineMode {
    /// Every inner gate must admit.
    AllPass,
    /// At least one inner gate must admit.
    AnyPass,
}

/// Ordered composition of several gates.
///
/// All inner limiters are always consulted (and consume quota), so a
/// caller bouncing off one gate still burns its budget on the others.
pub struct MultiLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
    mode: CombineMode,
}

impl MultiLimiter {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter>>, mode: CombineMode) -> Self {
        Self { limiters, mode }
    }
}

#[async_trait]
impl RateLimiter for MultiLimiter {
    async fn allow(&self, key: &str, n: u64) -> Result<Decision, LimiterError> {
        let mut decisions = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            decisions.push(limiter.allow(key, n).await?);
        }
        Ok(combine(&decisions, self.mode))
    }
}

/// Pure combination rule: remaining = minimum positive inner
/// remaining, retry_after = maximum inner retry.
pub fn combine(decisions: &[Decision], mode: CombineMode) -> Decision {
    let allowed = match mode {
        CombineMode::AllPass => decisions.iter().all(|d| d.allowed),
        CombineMode::AnyPass => decisions.iter().any(|d| d.allowed),
    };
    let remaining = decisions
        .iter()
        .map(|d| d.remaining)
        .filter(|&r| r > 0)
        .min()
        .unwrap_or(0);
    let retry_after = decisions
        .iter()
        .map(|d| d.retry_after)
        .max()
        .unwrap_or(Duration::ZERO);
    let total = decisions.iter().map(|d| d.total).min().unwrap_or(0);
    Decision {
        allowed,
        remaining,
        retry_after,
        total,
    }
}

// ============================================================
// Key conventions
// ============================================================

/// Key for the process-wide gate.
pub fn key_global() -> String {
    "global".to_string()
}

/// Key for a per-user gate.
pub fn key_user(user_id: UserId) -> String {
    format!("user:{}", user_id)
}

/// Key for a per-route gate.
pub fn key_path(method: &str, route: &str) -> String {
    format!("path:{}:{}", method, route)
}

/// The admission gate the spike gateway always applies:
/// ALL_PASS(global token bucket, per-user gate).
pub struct AdmissionGate {
    global: Arc<dyn RateLimiter>,
    per_user: Arc<dyn RateLimiter>,
}

impl AdmissionGate {
    pub fn new(kv: Kv, config: &LimiterConfig) -> Self {
        let precision = Duration::from_millis(config.precision_ms);
        Self {
            global: build_limiter(LimiterKind::TokenBucket, kv.clone(), &config.global, precision),
            per_user: build_limiter(
                LimiterKind::SlidingWindow,
                kv,
                &config.per_user,
                precision,
            ),
        }
    }

    /// ALL_PASS over (global, user:{id}).
    pub async fn check(&self, user_id: UserId, n: u64) -> Result<Decision, LimiterError> {
        let global = self.global.allow(&key_global(), n).await?;
        let user = self.per_user.allow(&key_user(user_id), n).await?;
        Ok(combine(&[global, user], CombineMode::AllPass))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(allowed: bool, remaining: u64, retry_ms: u64, total: u64) -> Decision {
        Decision {
            allowed,
            remaining,
            retry_after: Duration::from_millis(retry_ms),
            total,
        }
    }

    #[test]
    fn test_combine_all_pass() {
        let out = combine(&[d(true, 10, 0, 100), d(true, 3, 0, 5)], CombineMode::AllPass);
        assert!(out.allowed);
        assert_eq!(out.remaining, 3);
        assert_eq!(out.total, 5);
    }

    #[test]
    fn test_combine_all_pass_rejects_on_any_failure() {
        let out = combine(
            &[d(true, 10, 0, 100), d(false, 0, 750, 5)],
            CombineMode::AllPass,
        );
        assert!(!out.allowed);
        assert_eq!(out.retry_after, Duration::from_millis(750));
    }

    #[test]
    fn test_combine_any_pass() {
        let out = combine(
            &[d(false, 0, 500, 10), d(true, 1, 0, 2)],
            CombineMode::AnyPass,
        );
        assert!(out.allowed);
        // Retry hint still reflects the slowest gate.
        assert_eq!(out.retry_after, Duration::from_millis(500));
    }

    #[test]
    fn test_combine_remaining_skips_zeroes() {
        let out = combine(&[d(true, 0, 0, 4), d(true, 7, 0, 9)], CombineMode::AllPass);
        assert_eq!(out.remaining, 7);
    }

    #[test]
    fn test_key_conventions() {
        assert_eq!(key_global(), "global");
        assert_eq!(key_user(42), "user:42");
        assert_eq!(key_path("POST", "/api/v1/spike/participate"), "path:POST:/api/v1/spike/participate");
    }
}
