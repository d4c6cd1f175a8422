//! Fixed-window limiter
//!
//! The simplest gate: one counter per window boundary, INCRBY +
//! PEXPIRE in a single script. Retry hint is the time left until the
//! next boundary.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::Script;

use super::{Decision, LimiterError, RateLimiter};
use crate::kv::Kv;

/// KEYS[1] bucket key prefix
/// ARGV[1] limit, ARGV[2] window_ms, ARGV[3] n
///
/// Returns {allowed, remaining, retry_after_ms}.
static SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local n = tonumber(ARGV[3])

local bucket = math.floor(now_ms / window) * window
local key = KEYS[1] .. ':' .. bucket
local current = tonumber(redis.call('GET', key) or '0')

if current + n > limit then
  local remaining = limit - current
  if remaining < 0 then
    remaining = 0
  end
  return {0, remaining, bucket + window - now_ms}
end

local after = redis.call('INCRBY', key, n)
redis.call('PEXPIRE', key, window)
return {1, limit - after, 0}
"#,
    )
});

pub struct FixedWindowLimiter {
    kv: Kv,
    limit: u64,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(kv: Kv, limit: u64, window: Duration) -> Self {
        Self { kv, limit, window }
    }

    fn redis_key(key: &str) -> String {
        format!("limiter:fw:{}", key)
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn allow(&self, key: &str, n: u64) -> Result<Decision, LimiterError> {
        let mut conn = self.kv.conn();
        let mut call = SCRIPT.prepare_invoke();
        call.key(Self::redis_key(key))
            .arg(self.limit)
            .arg(self.window.as_millis() as u64)
            .arg(n);

        let reply = tokio::time::timeout(
            self.kv.op_timeout(),
            call.invoke_async::<Vec<i64>>(&mut conn),
        )
        .await
        .map_err(|_| LimiterError::Timeout)??;

        let [allowed, remaining, retry_ms] = reply[..] else {
            return Err(LimiterError::MalformedReply);
        };

        if allowed == 1 {
            Ok(Decision::allow(remaining.max(0) as u64, self.limit))
        } else {
            Ok(Decision::reject(
                remaining.max(0) as u64,
                Duration::from_millis(retry_ms.max(0) as u64),
                self.limit,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    #[test]
    fn test_redis_key_prefix() {
        assert_eq!(FixedWindowLimiter::redis_key("global"), "limiter:fw:global");
    }

    // Requires a running Redis instance.
    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_fixed_window_never_exceeds_limit() {
        let kv = Kv::connect(&RedisConfig::default()).await.unwrap();
        let key = format!("fwtest:{}", uuid::Uuid::new_v4());
        let limiter = FixedWindowLimiter::new(kv, 3, Duration::from_secs(60));

        let mut allowed = 0;
        for _ in 0..10 {
            if limiter.allow(&key, 1).await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);

        let rejected = limiter.allow(&key, 1).await.unwrap();
        assert!(!rejected.allowed);
        // Retry points at the next window boundary.
        assert!(rejected.retry_after <= Duration::from_secs(60));
    }
}
