//! Token-bucket limiter
//!
//! State is a Redis hash `{tokens, last_refill}` per key, mutated by a
//! single Lua script. Refill is computed from the server clock (TIME
//! inside the script), so gateway replicas never disagree about it.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::Script;

use super::{Decision, LimiterError, RateLimiter};
use crate::kv::Kv;

/// KEYS[1] bucket hash
/// ARGV[1] rate, ARGV[2] window_ms, ARGV[3] capacity, ARGV[4] n, ARGV[5] ttl_ms
///
/// Returns {allowed, tokens_remaining, retry_after_ms}.
static SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local rate = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local n = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now_ms
end

local elapsed = now_ms - last
if elapsed > 0 then
  local refill = math.floor(elapsed * rate / window)
  if refill > 0 then
    tokens = math.min(tokens + refill, capacity)
    -- advance by what was actually minted so fractional progress survives
    last = last + math.floor(refill * window / rate)
    if tokens == capacity then
      last = now_ms
    end
  end
end

local allowed = 0
local retry_ms = 0
if tokens >= n then
  tokens = tokens - n
  allowed = 1
else
  retry_ms = math.ceil((n - tokens) * window / rate)
end

redis.call('HMSET', KEYS[1], 'tokens', tokens, 'last_refill', last)
redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[5]))
return {allowed, tokens, retry_ms}
"#,
    )
});

pub struct TokenBucketLimiter {
    kv: Kv,
    /// Tokens minted per window.
    rate: u64,
    window: Duration,
    /// Maximum tokens the bucket holds (rate + burst).
    capacity: u64,
}

impl TokenBucketLimiter {
    pub fn new(kv: Kv, rate: u64, window: Duration, capacity: u64) -> Self {
        Self {
            kv,
            rate: rate.max(1),
            window,
            capacity,
        }
    }

    fn redis_key(key: &str) -> String {
        format!("limiter:tb:{}", key)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow(&self, key: &str, n: u64) -> Result<Decision, LimiterError> {
        let window_ms = self.window.as_millis() as u64;
        let mut conn = self.kv.conn();
        let mut call = SCRIPT.prepare_invoke();
        call.key(Self::redis_key(key))
            .arg(self.rate)
            .arg(window_ms)
            .arg(self.capacity)
            .arg(n)
            .arg(window_ms * 2); // key TTL = 2 * window

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
            Ok(Decision::allow(remaining.max(0) as u64, self.capacity))
        } else {
            Ok(Decision::reject(
                remaining.max(0) as u64,
                Duration::from_millis(retry_ms.max(0) as u64),
                self.capacity,
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
        assert_eq!(TokenBucketLimiter::redis_key("global"), "limiter:tb:global");
        assert_eq!(TokenBucketLimiter::redis_key("user:7"), "limiter:tb:user:7");
    }

    // Requires a running Redis instance.
    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_bucket_drains_and_reports_retry() {
        let kv = Kv::connect(&RedisConfig::default()).await.unwrap();
        let key = format!("tbtest:{}", uuid::Uuid::new_v4());
        let limiter = TokenBucketLimiter::new(kv, 2, Duration::from_secs(1), 2);

        let first = limiter.allow(&key, 1).await.unwrap();
        let second = limiter.allow(&key, 1).await.unwrap();
        let third = limiter.allow(&key, 1).await.unwrap();

        assert!(first.allowed);
        assert!(second.allowed);
        assert!(!third.allowed);
        assert!(third.retry_after > Duration::ZERO);
        assert!(third.retry_after <= Duration::from_secs(1));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_bucket_refills_over_time() {
        let kv = Kv::connect(&RedisConfig::default()).await.unwrap();
        let key = format!("tbtest:{}", uuid::Uuid::new_v4());
        let limiter = TokenBucketLimiter::new(kv, 10, Duration::from_secs(1), 10);

        for _ in 0..10 {
            assert!(limiter.allow(&key, 1).await.unwrap().allowed);
        }
        assert!(!limiter.allow(&key, 1).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(250)).await;
        // ~2-3 tokens minted meanwhile
        assert!(limiter.allow(&key, 1).await.unwrap().allowed);
    }
}
