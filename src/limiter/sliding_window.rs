//! Sliding-window limiter
//!
//! The window is partitioned into `ceil(window / precision)`
//! sub-buckets, each its own counter key. A call sums every live
//! sub-bucket, then increments the current one. Counting and
//! incrementing happen in one Lua script so concurrent callers cannot
//! both slip under the limit.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::Script;

use super::{Decision, LimiterError, RateLimiter};
use crate::kv::Kv;

/// KEYS[1] sub-bucket key prefix
/// ARGV[1] limit, ARGV[2] window_ms, ARGV[3] precision_ms, ARGV[4] n
///
/// Returns {allowed, remaining, retry_after_ms}.
static SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local precision = tonumber(ARGV[3])
local n = tonumber(ARGV[4])

local windows = math.ceil(window / precision)
local cur = math.floor(now_ms / precision)
local floor_ms = now_ms - window

local sum = 0
local oldest = cur
for i = 0, windows do
  local idx = cur - i
  -- a sub-bucket is live while any part of it overlaps [now - window, now]
  if (idx + 1) * precision > floor_ms then
    local count = redis.call('GET', KEYS[1] .. ':' .. idx)
    if count then
      sum = sum + tonumber(count)
      if idx < oldest then
        oldest = idx
      end
    end
  end
end

if sum + n > limit then
  -- wait until the oldest live sub-bucket slides out of the window
  local retry_ms = (oldest + 1) * precision - floor_ms
  if retry_ms < 1 then
    retry_ms = precision
  end
  local remaining = limit - sum
  if remaining < 0 then
    remaining = 0
  end
  return {0, remaining, retry_ms}
end

local key = KEYS[1] .. ':' .. cur
redis.call('INCRBY', key, n)
redis.call('PEXPIRE', key, window + precision)
return {1, limit - sum - n, 0}
"#,
    )
});

pub struct SlidingWindowLimiter {
    kv: Kv,
    limit: u64,
    window: Duration,
    precision: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(kv: Kv, limit: u64, window: Duration, precision: Duration) -> Self {
        // precision wider than the window degenerates to a fixed window
        let precision = precision.min(window).max(Duration::from_millis(1));
        Self {
            kv,
            limit,
            window,
            precision,
        }
    }

    fn redis_key(key: &str) -> String {
        format!("limiter:sw:{}", key)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn allow(&self, key: &str, n: u64) -> Result<Decision, LimiterError> {
        let mut conn = self.kv.conn();
        let mut call = SCRIPT.prepare_invoke();
        call.key(Self::redis_key(key))
            .arg(self.limit)
            .arg(self.window.as_millis() as u64)
            .arg(self.precision.as_millis() as u64)
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
