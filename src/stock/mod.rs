//! Fast stock store
//!
//! The admission decision lives here: a pre-warmed per-event counter
//! in Redis, decremented by a single Lua script that also enforces the
//! sold-out latch and the per-(user, event) dedup marker. Each of the
//! four operations is one script invocation, which makes them
//! linearizable per key without any client-side locking.
//!
//! The latch is a distinct key rather than "counter == 0" so that
//! `restore` can re-open admission after a cancellation or expiry.
//! The counter is signed and never driven below zero by the script.

use std::time::Duration;

use once_cell::sync::Lazy;
use redis::Script;
use thiserror::Error;

use crate::core_types::{EventId, UserId};
use crate::kv::Kv;

#[derive(Error, Debug, Clone)]
pub enum StockError {
    #[error("stock store error: {0}")]
    Store(String),

    #[error("stock script returned malformed reply")]
    MalformedReply,

    #[error("stock call exceeded its deadline")]
    Timeout,
}

impl From<redis::RedisError> for StockError {
    fn from(e: redis::RedisError) -> Self {
        StockError::Store(e.to_string())
    }
}

/// Result of one decrement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// The caller won a slot; `remaining` is the counter after deduct.
    Won { remaining: i64 },
    /// The sold-out latch was set (or the counter was never warmed).
    SoldOut,
    /// The dedup marker for this (user, event) already exists.
    AlreadyParticipated,
    /// Fewer than `n` items left; the latch is now set.
    Insufficient { remaining: i64 },
}

/// Atomic read of counter + latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockInfo {
    /// Counter value; negative when the key does not exist.
    pub remaining: i64,
    pub sold_out: bool,
}

impl StockInfo {
    /// Remaining stock as the API reports it (missing key reads as 0).
    pub fn available(&self) -> i64 {
        if self.sold_out { 0 } else { self.remaining.max(0) }
    }
}

/// KEYS[1] counter, KEYS[2] latch; ARGV[1] stock, ARGV[2] ttl_secs
static WARMUP: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('DEL', KEYS[2])
return 1
"#,
    )
});

/// KEYS[1] counter, KEYS[2] latch, KEYS[3] dedup marker
/// ARGV[1] n, ARGV[2] user_ttl_secs, ARGV[3] stock_ttl_secs
///
/// Returns {1, remaining} on win, {0, reason} on reject where reason
/// is 1 = sold out, 2 = already participated, 3 = insufficient.
static DECREMENT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return {0, 1}
end
if redis.call('EXISTS', KEYS[3]) == 1 then
  return {0, 2}
end

local stock = tonumber(redis.call('GET', KEYS[1]))
local n = tonumber(ARGV[1])
if stock == nil then
  -- never warmed or TTL expired: latch to stop the herd re-reading
  redis.call('SET', KEYS[2], '1')
  redis.call('EXPIRE', KEYS[2], ARGV[3])
  return {0, 1}
end
if stock < n then
  redis.call('SET', KEYS[2], '1')
  redis.call('EXPIRE', KEYS[2], ARGV[3])
  return {0, 3, stock}
end

local remaining = redis.call('DECRBY', KEYS[1], n)
redis.call('SET', KEYS[3], '1')
redis.call('EXPIRE', KEYS[3], ARGV[2])
if remaining <= 0 then
  redis.call('SET', KEYS[2], '1')
  redis.call('EXPIRE', KEYS[2], ARGV[3])
end
return {1, remaining}
"#,
    )
});

/// KEYS[1] counter, KEYS[2] latch, KEYS[3] dedup marker; ARGV[1] n
static RESTORE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local remaining = redis.call('INCRBY', KEYS[1], ARGV[1])
if remaining > 0 then
  redis.call('DEL', KEYS[2])
end
redis.call('DEL', KEYS[3])
return remaining
"#,
    )
});

/// KEYS[1] counter, KEYS[2] latch
static GET_INFO: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local stock = redis.call('GET', KEYS[1])
local latch = redis.call('EXISTS', KEYS[2])
if stock == false then
  return {-1, latch}
end
return {tonumber(stock), latch}
"#,
    )
});

/// Atomic, idempotent operations on the per-event fast counter.
#[derive(Clone)]
pub struct FastStockStore {
    kv: Kv,
}

impl FastStockStore {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub fn stock_key(event_id: EventId) -> String {
        format!("spike:stock:{}", event_id)
    }

    pub fn soldout_key(event_id: EventId) -> String {
        format!("spike:soldout:{}", event_id)
    }

    pub fn user_key(user_id: UserId, event_id: EventId) -> String {
        format!("spike:user:{}:{}", user_id, event_id)
    }

    async fn invoke(&self, script: &Script, keys: &[String], args: &[i64]) -> Result<Vec<i64>, StockError> {
        let mut conn = self.kv.conn();
        let mut call = script.prepare_invoke();
        for key in keys {
            call.key(key.as_str());
        }
        for arg in args {
            call.arg(*arg);
        }
        let fut = call.invoke_async::<Vec<i64>>(&mut conn);
        tokio::time::timeout(self.kv.op_timeout(), fut)
            .await
            .map_err(|_| StockError::Timeout)?
            .map_err(StockError::from)
    }

    /// Preload the counter and clear the latch. Idempotent overwrite;
    /// safe to call again mid-event (it resets to the given value).
    pub async fn warmup(
        &self,
        event_id: EventId,
        stock: i64,
        ttl: Duration,
    ) -> Result<(), StockError> {
        self.invoke(
            &WARMUP,
            &[Self::stock_key(event_id), Self::soldout_key(event_id)],
            &[stock, ttl.as_secs().max(1) as i64],
        )
        .await?;
        tracing::info!(event_id, stock, "fast stock warmed");
        Ok(())
    }

    /// Try to win `n` slots for (user, event).
    pub async fn decrement(
        &self,
        event_id: EventId,
        user_id: UserId,
        n: i64,
        user_ttl: Duration,
        stock_ttl: Duration,
    ) -> Result<DecrementOutcome, StockError> {
        let reply = self
            .invoke(
                &DECREMENT,
                &[
                    Self::stock_key(event_id),
                    Self::soldout_key(event_id),
                    Self::user_key(user_id, event_id),
                ],
                &[
                    n,
                    user_ttl.as_secs().max(1) as i64,
                    stock_ttl.as_secs().max(1) as i64,
                ],
            )
            .await?;

        match reply.as_slice() {
            [1, remaining, ..] => Ok(DecrementOutcome::Won {
                remaining: *remaining,
            }),
            [0, 1, ..] => Ok(DecrementOutcome::SoldOut),
            [0, 2, ..] => Ok(DecrementOutcome::AlreadyParticipated),
            [0, 3, remaining] => Ok(DecrementOutcome::Insufficient {
                remaining: *remaining,
            }),
            [0, 3] => Ok(DecrementOutcome::Insufficient { remaining: 0 }),
            _ => Err(StockError::MalformedReply),
        }
    }

    /// Give `n` slots back and clear the user's dedup marker so a
    /// compensated user may retry. Returns the counter after restore.
    pub async fn restore(
        &self,
        event_id: EventId,
        user_id: UserId,
        n: i64,
    ) -> Result<i64, StockError> {
        let reply = self
            .invoke(
                &RESTORE,
                &[
                    Self::stock_key(event_id),
                    Self::soldout_key(event_id),
                    Self::user_key(user_id, event_id),
                ],
                &[n],
            )
            .await?;
        reply.first().copied().ok_or(StockError::MalformedReply)
    }

    /// Read counter and latch in one atomic step.
    pub async fn get_stock_info(&self, event_id: EventId) -> Result<StockInfo, StockError> {
        let reply = self
            .invoke(
                &GET_INFO,
                &[Self::stock_key(event_id), Self::soldout_key(event_id)],
                &[],
            )
            .await?;
        let [remaining, latch] = reply[..] else {
            return Err(StockError::MalformedReply);
        };
        Ok(StockInfo {
            remaining,
            sold_out: latch == 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    #[test]
    fn test_key_layout() {
        assert_eq!(FastStockStore::stock_key(7), "spike:stock:7");
        assert_eq!(FastStockStore::soldout_key(7), "spike:soldout:7");
        assert_eq!(FastStockStore::user_key(42, 7), "spike:user:42:7");
    }

    #[test]
    fn test_stock_info_available() {
        let missing = StockInfo {
            remaining: -1,
            sold_out: false,
        };
        assert_eq!(missing.available(), 0);

        let latched = StockInfo {
            remaining: 3,
            sold_out: true,
        };
        assert_eq!(latched.available(), 0);

        let live = StockInfo {
            remaining: 5,
            sold_out: false,
        };
        assert_eq!(live.available(), 5);
    }

    // The tests below require a running Redis instance.

    fn ttl() -> Duration {
        Duration::from_secs(60)
    }

    async fn store() -> FastStockStore {
        let kv = Kv::connect(&RedisConfig::default()).await.unwrap();
        FastStockStore::new(kv)
    }

    fn fresh_event() -> EventId {
        // Distinct per test run so leftover keys never collide.
        (uuid::Uuid::new_v4().as_u128() & 0x7fff_ffff) as EventId
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_decrement_until_sold_out() {
        let store = store().await;
        let event = fresh_event();
        store.warmup(event, 2, ttl()).await.unwrap();

        let first = store.decrement(event, 1, 1, ttl(), ttl()).await.unwrap();
        assert_eq!(first, DecrementOutcome::Won { remaining: 1 });

        let second = store.decrement(event, 2, 1, ttl(), ttl()).await.unwrap();
        assert_eq!(second, DecrementOutcome::Won { remaining: 0 });

        // Counter hit zero: latch set, third user short-circuits.
        let third = store.decrement(event, 3, 1, ttl(), ttl()).await.unwrap();
        assert_eq!(third, DecrementOutcome::SoldOut);

        let info = store.get_stock_info(event).await.unwrap();
        assert_eq!(info.remaining, 0);
        assert!(info.sold_out);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_duplicate_user_rejected() {
        let store = store().await;
        let event = fresh_event();
        store.warmup(event, 5, ttl()).await.unwrap();

        let first = store.decrement(event, 7, 1, ttl(), ttl()).await.unwrap();
        assert!(matches!(first, DecrementOutcome::Won { .. }));

        let again = store.decrement(event, 7, 1, ttl(), ttl()).await.unwrap();
        assert_eq!(again, DecrementOutcome::AlreadyParticipated);

        let info = store.get_stock_info(event).await.unwrap();
        assert_eq!(info.remaining, 4);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_restore_reopens_admission() {
        let store = store().await;
        let event = fresh_event();
        store.warmup(event, 1, ttl()).await.unwrap();

        let won = store.decrement(event, 9, 1, ttl(), ttl()).await.unwrap();
        assert_eq!(won, DecrementOutcome::Won { remaining: 0 });
        assert!(store.get_stock_info(event).await.unwrap().sold_out);

        let after = store.restore(event, 9, 1).await.unwrap();
        assert_eq!(after, 1);

        let info = store.get_stock_info(event).await.unwrap();
        assert!(!info.sold_out);

        // Dedup marker cleared: the same user may try again.
        let retry = store.decrement(event, 9, 1, ttl(), ttl()).await.unwrap();
        assert_eq!(retry, DecrementOutcome::Won { remaining: 0 });
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_insufficient_sets_latch() {
        let store = store().await;
        let event = fresh_event();
        store.warmup(event, 1, ttl()).await.unwrap();

        let outcome = store.decrement(event, 11, 2, ttl(), ttl()).await.unwrap();
        assert_eq!(outcome, DecrementOutcome::Insufficient { remaining: 1 });
        assert!(store.get_stock_info(event).await.unwrap().sold_out);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_concurrent_decrements_never_oversell() {
        let store = store().await;
        let event = fresh_event();
        let initial = 10_i64;
        store.warmup(event, initial, ttl()).await.unwrap();

        let mut handles = Vec::new();
        for user in 1..=100_i64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.decrement(event, user, 1, ttl(), ttl()).await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if let Ok(Ok(DecrementOutcome::Won { .. })) = handle.await {
                wins += 1;
            }
        }

        assert_eq!(wins, initial);
        let info = store.get_stock_info(event).await.unwrap();
        assert_eq!(info.remaining, 0);
        assert!(info.sold_out);
    }
}
