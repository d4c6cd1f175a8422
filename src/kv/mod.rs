//! Shared Redis handle
//!
//! One `ConnectionManager` per process, cloned into every caller. The
//! manager multiplexes and reconnects internally; no process-level
//! locking is ever taken around Redis calls - the server's single
//! threaded script execution is the only synchronizer.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::config::RedisConfig;

/// Shared Redis client wrapper.
#[derive(Clone)]
pub struct Kv {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl Kv {
    /// Open the client and establish the managed connection.
    pub async fn connect(config: &RedisConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager = client.get_connection_manager().await?;
        tracing::info!(url = %config.url, "Redis connection established");
        Ok(Self {
            manager,
            op_timeout: Duration::from_millis(config.op_timeout_ms),
        })
    }

    /// Clone of the managed connection for direct command use.
    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Deadline applied to every single K/V operation.
    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// PING round-trip.
    pub async fn health_check(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<()>(&mut conn).await
    }

    /// SET key value NX EX ttl. Returns true when the key was absent
    /// (i.e. this caller owns the marker now).
    pub async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, redis::RedisError> {
        let mut conn = self.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.conn();
        conn.get(key).await
    }

    pub async fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn();
        conn.set_ex(key, value, ttl.as_secs().max(1)).await
    }

    pub async fn del(&self, keys: &[String]) -> Result<(), redis::RedisError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        conn.del(keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    // Requires a running Redis instance.

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_set_nx_ex_first_wins() {
        let kv = Kv::connect(&RedisConfig::default()).await.unwrap();
        let key = format!("test:nx:{}", uuid::Uuid::new_v4());

        let first = kv
            .set_nx_ex(&key, "1", Duration::from_secs(5))
            .await
            .unwrap();
        let second = kv
            .set_nx_ex(&key, "1", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }
}
