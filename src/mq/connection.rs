//! Managed AMQP connection and channel pool
//!
//! The connection lives behind a read-write lock: publishes and
//! channel creation share it read-mostly, reconnection takes the write
//! side. Topology is re-declared after every successful reconnect
//! (declaration is idempotent). When reconnection exhausts its budget
//! the error is fatal and the process must exit non-zero.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use lapin::options::ConfirmSelectOptions;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{Mutex, RwLock};

use super::MqError;
use super::topology;
use crate::config::MqConfig;

/// Shared AMQP connection with reconnect.
pub struct MqConnection {
    config: MqConfig,
    inner: RwLock<Connection>,
}

impl MqConnection {
    /// Establish the initial connection and declare the topology.
    pub async fn connect(config: &MqConfig) -> Result<Arc<Self>, MqError> {
        let connection = Self::connect_raw(&config.url).await?;

        let channel = connection.create_channel().await?;
        topology::declare(&channel, config).await?;
        let _ = channel.close(0, "topology declared").await;

        tracing::info!(url = %config.url, "AMQP connection established");
        Ok(Arc::new(Self {
            config: config.clone(),
            inner: RwLock::new(connection),
        }))
    }

    async fn connect_raw(url: &str) -> Result<Connection, MqError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        Connection::connect(url, properties)
            .await
            .map_err(|e| MqError::Connect(e.to_string()))
    }

    /// Open a channel, transparently reconnecting first if the
    /// connection has dropped.
    pub async fn create_channel(&self) -> Result<Channel, MqError> {
        {
            let guard = self.inner.read().await;
            if guard.status().connected() {
                match guard.create_channel().await {
                    Ok(channel) => return Ok(channel),
                    Err(e) => {
                        tracing::warn!(error = %e, "channel creation failed, reconnecting");
                    }
                }
            }
        }

        self.reconnect().await?;
        let guard = self.inner.read().await;
        guard
            .create_channel()
            .await
            .map_err(|e| MqError::Connect(e.to_string()))
    }

    /// Reconnect with capped exponential backoff. Returns
    /// `MqError::Unrecoverable` once the attempt budget is spent.
    pub async fn reconnect(&self) -> Result<(), MqError> {
        let mut guard = self.inner.write().await;
        if guard.status().connected() {
            // Another task already reconnected while we waited.
            return Ok(());
        }

        let mut backoff = Duration::from_millis(self.config.reconnect_backoff_ms);
        let backoff_max = Duration::from_millis(self.config.reconnect_backoff_max_ms);

        for attempt in 1..=self.config.max_reconnect_attempts {
            tracing::warn!(attempt, "reconnecting to broker");
            match Self::connect_raw(&self.config.url).await {
                Ok(connection) => {
                    // Re-declare topology on the fresh connection.
                    let channel = connection.create_channel().await?;
                    topology::declare(&channel, &self.config).await?;
                    let _ = channel.close(0, "topology declared").await;

                    *guard = connection;
                    tracing::info!(attempt, "broker connection re-established");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "reconnect attempt failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(backoff_max);
                }
            }
        }

        // Fatal: without the broker neither admission compensation nor
        // reconciliation can make progress. Dying loudly hands the
        // unacked deliveries to a healthy replica.
        tracing::error!(
            attempts = self.config.max_reconnect_attempts,
            "broker connection unrecoverable, exiting"
        );
        std::process::exit(1);
    }
}

/// Check-out / check-in channel pool for producers.
///
/// Channels found dead at checkout are discarded; check-in drops any
/// channel above capacity or no longer connected, so errors never park
/// a poisoned channel back in the pool.
pub struct ChannelPool {
    conn: Arc<MqConnection>,
    idle: Mutex<VecDeque<Channel>>,
    capacity: usize,
    confirm_mode: bool,
}

impl ChannelPool {
    pub fn new(conn: Arc<MqConnection>, capacity: usize, confirm_mode: bool) -> Self {
        Self {
            conn,
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            confirm_mode,
        }
    }

    /// Take a live channel, creating one when the pool is dry.
    pub async fn checkout(&self, timeout: Duration) -> Result<Channel, MqError> {
        tokio::time::timeout(timeout, self.checkout_inner())
            .await
            .map_err(|_| MqError::Timeout("channel checkout".to_string()))?
    }

    async fn checkout_inner(&self) -> Result<Channel, MqError> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(channel) = idle.pop_front() {
                if channel.status().connected() {
                    return Ok(channel);
                }
                // Dead channel: fall through and try the next one.
            }
        }

        let channel = self.conn.create_channel().await?;
        if self.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }
        Ok(channel)
    }

    /// Return a channel after use. Dead or surplus channels are
    /// dropped, which closes them.
    pub async fn checkin(&self, channel: Channel) {
        if !channel.status().connected() {
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < self.capacity {
            idle.push_back(channel);
        }
    }
}
