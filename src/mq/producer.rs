//! Confirming producer
//!
//! Two publish modes over the shared channel pool:
//!
//! - direct: one message, one publisher confirm, fixed-interval retry
//!   on publish error or broker nack;
//! - batched: a bounded queue flushed by size or interval, confirms
//!   correlated to the in-flight batch. The bounded queue is the
//!   producer-side backpressure surface.

use std::sync::Arc;
use std::time::Duration;

use lapin::BasicProperties;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use super::connection::{ChannelPool, MqConnection};
use super::message::Message;
use super::topology::{DELAY_EXCHANGE, DELAY_ORDER_RK, EXCHANGE};
use super::MqError;
use crate::config::MqConfig;

/// AMQP delivery mode 2 = persistent.
const PERSISTENT: u8 = 2;

pub struct Producer {
    pool: ChannelPool,
    config: MqConfig,
}

impl Producer {
    pub fn new(conn: Arc<MqConnection>, config: MqConfig) -> Arc<Self> {
        let pool = ChannelPool::new(conn, config.channel_pool_size, true);
        Arc::new(Self { pool, config })
    }

    /// Publish a typed message to the main exchange under its kind's
    /// routing key, waiting for the broker confirm.
    pub async fn publish<T: Serialize + DeserializeOwned>(
        &self,
        msg: &Message<T>,
    ) -> Result<(), MqError> {
        self.publish_raw(EXCHANGE, msg.kind.routing_key(), &msg.to_json()?)
            .await
    }

    /// Publish into the delay exchange; the broker re-emits the
    /// message as `spike.order.expired` after the queue TTL.
    pub async fn publish_delayed<T: Serialize + DeserializeOwned>(
        &self,
        msg: &Message<T>,
    ) -> Result<(), MqError> {
        self.publish_raw(DELAY_EXCHANGE, DELAY_ORDER_RK, &msg.to_json()?)
            .await
    }

    /// Retrying confirmed publish of a raw payload.
    pub async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), MqError> {
        let interval = Duration::from_millis(self.config.retry_interval_ms);
        let mut last_err = MqError::Publish("no attempt made".to_string());

        for attempt in 0..=self.config.max_retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            match self.try_publish(exchange, routing_key, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        exchange,
                        routing_key,
                        attempt,
                        error = %e,
                        "publish attempt failed"
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn try_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), MqError> {
        let publish_timeout = Duration::from_millis(self.config.publish_timeout_ms);
        let confirm_timeout = Duration::from_millis(self.config.confirm_timeout_ms);

        let channel = self.pool.checkout(publish_timeout).await?;

        let outcome: Result<(), MqError> = async {
            let confirm = tokio::time::timeout(
                publish_timeout,
                channel.basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    BasicProperties::default().with_delivery_mode(PERSISTENT),
                ),
            )
            .await
            .map_err(|_| MqError::Timeout("publish".to_string()))??;

            let confirmation = tokio::time::timeout(confirm_timeout, confirm)
                .await
                .map_err(|_| MqError::Timeout("publisher confirm".to_string()))?
                .map_err(MqError::from)?;

            match confirmation {
                Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
                Confirmation::Nack(_) => Err(MqError::Nacked),
            }
        }
        .await;

        match outcome {
            Ok(()) => {
                self.pool.checkin(channel).await;
                Ok(())
            }
            // Errored channels are dropped, not returned to the pool.
            Err(e) => Err(e),
        }
    }

    /// Spawn the batching task and return its submission handle.
    pub fn start_batcher(self: &Arc<Self>) -> BatchSender {
        let (tx, rx) = mpsc::channel(self.config.batch_size * 2);
        let producer = Arc::clone(self);
        tokio::spawn(async move {
            producer.run_batcher(rx).await;
        });
        BatchSender { tx }
    }

    async fn run_batcher(self: Arc<Self>, mut rx: mpsc::Receiver<PendingPublish>) {
        let flush_interval = Duration::from_millis(self.config.batch_flush_interval_ms);
        let mut pending: Vec<PendingPublish> = Vec::with_capacity(self.config.batch_size);
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(item) => {
                            pending.push(item);
                            if pending.len() >= self.config.batch_size {
                                self.flush(&mut pending).await;
                            }
                        }
                        // All senders dropped: flush what is left and stop.
                        None => {
                            self.flush(&mut pending).await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush(&mut pending).await;
                }
            }
        }
    }

    /// Publish a whole batch over one channel, then collect confirms
    /// in order. Per-message failures fall back to the retrying direct
    /// path before the submitter is told the outcome.
    async fn flush(&self, pending: &mut Vec<PendingPublish>) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        let confirm_timeout = Duration::from_millis(self.config.confirm_timeout_ms);
        let publish_timeout = Duration::from_millis(self.config.publish_timeout_ms);

        let channel = match self.pool.checkout(publish_timeout).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(error = %e, "batch flush could not obtain a channel");
                for item in batch {
                    self.finish_slow_path(item).await;
                }
                return;
            }
        };

        let mut in_flight = Vec::with_capacity(batch.len());
        for item in batch {
            let publish = channel
                .basic_publish(
                    &item.exchange,
                    &item.routing_key,
                    BasicPublishOptions::default(),
                    &item.payload,
                    BasicProperties::default().with_delivery_mode(PERSISTENT),
                )
                .await;
            match publish {
                Ok(confirm) => in_flight.push((item, Some(confirm))),
                Err(e) => {
                    tracing::warn!(error = %e, "batched publish failed, retrying directly");
                    in_flight.push((item, None));
                }
            }
        }

        let mut channel_ok = true;
        for (item, confirm) in in_flight {
            let confirmed = match confirm {
                Some(confirm) => match tokio::time::timeout(confirm_timeout, confirm).await {
                    Ok(Ok(Confirmation::Ack(_) | Confirmation::NotRequested)) => true,
                    Ok(Ok(Confirmation::Nack(_))) | Ok(Err(_)) | Err(_) => false,
                },
                None => false,
            };
            if confirmed {
                let _ = item.done.send(Ok(()));
            } else {
                channel_ok = false;
                self.finish_slow_path(item).await;
            }
        }

        if channel_ok {
            self.pool.checkin(channel).await;
        }
    }

    /// Last resort for a batch member: the direct retrying publish.
    async fn finish_slow_path(&self, item: PendingPublish) {
        let result = self
            .publish_raw(&item.exchange, &item.routing_key, &item.payload)
            .await;
        let _ = item.done.send(result);
    }
}

struct PendingPublish {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    done: oneshot::Sender<Result<(), MqError>>,
}

/// Handle for submitting messages to the batching task. Blocks when
/// the batch queue is full (backpressure).
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<PendingPublish>,
}

impl BatchSender {
    pub async fn publish<T: Serialize + DeserializeOwned>(
        &self,
        msg: &Message<T>,
    ) -> Result<(), MqError> {
        let payload = msg.to_json()?;
        let (done, outcome) = oneshot::channel();
        self.tx
            .send(PendingPublish {
                exchange: EXCHANGE.to_string(),
                routing_key: msg.kind.routing_key().to_string(),
                payload,
                done,
            })
            .await
            .map_err(|_| MqError::Publish("batcher stopped".to_string()))?;

        outcome
            .await
            .map_err(|_| MqError::Publish("batcher dropped the message".to_string()))?
    }
}
