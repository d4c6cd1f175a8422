//! Worker-pool consumer
//!
//! Per queue, N workers each hold their own channel with the
//! configured prefetch and share nothing else. A worker deserializes,
//! runs the registered handler under a deadline, retries retryable
//! failures in-process, and finally nacks without requeue so the
//! broker routes the delivery to the DLX (when the queue has one).
//!
//! `HandlerError::NonRetryable` skips the retry loop entirely, as do
//! deadline overruns - redelivering a poison message only burns the
//! budget again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, BasicRejectOptions,
};
use lapin::types::FieldTable;
use thiserror::Error;

use super::connection::MqConnection;
use super::message::RawMessage;
use crate::config::MqConfig;

/// Failure sum type the worker branches on without string sniffing.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient (broker hiccup, SQL deadlock, timeout downstream):
    /// worth retrying in-process.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The message can never succeed (event inactive, would oversell,
    /// poison payload): straight to the DLQ.
    #[error("non-retryable: {0}")]
    NonRetryable(String),
}

impl HandlerError {
    pub fn retryable(e: impl std::fmt::Display) -> Self {
        HandlerError::Retryable(e.to_string())
    }

    pub fn non_retryable(e: impl std::fmt::Display) -> Self {
        HandlerError::NonRetryable(e.to_string())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// A queue's message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &RawMessage) -> HandlerResult;
}

/// Spawns and owns the workers of the consumed queues.
pub struct ConsumerPool {
    conn: Arc<MqConnection>,
    config: MqConfig,
}

impl ConsumerPool {
    pub fn new(conn: Arc<MqConnection>, config: MqConfig) -> Self {
        Self { conn, config }
    }

    /// Start `workers_per_queue` workers for `queue`. Workers run for
    /// the process lifetime and re-acquire their channel on loss.
    pub fn start(&self, queue: &'static str, handler: Arc<dyn MessageHandler>) {
        for worker_id in 0..self.config.workers_per_queue {
            let worker = Worker {
                conn: Arc::clone(&self.conn),
                config: self.config.clone(),
                queue,
                worker_id,
                handler: Arc::clone(&handler),
            };
            tokio::spawn(async move { worker.run().await });
        }
        tracing::info!(
            queue,
            workers = self.config.workers_per_queue,
            "consumer workers started"
        );
    }
}

struct Worker {
    conn: Arc<MqConnection>,
    config: MqConfig,
    queue: &'static str,
    worker_id: usize,
    handler: Arc<dyn MessageHandler>,
}

impl Worker {
    async fn run(&self) {
        loop {
            match self.consume_stream().await {
                Ok(()) => {
                    tracing::warn!(
                        queue = self.queue,
                        worker = self.worker_id,
                        "delivery stream ended, re-subscribing"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        queue = self.queue,
                        worker = self.worker_id,
                        error = %e,
                        "consumer worker error, re-subscribing"
                    );
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.reconnect_backoff_ms)).await;
        }
    }

    /// One channel, one subscription, until either dies.
    async fn consume_stream(&self) -> Result<(), super::MqError> {
        let channel = self.conn.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        let tag = format!("{}-worker-{}", self.queue, self.worker_id);
        let mut deliveries = channel
            .basic_consume(
                self.queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = deliveries.next().await {
            let delivery = delivery?;
            self.process(delivery).await;
        }
        Ok(())
    }

    async fn process(&self, delivery: lapin::message::Delivery) {
        let msg = match RawMessage::from_json(&delivery.data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(
                    queue = self.queue,
                    error = %e,
                    "undecodable delivery, dead-lettering"
                );
                self.discard(&delivery).await;
                return;
            }
        };

        let deadline = Duration::from_millis(self.config.consume_timeout_ms);
        let interval = Duration::from_millis(self.config.retry_interval_ms);

        let mut attempt = 0u32;
        loop {
            let outcome = tokio::time::timeout(deadline, self.handler.handle(&msg)).await;
            match outcome {
                Ok(Ok(())) => {
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        tracing::error!(queue = self.queue, error = %e, "ack failed");
                    }
                    return;
                }
                Ok(Err(HandlerError::NonRetryable(reason))) => {
                    tracing::warn!(
                        queue = self.queue,
                        message_id = %msg.id,
                        reason = %reason,
                        "non-retryable failure, dead-lettering"
                    );
                    self.discard(&delivery).await;
                    return;
                }
                Ok(Err(HandlerError::Retryable(reason))) => {
                    attempt += 1;
                    if attempt > self.config.max_retry_attempts {
                        tracing::error!(
                            queue = self.queue,
                            message_id = %msg.id,
                            attempts = attempt,
                            reason = %reason,
                            "retries exhausted, dead-lettering"
                        );
                        self.discard(&delivery).await;
                        return;
                    }
                    tracing::warn!(
                        queue = self.queue,
                        message_id = %msg.id,
                        attempt,
                        reason = %reason,
                        "handler failed, retrying"
                    );
                    tokio::time::sleep(interval).await;
                }
                // Deadline overrun counts as non-retryable here.
                Err(_) => {
                    tracing::error!(
                        queue = self.queue,
                        message_id = %msg.id,
                        "handler exceeded deadline, dead-lettering"
                    );
                    self.discard(&delivery).await;
                    return;
                }
            }
        }
    }

    /// Remove the delivery from the queue without requeueing; with DLQ
    /// enabled the broker routes it to the DLX configured on the queue.
    async fn discard(&self, delivery: &lapin::message::Delivery) {
        let result = if self.config.dlq_enabled {
            delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
        } else {
            delivery
                .reject(BasicRejectOptions { requeue: false })
                .await
        };
        if let Err(e) = result {
            tracing::error!(queue = self.queue, error = %e, "discard failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_constructors() {
        let retryable = HandlerError::retryable("db deadlock");
        assert!(matches!(retryable, HandlerError::Retryable(_)));

        let fatal = HandlerError::non_retryable("event inactive");
        assert!(matches!(fatal, HandlerError::NonRetryable(_)));
        assert_eq!(fatal.to_string(), "non-retryable: event inactive");
    }
}
