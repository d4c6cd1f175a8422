//! Broker topology
//!
//! Declared idempotently at startup and again after every reconnect.
//! The payment-window timeout is built from stock broker features: the
//! delay queue has a per-queue TTL and dead-letters back into the main
//! exchange as `spike.order.expired`, so expiry survives process
//! restarts without any in-process timer.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};

use super::MqError;
use crate::config::MqConfig;

// Exchanges
pub const EXCHANGE: &str = "spike.exchange";
pub const DELAY_EXCHANGE: &str = "spike.delay.exchange";
pub const DLX_EXCHANGE: &str = "spike.dlx.exchange";

// Queues
pub const ORDER_QUEUE: &str = "spike.order.queue";
pub const ORDER_DELAY_QUEUE: &str = "spike.order.delay.queue";
pub const STOCK_RESTORE_QUEUE: &str = "spike.stock.restore.queue";
pub const NOTIFICATION_QUEUE: &str = "spike.notification.queue";
pub const DLX_QUEUE: &str = "spike.dlx.queue";

// Routing keys that are not message kinds
pub const DELAY_ORDER_BINDING: &str = "delay.order.*";
pub const DELAY_ORDER_RK: &str = "delay.order.expire";
pub const FAILED_ORDER_RK: &str = "failed.order";
pub const FAILED_BINDING: &str = "failed.*";
pub const ORDER_EXPIRED_RK: &str = "spike.order.expired";

/// Declare every exchange, queue and binding. Safe to repeat.
pub async fn declare(channel: &Channel, config: &MqConfig) -> Result<(), MqError> {
    let durable_topic = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(
            EXCHANGE,
            ExchangeKind::Topic,
            durable_topic,
            FieldTable::default(),
        )
        .await?;
    channel
        .exchange_declare(
            DELAY_EXCHANGE,
            ExchangeKind::Topic,
            durable_topic,
            FieldTable::default(),
        )
        .await?;
    channel
        .exchange_declare(
            DLX_EXCHANGE,
            ExchangeKind::Topic,
            durable_topic,
            FieldTable::default(),
        )
        .await?;

    let durable_queue = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };

    // Main order queue: failures dead-letter to the DLX.
    let mut order_args = FieldTable::default();
    order_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(DLX_EXCHANGE.into()),
    );
    order_args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(FAILED_ORDER_RK.into()),
    );
    channel
        .queue_declare(ORDER_QUEUE, durable_queue, order_args)
        .await?;
    for key in ["spike.order.created", "spike.order.paid"] {
        channel
            .queue_bind(
                ORDER_QUEUE,
                EXCHANGE,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    // Delay queue: nobody consumes it; the broker TTL machinery
    // dead-letters each message back into the main exchange as an
    // order-expired event after the payment window.
    let mut delay_args = FieldTable::default();
    delay_args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(config.delay_queue_ttl_ms as i64),
    );
    delay_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(EXCHANGE.into()),
    );
    delay_args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(ORDER_EXPIRED_RK.into()),
    );
    channel
        .queue_declare(ORDER_DELAY_QUEUE, durable_queue, delay_args)
        .await?;
    channel
        .queue_bind(
            ORDER_DELAY_QUEUE,
            DELAY_EXCHANGE,
            DELAY_ORDER_BINDING,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    // Compensation queue.
    channel
        .queue_declare(STOCK_RESTORE_QUEUE, durable_queue, FieldTable::default())
        .await?;
    for key in [
        "spike.order.expired",
        "spike.order.cancelled",
        "spike.stock.restore",
    ] {
        channel
            .queue_bind(
                STOCK_RESTORE_QUEUE,
                EXCHANGE,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    // Notifications.
    channel
        .queue_declare(NOTIFICATION_QUEUE, durable_queue, FieldTable::default())
        .await?;
    for key in ["notification.send", "notification.order.confirmation"] {
        channel
            .queue_bind(
                NOTIFICATION_QUEUE,
                EXCHANGE,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    // Dead letters.
    channel
        .queue_declare(DLX_QUEUE, durable_queue, FieldTable::default())
        .await?;
    channel
        .queue_bind(
            DLX_QUEUE,
            DLX_EXCHANGE,
            FAILED_BINDING,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    tracing::info!("broker topology declared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_publish_key_matches_binding() {
        // "delay.order.*" must cover the key producers publish with.
        let binding_words: Vec<&str> = DELAY_ORDER_BINDING.split('.').collect();
        let publish_words: Vec<&str> = DELAY_ORDER_RK.split('.').collect();
        assert_eq!(binding_words.len(), publish_words.len());
        for (b, p) in binding_words.iter().zip(&publish_words) {
            assert!(*b == "*" || b == p);
        }
    }

    #[test]
    fn test_failed_binding_covers_dlx_key() {
        assert!(FAILED_ORDER_RK.starts_with("failed."));
        assert_eq!(FAILED_BINDING, "failed.*");
    }
}
