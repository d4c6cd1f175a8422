//! Reconciliation consumers
//!
//! The asynchronous side of the pipeline. Every handler assumes
//! at-least-once delivery and re-checks state inside its transaction;
//! the durable idempotency anchors are the UNIQUE `idempotency_key`
//! column and the `processed:` / `completed:` markers in Redis.
//!
//! Fast-counter restores happen outside the transaction: Postgres is
//! the source of truth, and a Redis failure there must not fail the
//! ack (the counter self-repairs on the next warmup).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::config::SpikeConfig;
use crate::kv::Kv;
use crate::mq::consumer::{HandlerError, HandlerResult, MessageHandler};
use crate::mq::message::{
    Message, MessageKind, NotificationSend, OrderCreated, OrderLifecycle, OrderPaid, RawMessage,
};
use crate::mq::Producer;
use crate::repository::{
    CachedInventoryRepository, InventoryRepository, RepoError, SpikeEventRepository,
    SpikeOrderRepository,
};
use crate::repository::orders::NewSpikeOrder;
use crate::models::SpikeOrderStatus;
use crate::stock::FastStockStore;

fn processed_key(idempotency_key: &str) -> String {
    format!("processed:{}", idempotency_key)
}

fn completed_key(idempotency_key: &str) -> String {
    format!("completed:{}", idempotency_key)
}

/// Stage-scoped markers for the compensation handlers, so an expiry
/// and a cancellation of the same order do not shadow each other.
fn stage_completed_key(stage: &str, idempotency_key: &str) -> String {
    format!("completed:{}:{}", stage, idempotency_key)
}

/// TTL of the inventory/product read cache the handlers invalidate.
const WRITE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Handler for `spike.order.queue` (order.created + order.paid).
pub struct OrderQueueHandler {
    pool: Arc<PgPool>,
    kv: Kv,
    stock: FastStockStore,
    producer: Arc<Producer>,
    cache: CachedInventoryRepository,
    config: SpikeConfig,
}

impl OrderQueueHandler {
    pub fn new(
        pool: Arc<PgPool>,
        kv: Kv,
        producer: Arc<Producer>,
        config: SpikeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            stock: FastStockStore::new(kv.clone()),
            cache: CachedInventoryRepository::new(kv.clone(), WRITE_CACHE_TTL),
            kv,
            producer,
            config,
        })
    }

    fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.config.idempotency_ttl_secs)
    }

    /// Reconcile one won slot into Postgres.
    async fn on_created(&self, msg: &RawMessage) -> HandlerResult {
        let data: OrderCreated = msg
            .decode_data()
            .map_err(HandlerError::non_retryable)?;
        let key = &data.idempotency_key;

        // Fast duplicate path: a completed marker means a prior
        // delivery committed. The marker is advisory; the UNIQUE
        // idempotency_key below is the durable guard.
        match self.kv.get_string(&completed_key(key)).await {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => {}
            Err(e) => return Err(HandlerError::retryable(e)),
        }
        if let Err(e) = self
            .kv
            .set_nx_ex(&processed_key(key), "1", self.idempotency_ttl())
            .await
        {
            return Err(HandlerError::retryable(e));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(HandlerError::retryable)?;

        // Re-check the event under its row lock.
        let event = SpikeEventRepository::get_for_update(&mut *tx, data.spike_event_id)
            .await
            .map_err(HandlerError::retryable)?;
        let Some(event) = event else {
            self.compensate_fast(&data).await;
            return Err(HandlerError::non_retryable(format!(
                "spike event {} vanished",
                data.spike_event_id
            )));
        };
        if !event.is_active(Utc::now()) {
            self.compensate_fast(&data).await;
            return Err(HandlerError::non_retryable(format!(
                "spike event {} no longer active",
                event.id
            )));
        }

        // Never oversell, even if the fast path over-admitted after a
        // warmup/DB skew.
        if event.sold_count + data.quantity > event.spike_stock {
            self.compensate_fast(&data).await;
            return Err(HandlerError::non_retryable(format!(
                "event {} would oversell: sold {} + {} > stock {}",
                event.id, event.sold_count, data.quantity, event.spike_stock
            )));
        }

        if let Err(e) =
            SpikeEventRepository::increment_sold_count(&mut *tx, event.id, data.quantity).await
        {
            return match e {
                // The guard re-fired under the lock: oversell race.
                RepoError::Conflict(reason) => {
                    self.compensate_fast(&data).await;
                    Err(HandlerError::non_retryable(reason))
                }
                other => Err(HandlerError::retryable(other)),
            };
        }

        let new_order = NewSpikeOrder {
            spike_event_id: data.spike_event_id,
            user_id: data.user_id,
            quantity: data.quantity,
            spike_price: data.spike_price,
            total_amount: data.total_amount,
            idempotency_key: key.clone(),
            expire_at: data.expire_at,
        };
        match SpikeOrderRepository::insert(&mut *tx, &new_order).await {
            Ok(_) => {}
            // Another delivery already created this order.
            Err(RepoError::Duplicate(_)) => return Ok(()),
            Err(e) => return Err(HandlerError::retryable(e)),
        }

        if let Err(e) =
            InventoryRepository::consume_stock(&mut *tx, data.product_id, data.quantity).await
        {
            return match e {
                RepoError::Conflict(reason) => {
                    self.compensate_fast(&data).await;
                    Err(HandlerError::non_retryable(reason))
                }
                other => Err(HandlerError::retryable(other)),
            };
        }

        tx.commit().await.map_err(HandlerError::retryable)?;

        // The conditional UPDATE touched the inventory row; drop its
        // cache entry so readers fall through to Postgres.
        self.cache
            .invalidate_inventory_by_product(data.product_id)
            .await;

        if let Err(e) = self
            .kv
            .set_ex(&completed_key(key), "1", self.idempotency_ttl())
            .await
        {
            tracing::warn!(key = %key, error = %e, "completed marker write failed");
        }

        // Schedule the expiry sweep: the broker TTL republishes this
        // as spike.order.expired after the payment window.
        let expiry = Message::new(
            MessageKind::OrderExpired,
            msg.trace_id.clone(),
            OrderLifecycle {
                spike_event_id: data.spike_event_id,
                user_id: data.user_id,
                product_id: data.product_id,
                quantity: data.quantity,
                idempotency_key: key.clone(),
                reason: "payment window elapsed".to_string(),
            },
        );
        if let Err(e) = self.producer.publish_delayed(&expiry).await {
            // The order still expires correctly: CanPay() checks
            // expire_at, and the next warmup resyncs the counter.
            tracing::error!(key = %key, error = %e, "expiry scheduling failed");
        }

        // Best-effort confirmation notification.
        let note = Message::new(
            MessageKind::OrderConfirmation,
            msg.trace_id.clone(),
            NotificationSend {
                user_id: data.user_id,
                subject: "spike order reserved".to_string(),
                body: format!(
                    "order for event {} reserved, pay before {}",
                    data.spike_event_id, data.expire_at
                ),
            },
        );
        if let Err(e) = self.producer.publish(&note).await {
            tracing::warn!(key = %key, error = %e, "confirmation notification failed");
        }

        tracing::info!(
            event_id = data.spike_event_id,
            user_id = data.user_id,
            key = %key,
            "spike order reconciled"
        );
        Ok(())
    }

    /// Link the paid ordinary order; state guards make replays no-ops.
    async fn on_paid(&self, msg: &RawMessage) -> HandlerResult {
        let data: OrderPaid = msg
            .decode_data()
            .map_err(HandlerError::non_retryable)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(HandlerError::retryable)?;

        let order = SpikeOrderRepository::get_by_key_for_update(&mut *tx, &data.idempotency_key)
            .await
            .map_err(HandlerError::retryable)?;
        let Some(order) = order else {
            return Err(HandlerError::non_retryable(format!(
                "no spike order for idempotency key {}",
                data.idempotency_key
            )));
        };

        let paid = SpikeOrderRepository::mark_paid(&mut *tx, order.id, data.order_id)
            .await
            .map_err(HandlerError::retryable)?;
        tx.commit().await.map_err(HandlerError::retryable)?;

        if !paid {
            tracing::warn!(
                order_id = order.id,
                status = %order.status,
                "paid event for an order outside its payment window"
            );
        }
        Ok(())
    }

    /// Best-effort fast-counter restore on a non-retryable failure.
    async fn compensate_fast(&self, data: &OrderCreated) {
        if let Err(e) = self
            .stock
            .restore(data.spike_event_id, data.user_id, data.quantity)
            .await
        {
            tracing::error!(
                event_id = data.spike_event_id,
                user_id = data.user_id,
                error = %e,
                "fast counter compensation failed"
            );
        }
    }
}

#[async_trait]
impl MessageHandler for OrderQueueHandler {
    async fn handle(&self, msg: &RawMessage) -> HandlerResult {
        match msg.kind {
            MessageKind::OrderCreated => self.on_created(msg).await,
            MessageKind::OrderPaid => self.on_paid(msg).await,
            other => Err(HandlerError::non_retryable(format!(
                "unexpected kind {} on order queue",
                other
            ))),
        }
    }
}

/// Handler for `spike.stock.restore.queue` (expired / cancelled /
/// stock.restore).
pub struct StockRestoreHandler {
    pool: Arc<PgPool>,
    kv: Kv,
    stock: FastStockStore,
    cache: CachedInventoryRepository,
    config: SpikeConfig,
}

impl StockRestoreHandler {
    pub fn new(pool: Arc<PgPool>, kv: Kv, config: SpikeConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            stock: FastStockStore::new(kv.clone()),
            cache: CachedInventoryRepository::new(kv.clone(), WRITE_CACHE_TTL),
            kv,
            config,
        })
    }

    /// Shared compensation entry point. The stage marker is an atomic
    /// NX claim so concurrent duplicate deliveries cannot both run;
    /// a failed run releases the claim so redelivery retries.
    async fn compensate(&self, stage: &str, msg: &RawMessage) -> HandlerResult {
        let data: OrderLifecycle = msg
            .decode_data()
            .map_err(HandlerError::non_retryable)?;
        let marker = stage_completed_key(stage, &data.idempotency_key);

        let claimed = self
            .kv
            .set_nx_ex(
                &marker,
                "1",
                Duration::from_secs(self.config.idempotency_ttl_secs),
            )
            .await
            .map_err(HandlerError::retryable)?;
        if !claimed {
            return Ok(());
        }

        let result = self.run_compensation(&data, msg).await;
        if result.is_err() {
            if let Err(e) = self.kv.del(&[marker.clone()]).await {
                // Worst case the claim sticks until its TTL; the DLQ
                // entry makes the skipped restore visible to ops.
                tracing::error!(marker = %marker, error = %e, "claim release failed");
            }
        }
        result
    }

    /// The compensation transaction; the order-status flip inside it
    /// is what actually decides whether stock flows back.
    async fn run_compensation(&self, data: &OrderLifecycle, msg: &RawMessage) -> HandlerResult {
        let key = &data.idempotency_key;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(HandlerError::retryable)?;

        // The prior order status decides everything. Compensation
        // happens exactly once: on the pending -> {expired, cancelled}
        // transition.
        let should_restore = match msg.kind {
            MessageKind::OrderExpired | MessageKind::OrderCancelled => {
                let order = SpikeOrderRepository::get_by_key_for_update(&mut *tx, key)
                    .await
                    .map_err(HandlerError::retryable)?;
                let Some(order) = order else {
                    return Err(HandlerError::non_retryable(format!(
                        "no spike order for idempotency key {}",
                        key
                    )));
                };

                match (msg.kind, order.status) {
                    // The only transitions that release stock.
                    (MessageKind::OrderExpired, SpikeOrderStatus::Pending) => {
                        SpikeOrderRepository::mark_expired(&mut *tx, order.id)
                            .await
                            .map_err(HandlerError::retryable)?
                    }
                    (MessageKind::OrderCancelled, SpikeOrderStatus::Pending) => {
                        SpikeOrderRepository::mark_cancelled(&mut *tx, order.id)
                            .await
                            .map_err(HandlerError::retryable)?
                    }
                    // Cancelling an expired order: stock already went
                    // back on expiry, only the status flips.
                    (MessageKind::OrderCancelled, SpikeOrderStatus::Expired) => {
                        SpikeOrderRepository::mark_cancelled(&mut *tx, order.id)
                            .await
                            .map_err(HandlerError::retryable)?;
                        false
                    }
                    // Paid, or already in the target state: nothing to do.
                    _ => {
                        tracing::debug!(
                            key = %key,
                            status = %order.status,
                            kind = %msg.kind,
                            "compensation skipped, order already settled"
                        );
                        false
                    }
                }
            }
            // Operational restore carries no order; the stage marker
            // is its only idempotency guard.
            MessageKind::StockRestore => true,
            other => {
                return Err(HandlerError::non_retryable(format!(
                    "unexpected kind {} on restore queue",
                    other
                )));
            }
        };

        if should_restore {
            let decremented =
                SpikeEventRepository::decrement_sold_count(&mut *tx, data.spike_event_id, data.quantity)
                    .await
                    .map_err(HandlerError::retryable)?;
            if decremented {
                if let Err(e) = InventoryRepository::adjust_stock(
                    &mut *tx,
                    data.product_id,
                    data.quantity,
                    &data.reason,
                )
                .await
                {
                    return match e {
                        RepoError::Conflict(reason) => Err(HandlerError::non_retryable(reason)),
                        other => Err(HandlerError::retryable(other)),
                    };
                }
            } else {
                tracing::warn!(key = %key, "sold_count already below quantity, restore was done before");
            }
        }

        tx.commit().await.map_err(HandlerError::retryable)?;

        if should_restore {
            self.cache
                .invalidate_inventory_by_product(data.product_id)
                .await;

            // Outside the transaction on purpose: Postgres is settled
            // truth, a Redis failure here must not fail the ack.
            if let Err(e) = self
                .stock
                .restore(data.spike_event_id, data.user_id, data.quantity)
                .await
            {
                tracing::error!(
                    event_id = data.spike_event_id,
                    user_id = data.user_id,
                    error = %e,
                    "fast counter restore failed, next warmup will resync"
                );
            }
        }

        tracing::info!(
            key = %key,
            kind = %msg.kind,
            restored = should_restore,
            "compensation handled"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for StockRestoreHandler {
    async fn handle(&self, msg: &RawMessage) -> HandlerResult {
        match msg.kind {
            MessageKind::OrderExpired => self.compensate("expired", msg).await,
            MessageKind::OrderCancelled => self.compensate("cancelled", msg).await,
            MessageKind::StockRestore => self.compensate("restore", msg).await,
            other => Err(HandlerError::non_retryable(format!(
                "unexpected kind {} on restore queue",
                other
            ))),
        }
    }
}

/// Handler for `spike.notification.queue`. Actual fan-out (mail, push)
/// is an external collaborator; this stage validates and records.
pub struct NotificationHandler;

impl NotificationHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl MessageHandler for NotificationHandler {
    async fn handle(&self, msg: &RawMessage) -> HandlerResult {
        let data: NotificationSend = msg
            .decode_data()
            .map_err(HandlerError::non_retryable)?;
        tracing::info!(
            user_id = data.user_id,
            subject = %data.subject,
            trace_id = %msg.trace_id,
            "notification dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_key_layout() {
        assert_eq!(processed_key("abc"), "processed:abc");
        assert_eq!(completed_key("abc"), "completed:abc");
        assert_eq!(
            stage_completed_key("expired", "abc"),
            "completed:expired:abc"
        );
    }
}
