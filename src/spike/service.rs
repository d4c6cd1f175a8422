//! Hot-path service
//!
//! The synchronous side of the spike pipeline. Admission rejections
//! are data (`ParticipateReply { success: false, .. }`), never errors;
//! errors mean infrastructure trouble and map to 5xx at the gateway.
//!
//! The hot path never writes to Postgres. Divergence between the fast
//! counter and the authoritative store is reconciled by the consumers
//! in [`super::consumers`], driven by idempotent compensating messages.

use std::sync::Arc;

use cached::proc_macro::cached;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use utoipa::ToSchema;
use validator::Validate;

use crate::config::{LimiterConfig, SpikeConfig};
use crate::core_types::{EventId, SpikeOrderId, UserId};
use crate::error::SpikeError;
use crate::kv::Kv;
use crate::limiter::AdmissionGate;
use crate::models::{Product, SpikeEvent, SpikeOrder, SpikeOrderStatus};
use crate::mq::message::{Message, MessageKind, OrderCreated, OrderLifecycle};
use crate::mq::Producer;
use crate::repository::{
    CachedInventoryRepository, EventSort, OrderStats, Page, SortOrder, SpikeEventRepository,
    SpikeOrderRepository,
};
use crate::stock::{DecrementOutcome, FastStockStore, StockInfo};

// User-visible admission messages; nothing below this layer leaks out.
pub const MSG_RATE_LIMITED: &str = "rate limited, please retry later";
pub const MSG_INACTIVE: &str = "event is not active";
pub const MSG_SOLD_OUT: &str = "sold out";
pub const MSG_ALREADY_PARTICIPATED: &str = "already participated";
pub const MSG_INSUFFICIENT: &str = "insufficient stock remaining";
pub const MSG_BUSY: &str = "system busy, please try again";
pub const MSG_WIN: &str = "win, please pay within the payment window";

/// Participation request after authentication.
#[derive(Debug, Clone, Validate)]
pub struct ParticipateCommand {
    pub spike_event_id: EventId,
    #[validate(range(min = 1, max = 10))]
    pub quantity: i64,
    #[validate(length(min = 1, max = 64))]
    pub idempotency_key: String,
}

/// Outcome of a participation attempt. `success == false` with a
/// message is an admission decision, not an error.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ParticipateReply {
    pub success: bool,
    pub message: String,
    /// Hint in seconds when the rejection was a rate limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ParticipateReply {
    fn won() -> Self {
        Self {
            success: true,
            message: MSG_WIN.to_string(),
            retry_after_secs: None,
        }
    }

    fn rejected(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            retry_after_secs: None,
        }
    }

    fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            success: false,
            message: MSG_RATE_LIMITED.to_string(),
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

/// Hot-path event lookup with a short TTL cache; the hot path must not
/// hit Postgres per request under a spike.
#[cached(
    time = 2,
    key = "i64",
    convert = r#"{ event_id }"#,
    result = true
)]
async fn load_event_cached(
    pool: Arc<PgPool>,
    event_id: EventId,
) -> Result<Option<SpikeEvent>, String> {
    SpikeEventRepository::get(&pool, event_id)
        .await
        .map_err(|e| format!("load spike event {}: {}", event_id, e))
}

/// Cached product/inventory reads keep this TTL.
const READ_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(30);

/// The spike coordinator's synchronous surface.
pub struct SpikeService {
    pool: Arc<PgPool>,
    stock: FastStockStore,
    gate: AdmissionGate,
    producer: Arc<Producer>,
    cache: CachedInventoryRepository,
    config: SpikeConfig,
}

impl SpikeService {
    pub fn new(
        pool: Arc<PgPool>,
        kv: Kv,
        producer: Arc<Producer>,
        limiter_config: &LimiterConfig,
        config: SpikeConfig,
    ) -> Self {
        Self {
            pool,
            stock: FastStockStore::new(kv.clone()),
            gate: AdmissionGate::new(kv.clone(), limiter_config),
            producer,
            cache: CachedInventoryRepository::new(kv, READ_CACHE_TTL),
            config,
        }
    }

    pub fn stock_store(&self) -> &FastStockStore {
        &self.stock
    }

    /// The hot path. Steps short-circuit on the first failure; every
    /// rejection is returned as a reply, never as an error.
    pub async fn participate(
        &self,
        user_id: UserId,
        cmd: ParticipateCommand,
        trace_id: &str,
    ) -> Result<ParticipateReply, SpikeError> {
        // 1. Validate.
        if user_id <= 0 {
            return Err(SpikeError::Unauthorized);
        }
        cmd.validate()
            .map_err(|e| SpikeError::Validation(e.to_string()))?;
        if cmd.spike_event_id <= 0 {
            return Err(SpikeError::Validation("spike_event_id must be positive".into()));
        }

        // 2. Admission: ALL_PASS(global, per-user). A limiter store
        // failure rejects the request; over-admitting is never an
        // option.
        let decision = self.gate.check(user_id, 1).await?;
        if !decision.allowed {
            return Ok(ParticipateReply::rate_limited(
                decision.retry_after.as_secs().max(1),
            ));
        }

        // 3. Event lookup through the TTL cache.
        let event = load_event_cached(Arc::clone(&self.pool), cmd.spike_event_id)
            .await
            .map_err(SpikeError::Database)?;
        let Some(event) = event else {
            return Ok(ParticipateReply::rejected(MSG_INACTIVE));
        };
        if !event.is_active(Utc::now()) {
            return Ok(ParticipateReply::rejected(MSG_INACTIVE));
        }

        // 4. Latch check before touching the counter.
        let info = self.stock.get_stock_info(event.id).await?;
        if info.sold_out {
            return Ok(ParticipateReply::rejected(MSG_SOLD_OUT));
        }

        // 5. Atomic decrement with dedup.
        let outcome = self
            .stock
            .decrement(
                event.id,
                user_id,
                cmd.quantity,
                std::time::Duration::from_secs(self.config.user_dedup_ttl_secs),
                std::time::Duration::from_secs(self.config.stock_ttl_secs),
            )
            .await?;
        match outcome {
            DecrementOutcome::Won { remaining } => {
                tracing::debug!(
                    event_id = event.id,
                    user_id,
                    remaining,
                    "fast decrement won"
                );
            }
            DecrementOutcome::SoldOut => return Ok(ParticipateReply::rejected(MSG_SOLD_OUT)),
            DecrementOutcome::AlreadyParticipated => {
                return Ok(ParticipateReply::rejected(MSG_ALREADY_PARTICIPATED));
            }
            DecrementOutcome::Insufficient { .. } => {
                return Ok(ParticipateReply::rejected(MSG_INSUFFICIENT));
            }
        }

        // 6. Publish the reservation. On failure, compensate the fast
        // counter (best-effort) and tell the user to retry.
        let total_amount = event.spike_price * Decimal::from(cmd.quantity);
        let payload = OrderCreated {
            spike_event_id: event.id,
            user_id,
            product_id: event.product_id,
            quantity: cmd.quantity,
            spike_price: event.spike_price,
            total_amount,
            idempotency_key: cmd.idempotency_key.clone(),
            expire_at: Utc::now() + ChronoDuration::seconds(self.config.order_ttl_secs as i64),
        };
        let msg = Message::new(MessageKind::OrderCreated, trace_id, payload);

        if let Err(e) = self.producer.publish(&msg).await {
            tracing::error!(
                event_id = event.id,
                user_id,
                error = %e,
                "order.created publish failed, compensating fast counter"
            );
            if let Err(restore_err) = self.stock.restore(event.id, user_id, cmd.quantity).await {
                // The expiry sweep self-repairs on the next warmup.
                tracing::error!(
                    event_id = event.id,
                    user_id,
                    error = %restore_err,
                    "compensating restore failed"
                );
            }
            return Ok(ParticipateReply::rejected(MSG_BUSY));
        }

        // 7. Done.
        Ok(ParticipateReply::won())
    }

    /// Admin warmup: preload the fast counter from authoritative
    /// stock. Idempotent overwrite; safe to repeat.
    pub async fn warmup(&self, event_id: EventId) -> Result<i64, SpikeError> {
        let event = SpikeEventRepository::get(&self.pool, event_id)
            .await?
            .ok_or_else(|| SpikeError::NotFound(format!("spike event {}", event_id)))?;

        let remaining = event.remaining();

        // The counter must outlive the event plus the payment window.
        let mut ttl_secs = self.config.stock_ttl_secs as i64;
        let until_end = (event.end_at - Utc::now()).num_seconds();
        if until_end > 0 {
            ttl_secs = ttl_secs.max(until_end + self.config.order_ttl_secs as i64);
        }

        self.stock
            .warmup(
                event_id,
                remaining,
                std::time::Duration::from_secs(ttl_secs as u64),
            )
            .await?;
        Ok(remaining)
    }

    /// Owner-checked cancellation; the actual compensation rides the
    /// broker so it shares the idempotent path with expiry.
    pub async fn cancel_order(
        &self,
        user_id: UserId,
        order_id: SpikeOrderId,
        reason: &str,
        trace_id: &str,
    ) -> Result<(), SpikeError> {
        let order = SpikeOrderRepository::get(&self.pool, order_id)
            .await?
            .ok_or_else(|| SpikeError::NotFound(format!("spike order {}", order_id)))?;

        if order.user_id != user_id {
            return Err(SpikeError::Forbidden);
        }
        if !order.can_cancel() {
            return Err(SpikeError::InvalidState(format!(
                "order in status {} cannot be cancelled",
                order.status
            )));
        }

        let event = SpikeEventRepository::get(&self.pool, order.spike_event_id)
            .await?
            .ok_or_else(|| {
                SpikeError::NotFound(format!("spike event {}", order.spike_event_id))
            })?;

        let payload = OrderLifecycle {
            spike_event_id: order.spike_event_id,
            user_id: order.user_id,
            product_id: event.product_id,
            quantity: order.quantity,
            idempotency_key: order.idempotency_key.clone(),
            reason: if reason.is_empty() {
                "cancelled by user".to_string()
            } else {
                reason.to_string()
            },
        };
        let msg = Message::new(MessageKind::OrderCancelled, trace_id, payload);
        self.producer.publish(&msg).await?;
        Ok(())
    }

    // ========================================================
    // Read side
    // ========================================================

    /// Active events with the live fast-counter remaining.
    pub async fn list_events(
        &self,
        page: Page,
        sort: EventSort,
        order: SortOrder,
    ) -> Result<Vec<(SpikeEvent, StockInfo)>, SpikeError> {
        let events = SpikeEventRepository::list_active(&self.pool, page, sort, order).await?;

        let mut out = Vec::with_capacity(events.len());
        for event in events {
            let info = self.stock.get_stock_info(event.id).await.unwrap_or(
                // A cold counter is not an error for a listing.
                StockInfo {
                    remaining: event.remaining(),
                    sold_out: event.remaining() == 0,
                },
            );
            out.push((event, info));
        }
        Ok(out)
    }

    pub async fn event_detail(
        &self,
        event_id: EventId,
    ) -> Result<(SpikeEvent, Option<Product>, StockInfo), SpikeError> {
        let event = SpikeEventRepository::get(&self.pool, event_id)
            .await?
            .ok_or_else(|| SpikeError::NotFound(format!("spike event {}", event_id)))?;

        let product = self.cache.get_product(&self.pool, event.product_id).await?;
        let info = self
            .stock
            .get_stock_info(event_id)
            .await
            .unwrap_or(StockInfo {
                remaining: event.remaining(),
                sold_out: event.remaining() == 0,
            });
        Ok((event, product, info))
    }

    pub async fn event_stats(
        &self,
        event_id: EventId,
    ) -> Result<(SpikeEvent, OrderStats, StockInfo), SpikeError> {
        let event = SpikeEventRepository::get(&self.pool, event_id)
            .await?
            .ok_or_else(|| SpikeError::NotFound(format!("spike event {}", event_id)))?;

        let stats = SpikeOrderRepository::stats(&self.pool, event_id).await?;
        let info = self
            .stock
            .get_stock_info(event_id)
            .await
            .unwrap_or(StockInfo {
                remaining: event.remaining(),
                sold_out: event.remaining() == 0,
            });
        Ok((event, stats, info))
    }

    pub async fn list_orders(
        &self,
        user_id: UserId,
        status: Option<SpikeOrderStatus>,
        page: Page,
    ) -> Result<(Vec<SpikeOrder>, i64), SpikeError> {
        let orders = SpikeOrderRepository::list_by_user(&self.pool, user_id, status, page).await?;
        let total = SpikeOrderRepository::count_by_user(&self.pool, user_id, status).await?;
        Ok((orders, total))
    }

    /// Order detail; only the owner may read it.
    pub async fn get_order(
        &self,
        user_id: UserId,
        order_id: SpikeOrderId,
    ) -> Result<SpikeOrder, SpikeError> {
        let order = SpikeOrderRepository::get(&self.pool, order_id)
            .await?
            .ok_or_else(|| SpikeError::NotFound(format!("spike order {}", order_id)))?;
        if order.user_id != user_id {
            return Err(SpikeError::Forbidden);
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participate_command_validation() {
        let ok = ParticipateCommand {
            spike_event_id: 1,
            quantity: 1,
            idempotency_key: "k".to_string(),
        };
        assert!(ok.validate().is_ok());

        let too_many = ParticipateCommand {
            spike_event_id: 1,
            quantity: 11,
            idempotency_key: "k".to_string(),
        };
        assert!(too_many.validate().is_err());

        let zero_qty = ParticipateCommand {
            spike_event_id: 1,
            quantity: 0,
            idempotency_key: "k".to_string(),
        };
        assert!(zero_qty.validate().is_err());

        let long_key = ParticipateCommand {
            spike_event_id: 1,
            quantity: 1,
            idempotency_key: "x".repeat(65),
        };
        assert!(long_key.validate().is_err());

        let empty_key = ParticipateCommand {
            spike_event_id: 1,
            quantity: 1,
            idempotency_key: String::new(),
        };
        assert!(empty_key.validate().is_err());
    }

    #[test]
    fn test_reply_shapes() {
        let won = ParticipateReply::won();
        assert!(won.success);
        assert!(won.message.contains("win"));

        let limited = ParticipateReply::rate_limited(3);
        assert!(!limited.success);
        assert_eq!(limited.retry_after_secs, Some(3));

        let sold = ParticipateReply::rejected(MSG_SOLD_OUT);
        assert!(sold.message.contains("sold"));
        assert!(sold.retry_after_secs.is_none());
    }
}
