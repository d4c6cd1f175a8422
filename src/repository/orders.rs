//! Spike order repository
//!
//! The UNIQUE `idempotency_key` column is the durable end of the
//! idempotency chain: a duplicate insert surfaces `RepoError::Duplicate`
//! and the reconciliation consumer treats it as already processed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use super::{Page, RepoError};
use crate::core_types::{EventId, SpikeOrderId, UserId};
use crate::models::{SpikeOrder, SpikeOrderStatus};

/// Insert payload for the reconciliation consumer.
#[derive(Debug, Clone)]
pub struct NewSpikeOrder {
    pub spike_event_id: EventId,
    pub user_id: UserId,
    pub quantity: i64,
    pub spike_price: Decimal,
    pub total_amount: Decimal,
    pub idempotency_key: String,
    pub expire_at: DateTime<Utc>,
}

/// Per-event order counts by status.
#[derive(Debug, Clone, Default, serde::Serialize, utoipa::ToSchema)]
pub struct OrderStats {
    pub total: i64,
    pub pending: i64,
    pub paid: i64,
    pub cancelled: i64,
    pub expired: i64,
}

const ORDER_COLUMNS: &str = "id, spike_event_id, user_id, order_id, quantity, spike_price, \
     total_amount, status, idempotency_key, expire_at, paid_at, cancelled_at, \
     created_at, updated_at";

pub struct SpikeOrderRepository;

impl SpikeOrderRepository {
    /// Insert a pending order. `RepoError::Duplicate` means another
    /// delivery of the same message got here first.
    pub async fn insert(
        conn: &mut PgConnection,
        order: &NewSpikeOrder,
    ) -> Result<SpikeOrderId, RepoError> {
        let id: SpikeOrderId = sqlx::query_scalar(
            "INSERT INTO spike_orders \
               (spike_event_id, user_id, quantity, spike_price, total_amount, \
                status, idempotency_key, expire_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW()) \
             RETURNING id",
        )
        .bind(order.spike_event_id)
        .bind(order.user_id)
        .bind(order.quantity)
        .bind(order.spike_price)
        .bind(order.total_amount)
        .bind(SpikeOrderStatus::Pending.id())
        .bind(&order.idempotency_key)
        .bind(order.expire_at)
        .fetch_one(conn)
        .await?;

        Ok(id)
    }

    pub async fn get(pool: &PgPool, id: SpikeOrderId) -> Result<Option<SpikeOrder>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM spike_orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        row.map(|r| row_to_order(&r)).transpose()
    }

    pub async fn get_by_idempotency_key(
        pool: &PgPool,
        key: &str,
    ) -> Result<Option<SpikeOrder>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM spike_orders WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(pool)
        .await?;

        row.map(|r| row_to_order(&r)).transpose()
    }

    /// Row-locked read by idempotency key, for the compensation
    /// handlers: the prior status decides whether stock flows back.
    pub async fn get_by_key_for_update(
        conn: &mut PgConnection,
        key: &str,
    ) -> Result<Option<SpikeOrder>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM spike_orders WHERE idempotency_key = $1 FOR UPDATE"
        ))
        .bind(key)
        .fetch_optional(conn)
        .await?;

        row.map(|r| row_to_order(&r)).transpose()
    }

    pub async fn list_by_user(
        pool: &PgPool,
        user_id: UserId,
        status: Option<SpikeOrderStatus>,
        page: Page,
    ) -> Result<Vec<SpikeOrder>, RepoError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {ORDER_COLUMNS} FROM spike_orders \
                     WHERE user_id = $1 AND status = $2 \
                     ORDER BY created_at DESC LIMIT $3 OFFSET $4"
                ))
                .bind(user_id)
                .bind(status.id())
                .bind(page.limit())
                .bind(page.offset())
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {ORDER_COLUMNS} FROM spike_orders \
                     WHERE user_id = $1 \
                     ORDER BY created_at DESC LIMIT $2 OFFSET $3"
                ))
                .bind(user_id)
                .bind(page.limit())
                .bind(page.offset())
                .fetch_all(pool)
                .await?
            }
        };

        rows.iter().map(row_to_order).collect()
    }

    pub async fn count_by_user(
        pool: &PgPool,
        user_id: UserId,
        status: Option<SpikeOrderStatus>,
    ) -> Result<i64, RepoError> {
        let count: i64 = match status {
            Some(status) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM spike_orders WHERE user_id = $1 AND status = $2",
                )
                .bind(user_id)
                .bind(status.id())
                .fetch_one(pool)
                .await?
            }
            None => sqlx::query_scalar("SELECT COUNT(*) FROM spike_orders WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(pool)
                .await?,
        };
        Ok(count)
    }

    /// Pending -> cancelled (also allowed from expired). Returns false
    /// when the state guard rejected the transition.
    pub async fn mark_cancelled(
        conn: &mut PgConnection,
        id: SpikeOrderId,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE spike_orders \
             SET status = $1, cancelled_at = NOW(), updated_at = NOW() \
             WHERE id = $2 AND status IN ($3, $4)",
        )
        .bind(SpikeOrderStatus::Cancelled.id())
        .bind(id)
        .bind(SpikeOrderStatus::Pending.id())
        .bind(SpikeOrderStatus::Expired.id())
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Pending -> expired. Returns false when the state guard
    /// rejected the transition (paid or already compensated).
    pub async fn mark_expired(conn: &mut PgConnection, id: SpikeOrderId) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE spike_orders \
             SET status = $1, updated_at = NOW() \
             WHERE id = $2 AND status = $3",
        )
        .bind(SpikeOrderStatus::Expired.id())
        .bind(id)
        .bind(SpikeOrderStatus::Pending.id())
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Pending -> paid while still inside the payment window; links
    /// the ordinary order row.
    pub async fn mark_paid(
        conn: &mut PgConnection,
        id: SpikeOrderId,
        order_id: i64,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE spike_orders \
             SET status = $1, order_id = $2, paid_at = NOW(), updated_at = NOW() \
             WHERE id = $3 AND status = $4 AND expire_at > NOW()",
        )
        .bind(SpikeOrderStatus::Paid.id())
        .bind(order_id)
        .bind(id)
        .bind(SpikeOrderStatus::Pending.id())
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn stats(pool: &PgPool, event_id: EventId) -> Result<OrderStats, RepoError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM spike_orders \
             WHERE spike_event_id = $1 GROUP BY status",
        )
        .bind(event_id)
        .fetch_all(pool)
        .await?;

        let mut stats = OrderStats::default();
        for row in &rows {
            let status_id: i16 = row.get("status");
            let count: i64 = row.get("count");
            stats.total += count;
            match SpikeOrderStatus::from_id(status_id) {
                Some(SpikeOrderStatus::Pending) => stats.pending = count,
                Some(SpikeOrderStatus::Paid) => stats.paid = count,
                Some(SpikeOrderStatus::Cancelled) => stats.cancelled = count,
                Some(SpikeOrderStatus::Expired) => stats.expired = count,
                None => {
                    return Err(RepoError::Database(format!(
                        "unknown spike order status {}",
                        status_id
                    )));
                }
            }
        }
        Ok(stats)
    }
}

fn row_to_order(row: &PgRow) -> Result<SpikeOrder, RepoError> {
    let status_id: i16 = row.get("status");
    let status = SpikeOrderStatus::from_id(status_id)
        .ok_or_else(|| RepoError::Database(format!("unknown spike order status {}", status_id)))?;

    Ok(SpikeOrder {
        id: row.get("id"),
        spike_event_id: row.get("spike_event_id"),
        user_id: row.get("user_id"),
        order_id: row.get("order_id"),
        quantity: row.get("quantity"),
        spike_price: row.get("spike_price"),
        total_amount: row.get("total_amount"),
        status,
        idempotency_key: row.get("idempotency_key"),
        expire_at: row.get("expire_at"),
        paid_at: row.get("paid_at"),
        cancelled_at: row.get("cancelled_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
