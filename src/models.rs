//! Domain models: spike events, spike orders, inventory
//!
//! Status IDs are designed for PostgreSQL storage as SMALLINT. The
//! relational store owns settled truth; the fast counter in Redis only
//! owns the admission decision.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core_types::{EventId, InventoryId, ProductId, SpikeOrderId, UserId};

// ============================================================
// SPIKE EVENT
// ============================================================

/// Lifecycle of a flash-sale event.
///
/// pending -> active (start_at) -> ended (end_at, or stock exhausted);
/// admin tooling may cancel from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum SpikeEventStatus {
    Pending = 0,
    Active = 1,
    Ended = 2,
    Cancelled = 3,
}

impl SpikeEventStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SpikeEventStatus::Pending),
            1 => Some(SpikeEventStatus::Active),
            2 => Some(SpikeEventStatus::Ended),
            3 => Some(SpikeEventStatus::Cancelled),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SpikeEventStatus::Ended | SpikeEventStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpikeEventStatus::Pending => "PENDING",
            SpikeEventStatus::Active => "ACTIVE",
            SpikeEventStatus::Ended => "ENDED",
            SpikeEventStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for SpikeEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded-stock, bounded-time sale.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SpikeEvent {
    pub id: EventId,
    pub product_id: ProductId,
    pub spike_price: Decimal,
    pub original_price: Decimal,
    /// Authoritative total put on sale.
    pub spike_stock: i64,
    /// Authoritative reconciled sales.
    pub sold_count: i64,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: SpikeEventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SpikeEvent {
    /// Can this event admit purchases right now?
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SpikeEventStatus::Active
            && self.start_at <= now
            && now < self.end_at
            && self.sold_count < self.spike_stock
    }

    /// Stock not yet reconciled as sold.
    pub fn remaining(&self) -> i64 {
        (self.spike_stock - self.sold_count).max(0)
    }
}

// ============================================================
// SPIKE ORDER
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum SpikeOrderStatus {
    Pending = 0,
    Paid = 1,
    Cancelled = 2,
    Expired = 3,
}

impl SpikeOrderStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SpikeOrderStatus::Pending),
            1 => Some(SpikeOrderStatus::Paid),
            2 => Some(SpikeOrderStatus::Cancelled),
            3 => Some(SpikeOrderStatus::Expired),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SpikeOrderStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpikeOrderStatus::Pending => "PENDING",
            SpikeOrderStatus::Paid => "PAID",
            SpikeOrderStatus::Cancelled => "CANCELLED",
            SpikeOrderStatus::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for SpikeOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reserved slot awaiting payment, created by the reconciliation
/// consumer (never by the hot path).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SpikeOrder {
    pub id: SpikeOrderId,
    pub spike_event_id: EventId,
    pub user_id: UserId,
    /// Back-reference to the ordinary order once paid.
    pub order_id: Option<i64>,
    pub quantity: i64,
    pub spike_price: Decimal,
    pub total_amount: Decimal,
    pub status: SpikeOrderStatus,
    /// Client-supplied, unique across all spike orders.
    pub idempotency_key: String,
    pub expire_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SpikeOrder {
    /// A pending order may be paid until it expires.
    pub fn can_pay(&self, now: DateTime<Utc>) -> bool {
        self.status == SpikeOrderStatus::Pending && now < self.expire_at
    }

    /// Pending and expired orders may still be cancelled.
    pub fn can_cancel(&self) -> bool {
        matches!(
            self.status,
            SpikeOrderStatus::Pending | SpikeOrderStatus::Expired
        )
    }

    /// A pending order past its deadline counts as expired for
    /// admission purposes even before reconciliation flips it.
    pub fn is_effectively_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SpikeOrderStatus::Expired
            || (self.status == SpikeOrderStatus::Pending && self.expire_at <= now)
    }
}

// ============================================================
// INVENTORY
// ============================================================

/// Authoritative product inventory row.
///
/// `version` is the optimistic-lock counter; every full-row update
/// must carry the version it read and bump it by one.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Inventory {
    pub id: InventoryId,
    pub product_id: ProductId,
    pub stock: i64,
    pub reserved_stock: i64,
    pub sold_stock: i64,
    pub reorder_point: i64,
    pub max_stock: i64,
    pub version: i64,
}

impl Inventory {
    /// Stock not held by a reservation.
    pub fn available(&self) -> i64 {
        (self.stock - self.reserved_stock).max(0)
    }

    /// Below the reorder threshold?
    pub fn needs_reorder(&self) -> bool {
        self.stock <= self.reorder_point
    }
}

// ============================================================
// PRODUCT
// ============================================================

/// Catalog product, read-only from this service's point of view
/// (product CRUD lives in an external collaborator).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub sku: String,
    pub price: Decimal,
    pub status: i16,
}
