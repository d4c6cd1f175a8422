//! Core types used throughout the system
//!
//! Fundamental type aliases shared by all modules. They carry semantic
//! meaning and leave room for future type evolution.

/// Spike event ID - primary key of a flash-sale event.
pub type EventId = i64;

/// User ID - globally unique, immutable after assignment.
///
/// Signed because it travels through JWT claims and Postgres BIGINT
/// columns unchanged.
pub type UserId = i64;

/// Spike order ID - primary key of a reserved slot.
pub type SpikeOrderId = i64;

/// Product ID - references the catalog product a spike event sells.
pub type ProductId = i64;

/// Inventory row ID.
pub type InventoryId = i64;
