//! spike_gate - Flash-sale serving core
//!
//! Accepts massive concurrent purchase attempts for limited stock,
//! decides admission in constant time per request, and reconciles the
//! winners durably without overselling or stranding reservations.
//!
//! # Modules
//!
//! - [`core_types`] - Id type aliases (EventId, UserId, ...)
//! - [`config`] - YAML configuration with env overrides
//! - [`error`] - Coordinator error taxonomy
//! - [`db`] - Postgres connection pool
//! - [`kv`] - Shared Redis handle
//! - [`limiter`] - Scripted rate limiters (token bucket, sliding
//!   window, fixed window) and their combinator
//! - [`stock`] - Fast stock store: warmup / decrement / restore
//! - [`models`] - SpikeEvent, SpikeOrder, Inventory + state machines
//! - [`repository`] - sqlx repositories with optimistic / conditional
//!   locking and the Redis cache wrapper
//! - [`mq`] - AMQP adapter: topology, confirming producer, consumers
//! - [`spike`] - The coordinator: hot path and reconciliation handlers
//! - [`auth`] - Bearer-token validation middleware
//! - [`gateway`] - axum HTTP surface

// Core types - must be first!
pub mod core_types;

// Configuration and ambient stack
pub mod config;
pub mod error;
pub mod logging;

// Storage handles
pub mod db;
pub mod kv;

// Admission pipeline
pub mod limiter;
pub mod stock;

// Domain
pub mod models;
pub mod repository;

// Broker
pub mod mq;

// Coordinator
pub mod spike;

// HTTP surface
pub mod auth;
pub mod gateway;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{EventId, ProductId, SpikeOrderId, UserId};
pub use error::SpikeError;
pub use limiter::{AdmissionGate, Decision, RateLimiter};
pub use models::{Inventory, SpikeEvent, SpikeOrder};
pub use spike::{ParticipateReply, SpikeService};
pub use stock::{DecrementOutcome, FastStockStore};
