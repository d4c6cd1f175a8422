//! Spike coordinator
//!
//! `service` holds the synchronous hot path (admission -> fast
//! decrement -> publish) and the read/cancel/warmup entry points;
//! `consumers` holds the asynchronous reconciliation handlers that
//! bridge the broker back into Postgres and, on compensation, back
//! into the fast store.

pub mod consumers;
pub mod service;

pub use consumers::{NotificationHandler, OrderQueueHandler, StockRestoreHandler};
pub use service::{ParticipateCommand, ParticipateReply, SpikeService};
