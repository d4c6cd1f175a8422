//! Message bus adapter (AMQP 0.9.1)
//!
//! Connection management with reconnect, idempotent topology
//! declaration, a confirming producer (direct and batched), and a
//! worker-pool consumer with prefetch, in-process retries and DLQ
//! routing. Delivery is at-least-once; idempotency is enforced by the
//! handlers, never assumed from the broker.

pub mod connection;
pub mod consumer;
pub mod message;
pub mod producer;
pub mod topology;

pub use connection::{ChannelPool, MqConnection};
pub use consumer::{ConsumerPool, HandlerError, HandlerResult, MessageHandler};
pub use message::{
    Message, MessageKind, NotificationSend, OrderCreated, OrderLifecycle, OrderPaid, RawMessage,
};
pub use producer::Producer;

use thiserror::Error;

/// Broker-layer errors.
#[derive(Error, Debug, Clone)]
pub enum MqError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("broker connection unrecoverable after {0} attempts")]
    Unrecoverable(u32),

    #[error("publish failed: {0}")]
    Publish(String),

    /// The broker negatively acknowledged a confirmed publish.
    #[error("publish nacked by broker")]
    Nacked,

    #[error("channel pool exhausted")]
    PoolExhausted,

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),
}

impl From<lapin::Error> for MqError {
    fn from(e: lapin::Error) -> Self {
        MqError::Publish(e.to_string())
    }
}

impl From<serde_json::Error> for MqError {
    fn from(e: serde_json::Error) -> Self {
        MqError::Serialize(e.to_string())
    }
}
