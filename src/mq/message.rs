//! Message envelope and payloads
//!
//! Wire format is JSON. The envelope travels unchanged through every
//! queue; `kind` doubles as the routing key.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core_types::{EventId, ProductId, UserId};
use crate::mq::MqError;

/// Name this service stamps into `source`.
pub const SOURCE: &str = "spike_gate";

/// Envelope schema version.
pub const WIRE_VERSION: &str = "1.0";

/// Message kind; serialized form equals the routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "spike.order.created")]
    OrderCreated,
    #[serde(rename = "spike.order.paid")]
    OrderPaid,
    #[serde(rename = "spike.order.expired")]
    OrderExpired,
    #[serde(rename = "spike.order.cancelled")]
    OrderCancelled,
    #[serde(rename = "spike.stock.restore")]
    StockRestore,
    #[serde(rename = "notification.send")]
    NotificationSend,
    #[serde(rename = "notification.order.confirmation")]
    OrderConfirmation,
}

impl MessageKind {
    pub fn routing_key(&self) -> &'static str {
        match self {
            MessageKind::OrderCreated => "spike.order.created",
            MessageKind::OrderPaid => "spike.order.paid",
            MessageKind::OrderExpired => "spike.order.expired",
            MessageKind::OrderCancelled => "spike.order.cancelled",
            MessageKind::StockRestore => "spike.stock.restore",
            MessageKind::NotificationSend => "notification.send",
            MessageKind::OrderConfirmation => "notification.order.confirmation",
        }
    }

}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.routing_key())
    }
}

/// The typed envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message<T> {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub trace_id: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub data: T,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Envelope with the payload left undecoded, for dispatch by kind.
pub type RawMessage = Message<serde_json::Value>;

impl<T: Serialize + DeserializeOwned> Message<T> {
    pub fn new(kind: MessageKind, trace_id: impl Into<String>, data: T) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            version: WIRE_VERSION.to_string(),
            timestamp: Utc::now(),
            source: SOURCE.to_string(),
            trace_id: trace_id.into(),
            retry_count: 0,
            max_retries: 3,
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, MqError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, MqError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl RawMessage {
    /// Decode the payload into its concrete type.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, MqError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

// ============================================================
// PAYLOADS
// ============================================================

/// Emitted by the hot path the instant a user wins a slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderCreated {
    pub spike_event_id: EventId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub spike_price: Decimal,
    pub total_amount: Decimal,
    pub idempotency_key: String,
    pub expire_at: DateTime<Utc>,
}

/// Shared payload of the compensating flows (expired / cancelled /
/// stock restore).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderLifecycle {
    pub spike_event_id: EventId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub idempotency_key: String,
    pub reason: String,
}

/// Emitted by the external payment subsystem once a winner pays;
/// `order_id` links the ordinary order row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderPaid {
    pub spike_event_id: EventId,
    pub user_id: UserId,
    pub order_id: i64,
    pub idempotency_key: String,
}

/// Payload of the notification queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationSend {
    pub user_id: UserId,
    pub subject: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn test_kind_serializes_as_routing_key() {
        let json = serde_json::to_string(&MessageKind::OrderCreated).unwrap();
        assert_eq!(json, "\"spike.order.created\"");

        let kind: MessageKind = serde_json::from_str("\"spike.stock.restore\"").unwrap();
        assert_eq!(kind, MessageKind::StockRestore);
    }

    #[test]
    fn test_order_created_round_trip() {
        let payload = OrderCreated {
            spike_event_id: 1,
            user_id: 42,
            product_id: 10,
            quantity: 2,
            spike_price: dec(49),
            total_amount: dec(98),
            idempotency_key: "key-1".to_string(),
            expire_at: Utc::now(),
        };
        let msg = Message::new(MessageKind::OrderCreated, "trace-1", payload.clone());

        let bytes = msg.to_json().unwrap();
        let back: Message<OrderCreated> = Message::from_json(&bytes).unwrap();

        assert_eq!(back.kind, MessageKind::OrderCreated);
        assert_eq!(back.version, WIRE_VERSION);
        assert_eq!(back.source, SOURCE);
        assert_eq!(back.trace_id, "trace-1");
        assert_eq!(back.data, payload);
    }

    #[test]
    fn test_lifecycle_round_trip() {
        let payload = OrderLifecycle {
            spike_event_id: 4,
            user_id: 9,
            product_id: 11,
            quantity: 1,
            idempotency_key: "k".to_string(),
            reason: "payment window elapsed".to_string(),
        };
        let msg = Message::new(MessageKind::OrderExpired, "t", payload.clone());
        let back: Message<OrderLifecycle> = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back.data, payload);
    }

    #[test]
    fn test_notification_round_trip() {
        let payload = NotificationSend {
            user_id: 3,
            subject: "order confirmed".to_string(),
            body: "pay within 15 minutes".to_string(),
        };
        let msg = Message::new(MessageKind::NotificationSend, "t", payload.clone());
        let back: Message<NotificationSend> = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back.data, payload);
    }

    #[test]
    fn test_raw_message_dispatch() {
        let payload = OrderLifecycle {
            spike_event_id: 4,
            user_id: 9,
            product_id: 11,
            quantity: 1,
            idempotency_key: "k".to_string(),
            reason: "cancelled by user".to_string(),
        };
        let msg = Message::new(MessageKind::OrderCancelled, "t", payload.clone());
        let bytes = msg.to_json().unwrap();

        let raw = RawMessage::from_json(&bytes).unwrap();
        assert_eq!(raw.kind, MessageKind::OrderCancelled);
        let decoded: OrderLifecycle = raw.decode_data().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_missing_metadata_defaults_empty() {
        let json = serde_json::json!({
            "id": "m-1",
            "type": "notification.send",
            "version": "1.0",
            "timestamp": Utc::now(),
            "source": "spike_gate",
            "trace_id": "t",
            "retry_count": 0,
            "max_retries": 3,
            "data": {"user_id": 1, "subject": "s", "body": "b"}
        });
        let msg: Message<NotificationSend> =
            serde_json::from_value(json).unwrap();
        assert!(msg.metadata.is_empty());
    }
}
