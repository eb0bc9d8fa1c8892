//! Events emitted for downstream notification delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::record::RecordRef;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
  Issued,
  Refilled,
  Redeemed,
  Expired,
  ConsentRequested,
}

impl EventKind {
  /// Topic name used by notification consumers, e.g. `prescription_redeemed`.
  pub fn topic(self) -> String { format!("prescription_{self}") }
}

/// One entry of the event outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub event_id:   Uuid,
  pub record_id:  Uuid,
  pub kind:       EventKind,
  /// Unique per logical occurrence; a second emit with the same key is a
  /// no-op, which is what makes delivery at-most-once across poll cycles.
  pub dedup_key:  String,
  pub payload:    serde_json::Value,
  pub created_at: DateTime<Utc>,
}

impl Event {
  pub fn new(
    record_id: Uuid,
    kind: EventKind,
    dedup_key: String,
    payload: serde_json::Value,
    at: DateTime<Utc>,
  ) -> Self {
    Self { event_id: Uuid::new_v4(), record_id, kind, dedup_key, payload, created_at: at }
  }

  /// Once per prescription: issued, redeemed, expired.
  pub fn once_per_record(
    record_id: Uuid,
    kind: EventKind,
    payload: serde_json::Value,
    at: DateTime<Utc>,
  ) -> Self {
    Self::new(record_id, kind, format!("{kind}:{record_id}"), payload, at)
  }

  /// Once per record version: refills.
  pub fn once_per_version(
    record_id: Uuid,
    kind: EventKind,
    reference: RecordRef,
    payload: serde_json::Value,
    at: DateTime<Utc>,
  ) -> Self {
    Self::new(record_id, kind, format!("{kind}:{reference}"), payload, at)
  }
}

/// Delivery state of an outbox entry, stored as its snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryState {
  Pending,
  Delivered,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
  pub event:    Event,
  pub attempts: u32,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn topic_and_dedup_keys() {
    let id = Uuid::nil();
    assert_eq!(EventKind::Redeemed.topic(), "prescription_redeemed");
    let e = Event::once_per_record(id, EventKind::Issued, serde_json::Value::Null, Utc::now());
    assert_eq!(e.dedup_key, format!("issued:{id}"));

    let r = RecordRef::new(Uuid::nil(), 0);
    let e = Event::once_per_version(id, EventKind::Refilled, r, serde_json::Value::Null, Utc::now());
    assert_eq!(e.dedup_key, format!("refilled:{r}"));
  }

  #[test]
  fn delivery_state_column_values() {
    assert_eq!(DeliveryState::Pending.to_string(), "pending");
    assert_eq!(DeliveryState::Failed.to_string(), "failed");
    assert_eq!("delivered".parse::<DeliveryState>().unwrap(), DeliveryState::Delivered);
  }
}
