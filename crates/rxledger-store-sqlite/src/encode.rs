//! Conversions between domain types and the plain column values stored in
//! SQLite.
//!
//! Timestamps on rows are RFC 3339 strings; datum times stay Unix seconds.
//! UUIDs are hyphenated lowercase strings. Enums use their snake_case names.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rxledger_core::{
  commitment::Commitment,
  consent::ConsentChallenge,
  event::{Event, EventKind, PendingEvent},
  ledger::LedgerEntry,
  mirror::{IdempotencyEntry, MirrorRecord},
  record::{ActorId, RecordRef, Status, StoreRef},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_amount(amount: u64) -> Result<i64> {
  i64::try_from(amount).map_err(|_| Error::OutOfRange("reserve"))
}

fn decode_amount(amount: i64) -> Result<u64> {
  u64::try_from(amount).map_err(|_| Error::Decode {
    column: "reserve",
    value:  amount.to_string(),
  })
}

pub fn decode_status(s: &str) -> Result<Status> {
  Status::from_str(s).map_err(|_| Error::Decode { column: "status", value: s.to_owned() })
}

fn decode_event_kind(s: &str) -> Result<EventKind> {
  EventKind::from_str(s).map_err(|_| Error::Decode { column: "kind", value: s.to_owned() })
}

fn decode_reference(tx_id: Option<String>, index: Option<u32>) -> Result<Option<RecordRef>> {
  match (tx_id, index) {
    (Some(tx), Some(i)) => Ok(Some(RecordRef::new(decode_uuid(&tx)?, i))),
    (None, None) => Ok(None),
    (tx, i) => Err(Error::Decode {
      column: "tx_id/output_index",
      value:  format!("{tx:?}/{i:?}"),
    }),
  }
}

// ─── Ledger rows ─────────────────────────────────────────────────────────────

/// Raw column values read back from `ledger_outputs`.
pub struct RawOutput {
  pub tx_id:        String,
  pub output_index: u32,
  pub store_ref:    String,
  pub reserve:      i64,
  pub datum:        String,
}

impl RawOutput {
  pub const COLUMNS: &'static str = "tx_id, output_index, store_ref, reserve, datum";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      tx_id:        row.get(0)?,
      output_index: row.get(1)?,
      store_ref:    row.get(2)?,
      reserve:      row.get(3)?,
      datum:        row.get(4)?,
    })
  }

  pub fn into_entry(self) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
      reference: RecordRef::new(decode_uuid(&self.tx_id)?, self.output_index),
      store_ref: StoreRef::new(self.store_ref),
      reserve:   decode_amount(self.reserve)?,
      datum:     self.datum,
    })
  }
}

// ─── Mirror rows ─────────────────────────────────────────────────────────────

/// Raw column values read back from `mirror_records`.
pub struct RawMirrorRecord {
  pub record_id:          String,
  pub store_ref:          String,
  pub tx_id:              Option<String>,
  pub output_index:       Option<u32>,
  pub patient_commitment: String,
  pub issuer:             String,
  pub drug_id:            String,
  pub dosage:             String,
  pub quantity:           u32,
  pub issued_at:          i64,
  pub expiry_at:          i64,
  pub refills_remaining:  u32,
  pub metadata_ref:       Option<String>,
  pub status:             String,
  pub optimistic:         bool,
  pub last_event_at:      String,
  pub idempotency_key:    Option<String>,
}

impl RawMirrorRecord {
  pub const COLUMNS: &'static str = "record_id, store_ref, tx_id, output_index, patient_commitment, \
                             issuer, drug_id, dosage, quantity, issued_at, expiry_at, \
                             refills_remaining, metadata_ref, status, optimistic, \
                             last_event_at, idempotency_key";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      record_id:          row.get(0)?,
      store_ref:          row.get(1)?,
      tx_id:              row.get(2)?,
      output_index:       row.get(3)?,
      patient_commitment: row.get(4)?,
      issuer:             row.get(5)?,
      drug_id:            row.get(6)?,
      dosage:             row.get(7)?,
      quantity:           row.get(8)?,
      issued_at:          row.get(9)?,
      expiry_at:          row.get(10)?,
      refills_remaining:  row.get(11)?,
      metadata_ref:       row.get(12)?,
      status:             row.get(13)?,
      optimistic:         row.get(14)?,
      last_event_at:      row.get(15)?,
      idempotency_key:    row.get(16)?,
    })
  }

  pub fn into_record(self) -> Result<MirrorRecord> {
    Ok(MirrorRecord {
      record_id:          decode_uuid(&self.record_id)?,
      store_ref:          StoreRef::new(self.store_ref),
      reference:          decode_reference(self.tx_id, self.output_index)?,
      patient_commitment: Commitment::from_hex(self.patient_commitment),
      issuer:             ActorId::new(self.issuer),
      drug_id:            self.drug_id,
      dosage:             self.dosage,
      quantity:           self.quantity,
      issued_at:          self.issued_at,
      expiry_at:          self.expiry_at,
      refills_remaining:  self.refills_remaining,
      metadata_ref:       self.metadata_ref,
      status:             decode_status(&self.status)?,
      optimistic:         self.optimistic,
      last_event_at:      decode_dt(&self.last_event_at)?,
      idempotency_key:    self.idempotency_key,
    })
  }
}

/// Raw column values read back from `idempotency_keys`.
pub struct RawIdempotency {
  pub key:         String,
  pub operation:   String,
  pub fingerprint: String,
  pub record_id:   String,
  pub response:    String,
  pub created_at:  String,
}

impl RawIdempotency {
  pub const COLUMNS: &'static str = "key, operation, fingerprint, record_id, response, created_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      key:         row.get(0)?,
      operation:   row.get(1)?,
      fingerprint: row.get(2)?,
      record_id:   row.get(3)?,
      response:    row.get(4)?,
      created_at:  row.get(5)?,
    })
  }

  pub fn into_entry(self) -> Result<IdempotencyEntry> {
    Ok(IdempotencyEntry {
      key:         self.key,
      operation:   self.operation,
      fingerprint: self.fingerprint,
      record_id:   decode_uuid(&self.record_id)?,
      response:    serde_json::from_str(&self.response)?,
      created_at:  decode_dt(&self.created_at)?,
    })
  }
}

// ─── Outbox rows ─────────────────────────────────────────────────────────────

/// Raw column values read back from `events`.
pub struct RawEvent {
  pub event_id:   String,
  pub record_id:  String,
  pub kind:       String,
  pub dedup_key:  String,
  pub payload:    String,
  pub created_at: String,
  pub attempts:   u32,
}

impl RawEvent {
  pub const COLUMNS: &'static str =
    "event_id, record_id, kind, dedup_key, payload, created_at, attempts";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:   row.get(0)?,
      record_id:  row.get(1)?,
      kind:       row.get(2)?,
      dedup_key:  row.get(3)?,
      payload:    row.get(4)?,
      created_at: row.get(5)?,
      attempts:   row.get(6)?,
    })
  }

  pub fn into_pending(self) -> Result<PendingEvent> {
    Ok(PendingEvent {
      event:    Event {
        event_id:   decode_uuid(&self.event_id)?,
        record_id:  decode_uuid(&self.record_id)?,
        kind:       decode_event_kind(&self.kind)?,
        dedup_key:  self.dedup_key,
        payload:    serde_json::from_str(&self.payload)?,
        created_at: decode_dt(&self.created_at)?,
      },
      attempts: self.attempts,
    })
  }
}

/// Raw column values read back from `consent_challenges`.
pub struct RawChallenge {
  pub prescription_id: String,
  pub code_hash:       String,
  pub expires_at:      i64,
  pub attempts:        u32,
}

impl RawChallenge {
  pub fn into_challenge(self) -> Result<ConsentChallenge> {
    Ok(ConsentChallenge {
      prescription_id: decode_uuid(&self.prescription_id)?,
      code_hash:       self.code_hash,
      expires_at:      self.expires_at,
      attempts:        self.attempts,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reference_columns_must_agree() {
    assert!(decode_reference(None, None).unwrap().is_none());
    let id = Uuid::new_v4();
    let r = decode_reference(Some(encode_uuid(id)), Some(2)).unwrap().unwrap();
    assert_eq!(r, RecordRef::new(id, 2));
    assert!(decode_reference(Some(encode_uuid(id)), None).is_err());
  }

  #[test]
  fn reserve_range_is_checked() {
    assert_eq!(encode_amount(2_000_000).unwrap(), 2_000_000);
    assert!(matches!(encode_amount(u64::MAX), Err(Error::OutOfRange(_))));
    assert!(decode_amount(-1).is_err());
  }

  #[test]
  fn unknown_status_is_a_decode_error() {
    assert_eq!(decode_status("partially_redeemed").unwrap(), Status::PartiallyRedeemed);
    assert!(matches!(decode_status("lost"), Err(Error::Decode { column: "status", .. })));
  }
}
