//! The `MirrorStore` trait and the off-chain mirror row.
//!
//! The mirror is an eventually-consistent, fast-query copy of the ledger.
//! Every row carries the authoritative reference it mirrors so staleness is
//! detectable. Before any irreversible action, consumers re-check the ledger.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  commitment::Commitment,
  event::{Event, PendingEvent},
  record::{ActorId, LiveRecord, PrescriptionDatum, RecordRef, Status, StoreRef},
};

// ─── Rows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
  pub record_id:          Uuid,
  pub store_ref:          StoreRef,
  /// `None` while the row is provisional (reserved, not yet seen on the
  /// ledger).
  pub reference:          Option<RecordRef>,
  pub patient_commitment: Commitment,
  pub issuer:             ActorId,
  pub drug_id:            String,
  pub dosage:             String,
  pub quantity:           u32,
  pub issued_at:          i64,
  pub expiry_at:          i64,
  pub refills_remaining:  u32,
  pub metadata_ref:       Option<String>,
  pub status:             Status,
  /// Status was set by the service ahead of ledger confirmation.
  pub optimistic:         bool,
  pub last_event_at:      DateTime<Utc>,
  pub idempotency_key:    Option<String>,
}

impl MirrorRecord {
  /// A row reserved before the create request is signed and submitted.
  pub fn provisional(
    datum: &PrescriptionDatum,
    store_ref: StoreRef,
    idempotency_key: Option<String>,
    at: DateTime<Utc>,
  ) -> Self {
    Self {
      record_id: datum.prescription_id,
      store_ref,
      reference: None,
      patient_commitment: datum.patient_commitment.clone(),
      issuer: datum.issuer.clone(),
      drug_id: datum.drug_id.clone(),
      dosage: datum.dosage.clone(),
      quantity: datum.quantity,
      issued_at: datum.issued_at,
      expiry_at: datum.expiry_at,
      refills_remaining: datum.refills_remaining,
      metadata_ref: datum.metadata_ref.clone(),
      status: Status::Issued,
      optimistic: true,
      last_event_at: at,
      idempotency_key,
    }
  }

  pub fn is_provisional(&self) -> bool { self.reference.is_none() }
}

/// A live ledger version as seen by one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Observation {
  pub record:      LiveRecord,
  pub status:      Status,
  pub observed_at: DateTime<Utc>,
}

impl Observation {
  /// The row this observation implies for a record the mirror has not seen.
  pub fn to_record(&self) -> MirrorRecord {
    let datum = &self.record.datum;
    MirrorRecord {
      reference: Some(self.record.reference),
      status: self.status,
      optimistic: false,
      last_event_at: self.observed_at,
      idempotency_key: None,
      ..MirrorRecord::provisional(datum, self.record.store_ref.clone(), None, self.observed_at)
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
  Inserted,
  Updated,
  Unchanged,
}

/// Filters for [`MirrorStore::query`]; all set filters must match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MirrorQuery {
  pub issuer:  Option<ActorId>,
  pub patient: Option<Commitment>,
  pub status:  Option<Status>,
  pub limit:   Option<usize>,
  pub offset:  Option<usize>,
}

// ─── Idempotency ─────────────────────────────────────────────────────────────

/// The remembered result of one idempotent operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
  pub key:         String,
  /// `create`, `redeem`, or `refill`.
  pub operation:   String,
  /// Hash of the request input; a reused key with a different input is a
  /// conflict, not a replay.
  pub fingerprint: String,
  pub record_id:   Uuid,
  pub response:    serde_json::Value,
  pub created_at:  DateTime<Utc>,
}

/// Result of atomically claiming an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
  Claimed,
  /// The key was already used; nothing was written.
  Existing(IdempotencyEntry),
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the mirror backend, its idempotency table, and its event
/// outbox.
pub trait MirrorStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Staged writes from the service ────────────────────────────────────

  /// Claim `entry.key` and insert the provisional `row` in one step.
  fn reserve(
    &self,
    row: MirrorRecord,
    entry: IdempotencyEntry,
  ) -> impl Future<Output = Result<Claim, Self::Error>> + Send + '_;

  /// Claim `entry.key` and optimistically set the status of `record_id`.
  fn stage_transition(
    &self,
    record_id: Uuid,
    status: Status,
    at: DateTime<Utc>,
    entry: IdempotencyEntry,
  ) -> impl Future<Output = Result<Claim, Self::Error>> + Send + '_;

  fn find_idempotent<'a>(
    &'a self,
    key: &'a str,
  ) -> impl Future<Output = Result<Option<IdempotencyEntry>, Self::Error>> + Send + 'a;

  // ── Reconciler writes ─────────────────────────────────────────────────

  /// Upsert keyed by record id. Applying the same observation twice reports
  /// [`UpsertOutcome::Unchanged`] and writes nothing.
  fn apply_observation(
    &self,
    observation: Observation,
  ) -> impl Future<Output = Result<UpsertOutcome, Self::Error>> + Send + '_;

  /// Mark `record_id` redeemed and queue `event`, atomically. Returns `false`
  /// when the event had already been emitted.
  fn mark_redeemed(
    &self,
    record_id: Uuid,
    at: DateTime<Utc>,
    event: Event,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Rows at `store_ref` that have a ledger reference and are not settled as
  /// redeemed: live statuses, or an optimistic redeemed awaiting confirmation.
  fn unsettled<'a>(
    &'a self,
    store_ref: &'a StoreRef,
  ) -> impl Future<Output = Result<Vec<MirrorRecord>, Self::Error>> + Send + 'a;

  // ── Reads ─────────────────────────────────────────────────────────────

  fn get(
    &self,
    record_id: Uuid,
  ) -> impl Future<Output = Result<Option<MirrorRecord>, Self::Error>> + Send + '_;

  fn query<'a>(
    &'a self,
    query: &'a MirrorQuery,
  ) -> impl Future<Output = Result<Vec<MirrorRecord>, Self::Error>> + Send + 'a;

  // ── Event outbox ──────────────────────────────────────────────────────

  /// Queue `event` unless its dedup key was already used. Returns whether it
  /// was queued.
  fn emit_once(
    &self,
    event: Event,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Oldest undelivered events first.
  fn pending_events(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<PendingEvent>, Self::Error>> + Send + '_;

  fn mark_delivered(
    &self,
    event_id: Uuid,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Record a failed attempt; `give_up` moves the event out of the pending
  /// set for good.
  fn mark_failed(
    &self,
    event_id: Uuid,
    error: String,
    give_up: bool,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
