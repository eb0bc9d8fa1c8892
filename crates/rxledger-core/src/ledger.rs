//! The `Ledger` trait, i.e. the authoritative store.
//!
//! The ledger is the single source of truth and the only party that accepts a
//! transition. Backends may be a consensus ledger or a database with
//! compare-and-swap on record references; callers cannot tell the difference.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Result,
  builder::SignedRequest,
  codec::decode_datum,
  error::TransitionError,
  record::{LiveRecord, RecordRef, StoreRef},
};

/// A live version exactly as the store holds it. The datum is left encoded so
/// one undecodable entry cannot poison a whole listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
  pub reference: RecordRef,
  pub store_ref: StoreRef,
  pub reserve:   u64,
  pub datum:     String,
}

impl LedgerEntry {
  pub fn decode(&self) -> Result<LiveRecord> {
    Ok(LiveRecord {
      reference: self.reference,
      store_ref: self.store_ref.clone(),
      reserve:   self.reserve,
      datum:     decode_datum(&self.datum)?,
    })
  }
}

/// Proof of an accepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
  pub request_id:  Uuid,
  pub consumed:    Option<RecordRef>,
  pub produced:    Option<RecordRef>,
  pub accepted_at: DateTime<Utc>,
}

/// What the ledger decided about a submitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
  Accepted(Receipt),
  Rejected { request_id: Uuid, reason: TransitionError },
}

/// Status of a request as last recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
  Accepted(Receipt),
  Rejected { reason: TransitionError },
  Unknown,
}

/// Abstraction over the authoritative store.
///
/// Domain rejections (stale reference, expired, unauthorized) are values in
/// [`SubmitOutcome`]; `Self::Error` is reserved for infrastructure failures.
pub trait Ledger: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// All unconsumed versions at `store_ref`.
  fn live_records<'a>(
    &'a self,
    store_ref: &'a StoreRef,
  ) -> impl Future<Output = Result<Vec<LedgerEntry>, Self::Error>> + Send + 'a;

  /// The version at `reference`, if it is still unconsumed.
  fn lookup(
    &self,
    reference: RecordRef,
  ) -> impl Future<Output = Result<Option<LedgerEntry>, Self::Error>> + Send + '_;

  /// The unconsumed version of prescription `record_id`, if any.
  fn current_version(
    &self,
    record_id: Uuid,
  ) -> impl Future<Output = Result<Option<LedgerEntry>, Self::Error>> + Send + '_;

  /// Validate and apply a signed request atomically. Resubmitting a request
  /// id returns the originally recorded outcome.
  fn submit(
    &self,
    signed: SignedRequest,
  ) -> impl Future<Output = Result<SubmitOutcome, Self::Error>> + Send + '_;

  fn request_status(
    &self,
    request_id: Uuid,
  ) -> impl Future<Output = Result<RequestStatus, Self::Error>> + Send + '_;
}
