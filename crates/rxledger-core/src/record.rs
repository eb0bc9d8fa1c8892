//! Record types: the prescription datum, its references, and the actions
//! (redeemers) that can be applied to it.
//!
//! A record is never mutated in place. Each transition consumes the current
//! version, identified by a [`RecordRef`], and at most one continuation
//! version with a fresh reference is produced.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::{Error, commitment::Commitment};

// ─── Identities ──────────────────────────────────────────────────────────────

/// A public-key hash (or equivalent) identifying a doctor, pharmacy, or other
/// actor. Never a raw personal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ActorId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// A location in the authoritative store where prescription records live
/// (the validator script address, on a ledger).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreRef(String);

impl StoreRef {
  pub fn new(location: impl Into<String>) -> Self { Self(location.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for StoreRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

// ─── References ──────────────────────────────────────────────────────────────

/// Points at exactly one version of a record: the request that produced it
/// and the output index within that request. Rendered as `"<tx_id>#<index>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
  pub tx_id: Uuid,
  pub index: u32,
}

impl RecordRef {
  pub fn new(tx_id: Uuid, index: u32) -> Self { Self { tx_id, index } }
}

impl fmt::Display for RecordRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.tx_id.hyphenated(), self.index)
  }
}

impl FromStr for RecordRef {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (tx, idx) = s
      .split_once('#')
      .ok_or_else(|| Error::MalformedReference(s.to_owned()))?;
    let tx_id = Uuid::parse_str(tx).map_err(|_| Error::MalformedReference(s.to_owned()))?;
    let index = idx.parse().map_err(|_| Error::MalformedReference(s.to_owned()))?;
    Ok(Self { tx_id, index })
  }
}

// ─── Datum ───────────────────────────────────────────────────────────────────

/// The canonical state of one prescription version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrescriptionDatum {
  /// Stable across every version; correlates authoritative and mirror copies.
  pub prescription_id:    Uuid,
  pub patient_commitment: Commitment,
  pub drug_id:            String,
  pub dosage:             String,
  pub quantity:           u32,
  /// The issuing doctor; authorizes CREATE and, by default, REFILL.
  pub issuer:             ActorId,
  /// Unix seconds.
  pub issued_at:          i64,
  /// Unix seconds. Always later than `issued_at`.
  pub expiry_at:          i64,
  pub refills_remaining:  u32,
  /// Opaque pointer to encrypted off-record metadata.
  pub metadata_ref:       Option<String>,
  /// Set when this version was produced by a REFILL; Unix seconds.
  pub continued_at:       Option<i64>,
}

impl PrescriptionDatum {
  /// Whether `other` carries the same immutable prescription facts.
  pub fn same_prescription(&self, other: &Self) -> bool {
    self.prescription_id == other.prescription_id
      && self.patient_commitment == other.patient_commitment
      && self.drug_id == other.drug_id
      && self.dosage == other.dosage
      && self.quantity == other.quantity
      && self.issuer == other.issuer
      && self.issued_at == other.issued_at
      && self.expiry_at == other.expiry_at
      && self.metadata_ref == other.metadata_ref
  }

  pub fn is_expired(&self, now: i64) -> bool { now > self.expiry_at }
}

/// One unconsumed version of a record as held by the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRecord {
  pub reference: RecordRef,
  pub store_ref: StoreRef,
  /// Reserve locked with the record, for stores with existence costs.
  pub reserve:   u64,
  pub datum:     PrescriptionDatum,
}

// ─── Actions ─────────────────────────────────────────────────────────────────

/// The operation requested against a record (the "redeemer").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
  Create,
  Redeem {
    consent_code: Option<String>,
    /// The dispensing pharmacy, when it identifies itself.
    dispenser:    Option<ActorId>,
  },
  Refill {
    consent_code: Option<String>,
  },
}

impl Action {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Redeem { .. } => "redeem",
      Self::Refill { .. } => "refill",
    }
  }

  pub fn consent_code(&self) -> Option<&str> {
    match self {
      Self::Create => None,
      Self::Redeem { consent_code, .. } | Self::Refill { consent_code } => {
        consent_code.as_deref()
      }
    }
  }

  /// The action as it is written into a request: consent codes are checked
  /// off-record and must not travel to the shared store.
  pub fn redacted(&self) -> Self {
    match self {
      Self::Create => Self::Create,
      Self::Redeem { dispenser, .. } => Self::Redeem {
        consent_code: None,
        dispenser:    dispenser.clone(),
      },
      Self::Refill { .. } => Self::Refill { consent_code: None },
    }
  }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Derived status, mirrored for queries. Never stored authoritatively.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
  Issued,
  PartiallyRedeemed,
  Redeemed,
  Expired,
}

impl Status {
  /// Statuses of records that still have an unconsumed version.
  pub fn is_live(self) -> bool { !matches!(self, Self::Redeemed) }
}

/// Status of a live version at `now`. Expiry overrides the other live
/// statuses but does not consume the record.
pub fn derive_status(datum: &PrescriptionDatum, now: i64) -> Status {
  if datum.expiry_at < now {
    Status::Expired
  } else if datum.continued_at.is_some() {
    Status::PartiallyRedeemed
  } else {
    Status::Issued
  }
}
