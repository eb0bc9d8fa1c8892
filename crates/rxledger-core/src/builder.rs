//! Transaction builder. Turns a decided transition into an unsigned request
//! for the authoritative store.
//!
//! The builder never signs and keeps no state between calls. Its only source
//! of non-determinism is request-id allocation, which is injectable through
//! [`ReferenceSource`].

use std::{
  future::Future,
  sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
  Result,
  codec::encode_datum,
  error::TransitionError,
  record::{Action, ActorId, LiveRecord, PrescriptionDatum, RecordRef, StoreRef},
};

// ─── Requests ────────────────────────────────────────────────────────────────

/// The version a request produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
  pub reference: RecordRef,
  pub store_ref: StoreRef,
  pub reserve:   u64,
  /// Encoded with [`crate::codec::encode_datum`].
  pub datum:     String,
}

/// A state-change request awaiting external signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedRequest {
  pub request_id: Uuid,
  pub actor:      ActorId,
  /// Carries no consent code; see [`Action::redacted`].
  pub action:     Action,
  /// The exact version being consumed; the optimistic-concurrency token.
  pub consumes:   Option<RecordRef>,
  pub output:     Option<OutputSpec>,
  /// Unix seconds.
  pub built_at:   i64,
}

impl UnsignedRequest {
  /// SHA-256 over the canonical JSON form; what a signer attests to.
  pub fn digest(&self) -> Result<String> {
    let bytes = serde_json::to_vec(self)?;
    Ok(hex::encode(Sha256::digest(bytes)))
  }
}

/// A request plus the signing authority's attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
  pub request:   UnsignedRequest,
  pub signer:    ActorId,
  /// Opaque witness produced by the signer over [`UnsignedRequest::digest`].
  pub signature: String,
}

impl SignedRequest {
  /// Envelope whose witness is the bare digest. For development stores and
  /// tests that do not verify real signatures.
  pub fn attest(request: UnsignedRequest, signer: ActorId) -> Result<Self> {
    let signature = request.digest()?;
    Ok(Self { request, signer, signature })
  }
}

/// External signing authority (wallet, HSM). Key material never crosses this
/// boundary.
pub trait Signer: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn sign(
    &self,
    request: UnsignedRequest,
  ) -> impl Future<Output = Result<SignedRequest, Self::Error>> + Send + '_;
}

// ─── Reference allocation ────────────────────────────────────────────────────

/// Allocates request ids; each produced version is `(request_id, 0)`.
pub trait ReferenceSource: Send + Sync {
  fn next_request_id(&self) -> Uuid;
}

/// UUID v4 allocation for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomReferences;

impl ReferenceSource for RandomReferences {
  fn next_request_id(&self) -> Uuid { Uuid::new_v4() }
}

/// Counter-based allocation for reproducible tests.
#[derive(Debug, Default)]
pub struct SequentialReferences {
  next: AtomicU64,
}

impl ReferenceSource for SequentialReferences {
  fn next_request_id(&self) -> Uuid {
    let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
    Uuid::from_u128(n as u128)
  }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// What the caller last learned about the version it wants to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
  Live,
  Consumed,
}

#[derive(Debug, Default)]
pub struct TransactionBuilder<R = RandomReferences> {
  references: R,
}

impl TransactionBuilder<RandomReferences> {
  pub fn new() -> Self { Self { references: RandomReferences } }
}

impl<R: ReferenceSource> TransactionBuilder<R> {
  pub fn with_references(references: R) -> Self { Self { references } }

  /// Request that mints the first version of `datum` at `store_ref`, locking
  /// `minimum_reserve` with it.
  pub fn build_create(
    &self,
    datum: &PrescriptionDatum,
    store_ref: &StoreRef,
    actor: &ActorId,
    minimum_reserve: u64,
    now: i64,
  ) -> Result<UnsignedRequest> {
    let request_id = self.references.next_request_id();
    Ok(UnsignedRequest {
      request_id,
      actor: actor.clone(),
      action: Action::Create,
      consumes: None,
      output: Some(OutputSpec {
        reference: RecordRef::new(request_id, 0),
        store_ref: store_ref.clone(),
        reserve:   minimum_reserve,
        datum:     encode_datum(datum)?,
      }),
      built_at: now,
    })
  }

  /// Request that consumes `current` and, when `continuation` is given,
  /// produces the next version at the same location with the same reserve.
  pub fn build_transition(
    &self,
    current: &LiveRecord,
    liveness: Liveness,
    action: &Action,
    actor: &ActorId,
    continuation: Option<&PrescriptionDatum>,
    now: i64,
  ) -> Result<UnsignedRequest> {
    if liveness == Liveness::Consumed {
      return Err(TransitionError::StaleReference { reference: current.reference }.into());
    }

    let request_id = self.references.next_request_id();
    let output = continuation
      .map(|datum| -> Result<OutputSpec> {
        Ok(OutputSpec {
          reference: RecordRef::new(request_id, 0),
          store_ref: current.store_ref.clone(),
          reserve:   current.reserve,
          datum:     encode_datum(datum)?,
        })
      })
      .transpose()?;

    Ok(UnsignedRequest {
      request_id,
      actor: actor.clone(),
      action: action.redacted(),
      consumes: Some(current.reference),
      output,
      built_at: now,
    })
  }
}
