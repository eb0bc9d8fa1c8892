//! [`PrescriptionService`], the orchestrator external callers talk to.
//!
//! The service hashes identifiers, validates and builds requests, and stages
//! mirror rows. It never signs and never waits for confirmation: callers sign
//! the returned request, hand it back through [`PrescriptionService::submit`]
//! (or submit it elsewhere), and the reconciler settles the mirror.

use std::{fmt, future::Future, sync::Arc};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use rxledger_core::{
  ValidationError,
  builder::{Liveness, SignedRequest, TransactionBuilder, UnsignedRequest},
  clock::{Clock, SystemClock},
  commitment::IdentifierHasher,
  consent::ConsentGate,
  event::{Event, EventKind},
  ledger::{Ledger, Receipt, RequestStatus, SubmitOutcome},
  lifecycle::{
    ConsentOutcome, PrescriptionDraft, TransitionContext, apply_action, validate_create,
  },
  mirror::{
    Claim, IdempotencyEntry, MirrorQuery, MirrorRecord, MirrorStore, Observation,
  },
  record::{Action, ActorId, LiveRecord, RecordRef, Status, derive_status},
};

use crate::{Error, Result, config::ServiceConfig};

// ─── Inputs ──────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct CreatePrescription {
  /// Caller-chosen id; generated when absent.
  #[serde(default)]
  pub prescription_id: Option<Uuid>,
  /// Raw patient identifier. Hashed immediately; never stored or logged.
  pub patient_id:      String,
  pub drug_id:         String,
  pub dosage:          String,
  pub quantity:        u32,
  pub issuer:          ActorId,
  /// Unix seconds; defaults to now.
  #[serde(default)]
  pub issued_at:       Option<i64>,
  /// Unix seconds.
  pub expiry_at:       i64,
  #[serde(default)]
  pub refills:         u32,
  #[serde(default)]
  pub metadata_ref:    Option<String>,
}

impl fmt::Debug for CreatePrescription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CreatePrescription")
      .field("prescription_id", &self.prescription_id)
      .field("patient_id", &"<redacted>")
      .field("drug_id", &self.drug_id)
      .field("quantity", &self.quantity)
      .field("issuer", &self.issuer)
      .field("expiry_at", &self.expiry_at)
      .field("refills", &self.refills)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemPrescription {
  pub record_id:    Uuid,
  pub dispenser:    ActorId,
  #[serde(default)]
  pub consent_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefillPrescription {
  pub record_id:    Uuid,
  pub actor:        ActorId,
  #[serde(default)]
  pub consent_code: Option<String>,
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOutcome {
  pub record_id: Uuid,
  pub request:   UnsignedRequest,
  /// The result was replayed from an earlier call with the same key.
  #[serde(default)]
  pub replayed:  bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
  pub record_id: Uuid,
  pub request:   UnsignedRequest,
  /// The version the request consumes.
  pub consumed:  RecordRef,
  /// Status staged in the mirror until the reconciler confirms it.
  pub status:    Status,
  #[serde(default)]
  pub replayed:  bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequested {
  pub record_id:  Uuid,
  pub expires_at: i64,
}

/// A prescription as the mirror shows it alongside the authoritative
/// version, if one is live.
#[derive(Debug, Clone, Serialize)]
pub struct PrescriptionView {
  pub mirror: Option<MirrorRecord>,
  pub live:   Option<LiveRecord>,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn fingerprint(input: &impl Serialize) -> Result<String> {
  let bytes = serde_json::to_vec(input)?;
  Ok(hex::encode(Sha256::digest(bytes)))
}

fn require_key(key: &str) -> Result<&str> {
  let key = key.trim();
  if key.is_empty() {
    return Err(ValidationError::MissingField("idempotency_key").into());
  }
  Ok(key)
}

/// Decode a remembered response, provided it was stored for the same request.
fn replay<T: DeserializeOwned>(
  prior: IdempotencyEntry,
  operation: &str,
  fingerprint: &str,
) -> Result<T> {
  if prior.operation != operation || prior.fingerprint != fingerprint {
    return Err(Error::IdempotencyConflict { key: prior.key });
  }
  debug!(key = %prior.key, operation, "replaying idempotent result");
  Ok(serde_json::from_value(prior.response)?)
}

// ─── Service ─────────────────────────────────────────────────────────────────

pub struct PrescriptionService<L, M, G> {
  ledger:  Arc<L>,
  mirror:  Arc<M>,
  consent: Arc<G>,
  hasher:  IdentifierHasher,
  builder: TransactionBuilder,
  clock:   Arc<dyn Clock>,
  config:  ServiceConfig,
}

impl<L, M, G> PrescriptionService<L, M, G>
where
  L: Ledger,
  M: MirrorStore,
  G: ConsentGate,
{
  pub fn new(
    ledger: Arc<L>,
    mirror: Arc<M>,
    consent: Arc<G>,
    hasher: IdentifierHasher,
    config: ServiceConfig,
  ) -> Self {
    Self {
      ledger,
      mirror,
      consent,
      hasher,
      builder: TransactionBuilder::new(),
      clock: Arc::new(SystemClock),
      config,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn config(&self) -> &ServiceConfig { &self.config }

  /// Run an authoritative-store call under the configured timeout. A timeout
  /// leaves the outcome unknown.
  async fn bounded<T, E>(
    &self,
    operation: &'static str,
    call: impl Future<Output = Result<T, E>>,
  ) -> Result<T>
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    match tokio::time::timeout(self.config.store_timeout(), call).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(e)) => {
        warn!(operation, error = %e, "authoritative store call failed");
        Err(Error::store(e))
      }
      Err(_) => {
        warn!(operation, "authoritative store call timed out");
        Err(Error::StoreTimeout { operation })
      }
    }
  }

  async fn find_prior(&self, key: &str) -> Result<Option<IdempotencyEntry>> {
    self.mirror.find_idempotent(key).await.map_err(Error::mirror)
  }

  async fn current(&self, record_id: Uuid) -> Result<LiveRecord> {
    let entry = self
      .bounded("current_version", self.ledger.current_version(record_id))
      .await?
      .ok_or(Error::NotFound(record_id))?;
    Ok(entry.decode()?)
  }

  // ── Create ────────────────────────────────────────────────────────────────

  pub async fn create_prescription(
    &self,
    input: CreatePrescription,
    idempotency_key: &str,
  ) -> Result<CreateOutcome> {
    let key = require_key(idempotency_key)?;
    let commitment = self.hasher.commit(&input.patient_id)?;
    // Stored fingerprints must not be a hash of the raw identifier.
    let fingerprint = fingerprint(&CreatePrescription {
      patient_id: commitment.to_string(),
      ..input.clone()
    })?;
    if let Some(prior) = self.find_prior(key).await? {
      let mut outcome: CreateOutcome = replay(prior, "create", &fingerprint)?;
      outcome.replayed = true;
      return Ok(outcome);
    }

    let now = self.clock.now();
    let at = self.clock.now_utc();
    let datum = validate_create(PrescriptionDraft {
      prescription_id:    input.prescription_id.unwrap_or_else(Uuid::new_v4),
      patient_commitment: commitment,
      drug_id:            input.drug_id,
      dosage:             input.dosage,
      quantity:           input.quantity,
      issuer:             input.issuer,
      issued_at:          input.issued_at.unwrap_or(now),
      expiry_at:          input.expiry_at,
      refills_remaining:  input.refills,
      metadata_ref:       input.metadata_ref,
    })?;

    let record_id = datum.prescription_id;
    if self.mirror.get(record_id).await.map_err(Error::mirror)?.is_some() {
      return Err(Error::AlreadyExists(record_id));
    }

    let request = self.builder.build_create(
      &datum,
      &self.config.store_ref,
      &datum.issuer,
      self.config.minimum_reserve,
      now,
    )?;
    let outcome = CreateOutcome { record_id, request, replayed: false };

    let entry = IdempotencyEntry {
      key: key.to_owned(),
      operation: "create".into(),
      fingerprint: fingerprint.clone(),
      record_id,
      response: serde_json::to_value(&outcome)?,
      created_at: at,
    };
    let row = MirrorRecord::provisional(&datum, self.config.store_ref.clone(), Some(key.to_owned()), at);

    match self.mirror.reserve(row, entry).await.map_err(Error::mirror)? {
      Claim::Claimed => {
        info!(%record_id, issuer = %datum.issuer, "prescription reserved");
        Ok(outcome)
      }
      // Lost a race with a concurrent call using the same key.
      Claim::Existing(prior) => {
        let mut outcome: CreateOutcome = replay(prior, "create", &fingerprint)?;
        outcome.replayed = true;
        Ok(outcome)
      }
    }
  }

  // ── Transitions ───────────────────────────────────────────────────────────

  pub async fn redeem_prescription(
    &self,
    input: RedeemPrescription,
    idempotency_key: &str,
  ) -> Result<TransitionOutcome> {
    let action = Action::Redeem {
      consent_code: input.consent_code,
      dispenser:    Some(input.dispenser.clone()),
    };
    self
      .transition(input.record_id, &input.dispenser, action, idempotency_key)
      .await
  }

  pub async fn refill_prescription(
    &self,
    input: RefillPrescription,
    idempotency_key: &str,
  ) -> Result<TransitionOutcome> {
    let action = Action::Refill { consent_code: input.consent_code };
    self
      .transition(input.record_id, &input.actor, action, idempotency_key)
      .await
  }

  fn consent_required(&self, action: &Action) -> bool {
    match action {
      Action::Create => false,
      Action::Redeem { .. } => self.config.policy.redeem_requires_consent,
      Action::Refill { .. } => self.config.policy.refill_requires_consent,
    }
  }

  async fn transition(
    &self,
    record_id: Uuid,
    actor: &ActorId,
    action: Action,
    idempotency_key: &str,
  ) -> Result<TransitionOutcome> {
    let key = require_key(idempotency_key)?;
    let operation = action.name();
    // Excludes the consent code: a retry with a fresh code is the same request.
    let fingerprint = fingerprint(&(operation, record_id, actor))?;
    if let Some(prior) = self.find_prior(key).await? {
      let mut outcome: TransitionOutcome = replay(prior, operation, &fingerprint)?;
      outcome.replayed = true;
      return Ok(outcome);
    }

    let current = self.current(record_id).await?;
    let now = self.clock.now();
    let at = self.clock.now_utc();
    let policy = &self.config.policy;

    // Check every other rule before spending a consent attempt.
    let assumed = TransitionContext { actor, now, consent: ConsentOutcome::Verified };
    apply_action(&current, &action, &assumed, policy)?;

    let consent = match action.consent_code() {
      Some(code) if self.consent_required(&action) => self
        .consent
        .verify(record_id, code)
        .await
        .map_err(Error::consent)?,
      _ => ConsentOutcome::NotChecked,
    };
    let ctx = TransitionContext { actor, now, consent };
    let transition = apply_action(&current, &action, &ctx, policy)?;

    let request = self.builder.build_transition(
      &current,
      Liveness::Live,
      &action,
      actor,
      transition.continuation.as_ref(),
      now,
    )?;
    let status = match transition.continuation {
      Some(_) => Status::PartiallyRedeemed,
      None => Status::Redeemed,
    };
    let outcome = TransitionOutcome {
      record_id,
      request,
      consumed: current.reference,
      status,
      replayed: false,
    };

    // The row may predate the reconciler's first sight of this record.
    let observed = derive_status(&current.datum, now);
    self
      .mirror
      .apply_observation(Observation { record: current, status: observed, observed_at: at })
      .await
      .map_err(Error::mirror)?;

    let entry = IdempotencyEntry {
      key: key.to_owned(),
      operation: operation.into(),
      fingerprint: fingerprint.clone(),
      record_id,
      response: serde_json::to_value(&outcome)?,
      created_at: at,
    };
    match self
      .mirror
      .stage_transition(record_id, status, at, entry)
      .await
      .map_err(Error::mirror)?
    {
      Claim::Claimed => {
        info!(%record_id, operation, %actor, "transition staged");
        Ok(outcome)
      }
      Claim::Existing(prior) => {
        let mut outcome: TransitionOutcome = replay(prior, operation, &fingerprint)?;
        outcome.replayed = true;
        Ok(outcome)
      }
    }
  }

  // ── Submission ────────────────────────────────────────────────────────────

  /// Forward a signed request to the authoritative store. Rejections come back
  /// as typed transition errors.
  pub async fn submit(&self, signed: SignedRequest) -> Result<Receipt> {
    let request_id = signed.request.request_id;
    match self.bounded("submit", self.ledger.submit(signed)).await? {
      SubmitOutcome::Accepted(receipt) => {
        info!(%request_id, consumed = ?receipt.consumed, produced = ?receipt.produced, "request accepted");
        Ok(receipt)
      }
      SubmitOutcome::Rejected { reason, .. } => {
        warn!(%request_id, kind = reason.kind(), "request rejected");
        Err(reason.into())
      }
    }
  }

  pub async fn request_status(&self, request_id: Uuid) -> Result<RequestStatus> {
    self
      .bounded("request_status", self.ledger.request_status(request_id))
      .await
  }

  // ── Consent ───────────────────────────────────────────────────────────────

  /// Issue a one-time code for `record_id` and queue it for delivery to the
  /// patient.
  pub async fn request_consent(&self, record_id: Uuid) -> Result<ConsentRequested> {
    let current = self.current(record_id).await?;
    let challenge = self.consent.issue(record_id).await.map_err(Error::consent)?;

    let event = Event::new(
      record_id,
      EventKind::ConsentRequested,
      format!("{}:{}", EventKind::ConsentRequested, Uuid::new_v4()),
      serde_json::json!({
        "record_id": record_id,
        "patient_commitment": current.datum.patient_commitment,
        "code": challenge.code,
        "expires_at": challenge.expires_at,
      }),
      self.clock.now_utc(),
    );
    self.mirror.emit_once(event).await.map_err(Error::mirror)?;

    info!(%record_id, expires_at = challenge.expires_at, "consent requested");
    Ok(ConsentRequested { record_id, expires_at: challenge.expires_at })
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  pub async fn get_prescription(&self, record_id: Uuid) -> Result<PrescriptionView> {
    let mirror = self.mirror.get(record_id).await.map_err(Error::mirror)?;
    let live = self
      .bounded("current_version", self.ledger.current_version(record_id))
      .await?
      .map(|entry| entry.decode())
      .transpose()?;

    if mirror.is_none() && live.is_none() {
      return Err(Error::NotFound(record_id));
    }
    Ok(PrescriptionView { mirror, live })
  }

  pub async fn search(&self, query: MirrorQuery) -> Result<Vec<MirrorRecord>> {
    let max = self.config.max_page_size;
    let query = MirrorQuery {
      limit: Some(query.limit.map_or(max, |l| l.min(max))),
      ..query
    };
    self.mirror.query(&query).await.map_err(Error::mirror)
  }
}
