//! The prescription state machine.
//!
//! Pure, synchronous functions: no I/O, no clock reads, no randomness. The
//! caller supplies `now`, the acting identity, and the outcome of any consent
//! check, so every decision here is reproducible in tests.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  builder::UnsignedRequest,
  codec::decode_datum,
  commitment::Commitment,
  error::{TransitionError, ValidationError},
  record::{Action, ActorId, LiveRecord, PrescriptionDatum, RecordRef},
};

// ─── Creation ────────────────────────────────────────────────────────────────

/// Everything needed to mint the first version of a prescription. The patient
/// identifier has already been replaced by its commitment.
#[derive(Debug, Clone)]
pub struct PrescriptionDraft {
  pub prescription_id:    Uuid,
  pub patient_commitment: Commitment,
  pub drug_id:            String,
  pub dosage:             String,
  pub quantity:           u32,
  pub issuer:             ActorId,
  pub issued_at:          i64,
  pub expiry_at:          i64,
  pub refills_remaining:  u32,
  pub metadata_ref:       Option<String>,
}

pub fn validate_create(draft: PrescriptionDraft) -> Result<PrescriptionDatum, ValidationError> {
  if draft.patient_commitment.as_str().is_empty() {
    return Err(ValidationError::MissingField("patient_commitment"));
  }
  if draft.drug_id.trim().is_empty() {
    return Err(ValidationError::MissingField("drug_id"));
  }
  if draft.dosage.trim().is_empty() {
    return Err(ValidationError::MissingField("dosage"));
  }
  if draft.issuer.as_str().trim().is_empty() {
    return Err(ValidationError::MissingField("issuer"));
  }
  if draft.quantity == 0 {
    return Err(ValidationError::ZeroQuantity);
  }
  if draft.issued_at >= draft.expiry_at {
    return Err(ValidationError::InvalidValidityWindow {
      issued_at: draft.issued_at,
      expiry_at: draft.expiry_at,
    });
  }

  Ok(PrescriptionDatum {
    prescription_id:    draft.prescription_id,
    patient_commitment: draft.patient_commitment,
    drug_id:            draft.drug_id,
    dosage:             draft.dosage,
    quantity:           draft.quantity,
    issuer:             draft.issuer,
    issued_at:          draft.issued_at,
    expiry_at:          draft.expiry_at,
    refills_remaining:  draft.refills_remaining,
    metadata_ref:       draft.metadata_ref,
    continued_at:       None,
  })
}

/// Only the issuer named in the datum may create it.
pub fn authorize_create(datum: &PrescriptionDatum, actor: &ActorId) -> Result<(), TransitionError> {
  if &datum.issuer != actor {
    return Err(TransitionError::Unauthorized { actor: actor.clone() });
  }
  Ok(())
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Deployment policy for transitions against existing records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionPolicy {
  /// Dispensing requires a verified patient consent code.
  pub redeem_requires_consent: bool,
  pub refill_requires_consent: bool,
  /// Actors other than the issuer allowed to authorize refills.
  pub refill_authorities:      Vec<ActorId>,
}

impl Default for TransitionPolicy {
  fn default() -> Self {
    Self {
      redeem_requires_consent: true,
      refill_requires_consent: false,
      refill_authorities:      Vec::new(),
    }
  }
}

impl TransitionPolicy {
  fn may_refill(&self, datum: &PrescriptionDatum, actor: &ActorId) -> bool {
    &datum.issuer == actor || self.refill_authorities.contains(actor)
  }
}

// ─── Transitions ─────────────────────────────────────────────────────────────

/// Result of asking the external consent gate about a presented code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentOutcome {
  Verified,
  Rejected,
  /// No code was presented, or the gate was not consulted.
  NotChecked,
}

/// Who is acting, when, and what the consent gate said.
#[derive(Debug, Clone)]
pub struct TransitionContext<'a> {
  pub actor:   &'a ActorId,
  pub now:     i64,
  pub consent: ConsentOutcome,
}

/// The effect of an accepted action: the consumed version and, for REFILL,
/// the datum of the next version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
  pub consumed:     RecordRef,
  pub continuation: Option<PrescriptionDatum>,
}

fn check_consent(
  required: bool,
  action: &Action,
  outcome: ConsentOutcome,
) -> Result<(), TransitionError> {
  if !required {
    return Ok(());
  }
  if action.consent_code().is_none() {
    return Err(TransitionError::ConsentRequired);
  }
  match outcome {
    ConsentOutcome::Verified => Ok(()),
    ConsentOutcome::Rejected | ConsentOutcome::NotChecked => Err(TransitionError::ConsentInvalid),
  }
}

/// Decide whether `action` may be applied to `current`.
///
/// REDEEM always consumes the current version with no continuation; moving to
/// a further fill is only possible through REFILL.
pub fn apply_action(
  current: &LiveRecord,
  action: &Action,
  ctx: &TransitionContext<'_>,
  policy: &TransitionPolicy,
) -> Result<Transition, TransitionError> {
  let datum = &current.datum;

  match action {
    Action::Create => Err(TransitionError::InvalidAction {
      reason: "create cannot be applied to an existing record".into(),
    }),

    Action::Redeem { .. } => {
      if datum.is_expired(ctx.now) {
        return Err(TransitionError::Expired { expiry_at: datum.expiry_at, now: ctx.now });
      }
      check_consent(policy.redeem_requires_consent, action, ctx.consent)?;
      Ok(Transition { consumed: current.reference, continuation: None })
    }

    Action::Refill { .. } => {
      if datum.refills_remaining == 0 {
        return Err(TransitionError::NoRefillsRemaining);
      }
      if datum.is_expired(ctx.now) {
        return Err(TransitionError::Expired { expiry_at: datum.expiry_at, now: ctx.now });
      }
      if !policy.may_refill(datum, ctx.actor) {
        return Err(TransitionError::Unauthorized { actor: ctx.actor.clone() });
      }
      check_consent(policy.refill_requires_consent, action, ctx.consent)?;

      let next = PrescriptionDatum {
        refills_remaining: datum.refills_remaining - 1,
        continued_at: Some(ctx.now),
        ..datum.clone()
      };
      Ok(Transition { consumed: current.reference, continuation: Some(next) })
    }
  }
}

// ─── Store-side validation ───────────────────────────────────────────────────

fn invalid(reason: impl Into<String>) -> TransitionError {
  TransitionError::InvalidAction { reason: reason.into() }
}

/// The authoritative store's own check of a submitted request, run before a
/// transition is accepted. Consent is gated off-record and is not re-checked
/// here; everything that can be decided from the request itself is.
///
/// Returns the datum of the produced version, if any.
pub fn verify_request(
  current: Option<&LiveRecord>,
  request: &UnsignedRequest,
  signer: &ActorId,
  now: i64,
  policy: &TransitionPolicy,
) -> Result<Option<PrescriptionDatum>, TransitionError> {
  if &request.actor != signer {
    return Err(TransitionError::Unauthorized { actor: signer.clone() });
  }

  let produced = request
    .output
    .as_ref()
    .map(|out| decode_datum(&out.datum).map_err(|e| invalid(format!("undecodable datum: {e}"))))
    .transpose()?;

  match (&request.action, current, request.consumes) {
    (Action::Create, None, None) => {
      let datum = produced.ok_or_else(|| invalid("create must produce a record"))?;
      authorize_create(&datum, signer)?;
      if datum.quantity == 0 || datum.issued_at >= datum.expiry_at || datum.continued_at.is_some() {
        return Err(invalid("created record is malformed"));
      }
      Ok(Some(datum))
    }

    (Action::Redeem { dispenser, .. }, Some(live), Some(consumed)) if consumed == live.reference => {
      if produced.is_some() {
        return Err(invalid("redeem must not produce a continuation"));
      }
      if dispenser.as_ref().is_some_and(|d| d != signer) {
        return Err(TransitionError::Unauthorized { actor: signer.clone() });
      }
      if live.datum.is_expired(now) {
        return Err(TransitionError::Expired { expiry_at: live.datum.expiry_at, now });
      }
      Ok(None)
    }

    (Action::Refill { .. }, Some(live), Some(consumed)) if consumed == live.reference => {
      let prev = &live.datum;
      if prev.refills_remaining == 0 {
        return Err(TransitionError::NoRefillsRemaining);
      }
      if prev.is_expired(now) {
        return Err(TransitionError::Expired { expiry_at: prev.expiry_at, now });
      }
      if !policy.may_refill(prev, signer) {
        return Err(TransitionError::Unauthorized { actor: signer.clone() });
      }

      let next = produced.ok_or_else(|| invalid("refill must produce a continuation"))?;
      let output = request
        .output
        .as_ref()
        .ok_or_else(|| invalid("refill must produce a continuation"))?;
      if !prev.same_prescription(&next)
        || next.refills_remaining != prev.refills_remaining - 1
        || next.continued_at.is_none()
      {
        return Err(invalid("continuation does not follow from the consumed record"));
      }
      if output.store_ref != live.store_ref || output.reserve < live.reserve {
        return Err(invalid("continuation must stay at the same location and reserve"));
      }
      Ok(Some(next))
    }

    (Action::Create, Some(_), _) | (Action::Create, None, Some(_)) => {
      Err(invalid("create cannot consume a record"))
    }
    _ => Err(invalid("request does not reference the live record version")),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    builder::{Liveness, SequentialReferences, TransactionBuilder},
    record::StoreRef,
  };

  const DAY: i64 = 24 * 60 * 60;
  const NOW: i64 = 1_700_000_000;

  fn doctor() -> ActorId { ActorId::new("doctor-pkh") }
  fn pharmacy() -> ActorId { ActorId::new("pharmacy-pkh") }

  fn draft() -> PrescriptionDraft {
    PrescriptionDraft {
      prescription_id:    Uuid::new_v4(),
      patient_commitment: Commitment::from_hex("a665a459"),
      drug_id:            "DRUG-12345".into(),
      dosage:             "500mg twice daily".into(),
      quantity:           30,
      issuer:             doctor(),
      issued_at:          NOW,
      expiry_at:          NOW + 30 * DAY,
      refills_remaining:  2,
      metadata_ref:       None,
    }
  }

  fn live(datum: PrescriptionDatum) -> LiveRecord {
    LiveRecord {
      reference: RecordRef::new(Uuid::new_v4(), 0),
      store_ref: StoreRef::new("script-addr"),
      reserve:   2_000_000,
      datum,
    }
  }

  fn no_consent_policy() -> TransitionPolicy {
    TransitionPolicy { redeem_requires_consent: false, ..TransitionPolicy::default() }
  }

  fn ctx(actor: &ActorId, now: i64) -> TransitionContext<'_> {
    TransitionContext { actor, now, consent: ConsentOutcome::NotChecked }
  }

  fn redeem() -> Action { Action::Redeem { consent_code: None, dispenser: None } }
  fn refill() -> Action { Action::Refill { consent_code: None } }

  // ── validate_create ────────────────────────────────────────────────────────

  #[test]
  fn validate_create_accepts_boundaries() {
    let mut d = draft();
    d.quantity = 1;
    d.refills_remaining = 0;
    d.expiry_at = d.issued_at + 1;
    let datum = validate_create(d).unwrap();
    assert_eq!(datum.quantity, 1);
    assert_eq!(datum.continued_at, None);
  }

  #[test]
  fn validate_create_rejects_bad_window() {
    let mut d = draft();
    d.expiry_at = d.issued_at;
    assert!(matches!(
      validate_create(d),
      Err(ValidationError::InvalidValidityWindow { .. })
    ));
  }

  #[test]
  fn validate_create_rejects_zero_quantity() {
    let mut d = draft();
    d.quantity = 0;
    assert_eq!(validate_create(d), Err(ValidationError::ZeroQuantity));
  }

  #[test]
  fn validate_create_requires_fields() {
    let mut d = draft();
    d.drug_id = "  ".into();
    assert_eq!(validate_create(d), Err(ValidationError::MissingField("drug_id")));

    let mut d = draft();
    d.dosage = String::new();
    assert_eq!(validate_create(d), Err(ValidationError::MissingField("dosage")));
  }

  // ── REDEEM ─────────────────────────────────────────────────────────────────

  #[test]
  fn redeem_single_use_is_terminal() {
    let mut d = draft();
    d.refills_remaining = 0;
    let record = live(validate_create(d).unwrap());

    let t = apply_action(&record, &redeem(), &ctx(&pharmacy(), NOW + DAY), &no_consent_policy())
      .unwrap();
    assert_eq!(t.consumed, record.reference);
    assert!(t.continuation.is_none());
  }

  #[test]
  fn redeem_with_refills_still_terminates_current_version() {
    let record = live(validate_create(draft()).unwrap());
    let t = apply_action(&record, &redeem(), &ctx(&pharmacy(), NOW), &no_consent_policy())
      .unwrap();
    assert!(t.continuation.is_none());
  }

  #[test]
  fn redeem_expiry_boundary_is_inclusive() {
    let record = live(validate_create(draft()).unwrap());
    let expiry = record.datum.expiry_at;
    let policy = no_consent_policy();

    assert!(apply_action(&record, &redeem(), &ctx(&pharmacy(), expiry), &policy).is_ok());
    assert_eq!(
      apply_action(&record, &redeem(), &ctx(&pharmacy(), expiry + 1), &policy),
      Err(TransitionError::Expired { expiry_at: expiry, now: expiry + 1 })
    );
  }

  #[test]
  fn redeem_consent_gate() {
    let record = live(validate_create(draft()).unwrap());
    let policy = TransitionPolicy::default();
    let actor = pharmacy();

    assert_eq!(
      apply_action(&record, &redeem(), &ctx(&actor, NOW), &policy),
      Err(TransitionError::ConsentRequired)
    );

    let with_code = Action::Redeem { consent_code: Some("123456".into()), dispenser: None };
    let rejected = TransitionContext { actor: &actor, now: NOW, consent: ConsentOutcome::Rejected };
    assert_eq!(
      apply_action(&record, &with_code, &rejected, &policy),
      Err(TransitionError::ConsentInvalid)
    );

    let verified = TransitionContext { actor: &actor, now: NOW, consent: ConsentOutcome::Verified };
    assert!(apply_action(&record, &with_code, &verified, &policy).is_ok());
  }

  #[test]
  fn expiry_is_checked_before_consent() {
    let record = live(validate_create(draft()).unwrap());
    let late = record.datum.expiry_at + 10;
    assert!(matches!(
      apply_action(&record, &redeem(), &ctx(&pharmacy(), late), &TransitionPolicy::default()),
      Err(TransitionError::Expired { .. })
    ));
  }

  #[test]
  fn create_is_not_a_transition() {
    let record = live(validate_create(draft()).unwrap());
    let err = apply_action(&record, &Action::Create, &ctx(&doctor(), NOW), &no_consent_policy())
      .unwrap_err();
    assert!(err.is_terminal());
  }

  // ── REFILL ─────────────────────────────────────────────────────────────────

  #[test]
  fn refill_n_times_then_fail() {
    let mut d = draft();
    d.refills_remaining = 3;
    let mut record = live(validate_create(d).unwrap());
    let policy = no_consent_policy();

    for expected in (0..3).rev() {
      let t = apply_action(&record, &refill(), &ctx(&doctor(), NOW + 1), &policy).unwrap();
      let next = t.continuation.expect("refill continues");
      assert_eq!(next.refills_remaining, expected);
      assert!(next.same_prescription(&record.datum));
      assert_eq!(next.continued_at, Some(NOW + 1));
      record = LiveRecord {
        reference: RecordRef::new(Uuid::new_v4(), 0),
        datum: next,
        ..record
      };
    }

    assert_eq!(
      apply_action(&record, &refill(), &ctx(&doctor(), NOW + 1), &policy),
      Err(TransitionError::NoRefillsRemaining)
    );
  }

  #[test]
  fn refill_requires_issuer_or_authority() {
    let record = live(validate_create(draft()).unwrap());
    let stranger = ActorId::new("someone-else");

    assert_eq!(
      apply_action(&record, &refill(), &ctx(&stranger, NOW), &no_consent_policy()),
      Err(TransitionError::Unauthorized { actor: stranger.clone() })
    );

    let policy = TransitionPolicy {
      redeem_requires_consent: false,
      refill_requires_consent: false,
      refill_authorities:      vec![stranger.clone()],
    };
    assert!(apply_action(&record, &refill(), &ctx(&stranger, NOW), &policy).is_ok());
  }

  #[test]
  fn refill_after_expiry_fails() {
    let record = live(validate_create(draft()).unwrap());
    let late = record.datum.expiry_at + 1;
    assert!(matches!(
      apply_action(&record, &refill(), &ctx(&doctor(), late), &no_consent_policy()),
      Err(TransitionError::Expired { .. })
    ));
  }

  #[test]
  fn error_classification() {
    assert!(TransitionError::NoRefillsRemaining.is_terminal());
    assert!(TransitionError::ConsentRequired.is_retryable());
    assert!(
      TransitionError::StaleReference { reference: RecordRef::new(Uuid::nil(), 0) }.is_retryable()
    );
  }

  // ── verify_request ─────────────────────────────────────────────────────────

  fn builder() -> TransactionBuilder<SequentialReferences> {
    TransactionBuilder::with_references(SequentialReferences::default())
  }

  #[test]
  fn verify_create_checks_issuer_signature() {
    let datum = validate_create(draft()).unwrap();
    let req = builder()
      .build_create(&datum, &StoreRef::new("script-addr"), &doctor(), 2_000_000, NOW)
      .unwrap();

    let policy = TransitionPolicy::default();
    assert_eq!(verify_request(None, &req, &doctor(), NOW, &policy).unwrap(), Some(datum));
    assert!(matches!(
      verify_request(None, &req, &pharmacy(), NOW, &policy),
      Err(TransitionError::Unauthorized { .. })
    ));
  }

  #[test]
  fn verify_refill_rejects_tampered_continuation() {
    let record = live(validate_create(draft()).unwrap());
    let mut tampered = record.datum.clone();
    tampered.refills_remaining = record.datum.refills_remaining;
    tampered.continued_at = Some(NOW);

    let req = builder()
      .build_transition(&record, Liveness::Live, &refill(), &doctor(), Some(&tampered), NOW)
      .unwrap();
    assert!(matches!(
      verify_request(Some(&record), &req, &doctor(), NOW, &TransitionPolicy::default()),
      Err(TransitionError::InvalidAction { .. })
    ));
  }

  #[test]
  fn verify_redeem_must_reference_live_version() {
    let record = live(validate_create(draft()).unwrap());
    let req = builder()
      .build_transition(&record, Liveness::Live, &redeem(), &pharmacy(), None, NOW)
      .unwrap();

    let other = LiveRecord { reference: RecordRef::new(Uuid::new_v4(), 0), ..record.clone() };
    assert!(verify_request(Some(&record), &req, &pharmacy(), NOW, &no_consent_policy()).is_ok());
    assert!(matches!(
      verify_request(Some(&other), &req, &pharmacy(), NOW, &no_consent_policy()),
      Err(TransitionError::InvalidAction { .. })
    ));
  }
}
