use chrono::{DateTime, Utc};
use rxledger_core::{
  consent::{ConsentChallenge, ConsentStore},
  event::{Event, EventKind},
  mirror::{Claim, IdempotencyEntry, MirrorQuery, MirrorRecord, MirrorStore, Observation, UpsertOutcome},
  record::{LiveRecord, RecordRef, Status},
};
use uuid::Uuid;

use super::*;
use crate::SqliteMirror;

async fn mirror() -> SqliteMirror {
  SqliteMirror::open_in_memory()
    .await
    .expect("in-memory mirror")
}

fn at(offset: i64) -> DateTime<Utc> { DateTime::from_timestamp(NOW + offset, 0).unwrap() }

fn entry(key: &str, operation: &str, record_id: Uuid) -> IdempotencyEntry {
  IdempotencyEntry {
    key:         key.into(),
    operation:   operation.into(),
    fingerprint: format!("fp-{key}"),
    record_id,
    response:    serde_json::json!({ "record_id": record_id }),
    created_at:  at(0),
  }
}

fn live(datum: PrescriptionDatum) -> LiveRecord {
  LiveRecord {
    reference: RecordRef::new(Uuid::new_v4(), 0),
    store_ref: store_ref(),
    reserve:   RESERVE,
    datum,
  }
}

fn observe(record: &LiveRecord, status: Status) -> Observation {
  Observation { record: record.clone(), status, observed_at: at(60) }
}

// ─── Reservation and idempotency ─────────────────────────────────────────────

#[tokio::test]
async fn reserve_claims_key_once() {
  let m = mirror().await;
  let d = datum();
  let row = MirrorRecord::provisional(&d, store_ref(), Some("k1".into()), at(0));

  let first = m.reserve(row.clone(), entry("k1", "create", d.prescription_id)).await.unwrap();
  assert_eq!(first, Claim::Claimed);

  let other = datum();
  let second_row = MirrorRecord::provisional(&other, store_ref(), Some("k1".into()), at(0));
  let second = m
    .reserve(second_row, entry("k1", "create", other.prescription_id))
    .await
    .unwrap();
  let Claim::Existing(existing) = second else {
    panic!("key claimed twice");
  };
  assert_eq!(existing.record_id, d.prescription_id);

  assert!(m.get(other.prescription_id).await.unwrap().is_none());
  let stored = m.get(d.prescription_id).await.unwrap().unwrap();
  assert!(stored.is_provisional());
  assert!(stored.optimistic);
  assert_eq!(stored, row);
}

#[tokio::test]
async fn find_idempotent_round_trips_entry() {
  let m = mirror().await;
  let d = datum();
  let e = entry("k2", "create", d.prescription_id);
  m.reserve(MirrorRecord::provisional(&d, store_ref(), None, at(0)), e.clone())
    .await
    .unwrap();

  assert_eq!(m.find_idempotent("k2").await.unwrap(), Some(e));
  assert!(m.find_idempotent("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn stage_transition_sets_optimistic_status() {
  let m = mirror().await;
  let d = datum();
  let l = live(d.clone());
  m.apply_observation(observe(&l, Status::Issued)).await.unwrap();

  let claim = m
    .stage_transition(d.prescription_id, Status::Redeemed, at(90), entry("r1", "redeem", d.prescription_id))
    .await
    .unwrap();
  assert_eq!(claim, Claim::Claimed);

  let row = m.get(d.prescription_id).await.unwrap().unwrap();
  assert_eq!(row.status, Status::Redeemed);
  assert!(row.optimistic);
}

#[tokio::test]
async fn stage_transition_on_unknown_record_fails_and_releases_key() {
  let m = mirror().await;
  let id = Uuid::new_v4();
  let err = m
    .stage_transition(id, Status::Redeemed, at(0), entry("r2", "redeem", id))
    .await
    .unwrap_err();
  assert!(matches!(err, crate::Error::RecordNotFound(missing) if missing == id));
  assert!(m.find_idempotent("r2").await.unwrap().is_none());
}

// ─── Observations ────────────────────────────────────────────────────────────

#[tokio::test]
async fn apply_observation_is_idempotent() {
  let m = mirror().await;
  let l = live(datum());

  let first = m.apply_observation(observe(&l, Status::Issued)).await.unwrap();
  let second = m.apply_observation(observe(&l, Status::Issued)).await.unwrap();
  assert_eq!(first, UpsertOutcome::Inserted);
  assert_eq!(second, UpsertOutcome::Unchanged);

  let expired = m.apply_observation(observe(&l, Status::Expired)).await.unwrap();
  assert_eq!(expired, UpsertOutcome::Updated);
}

#[tokio::test]
async fn observation_confirms_provisional_row() {
  let m = mirror().await;
  let d = datum();
  m.reserve(
    MirrorRecord::provisional(&d, store_ref(), Some("k3".into()), at(0)),
    entry("k3", "create", d.prescription_id),
  )
  .await
  .unwrap();

  let l = live(d.clone());
  let outcome = m.apply_observation(observe(&l, Status::Issued)).await.unwrap();
  assert_eq!(outcome, UpsertOutcome::Updated);

  let row = m.get(d.prescription_id).await.unwrap().unwrap();
  assert_eq!(row.reference, Some(l.reference));
  assert!(!row.optimistic);
  assert_eq!(row.idempotency_key.as_deref(), Some("k3"));
}

#[tokio::test]
async fn observation_of_new_version_updates_reference() {
  let m = mirror().await;
  let d = datum();
  let v1 = live(d.clone());
  m.apply_observation(observe(&v1, Status::Issued)).await.unwrap();

  let v2 = live(PrescriptionDatum {
    refills_remaining: 1,
    continued_at: Some(NOW + 10),
    ..d.clone()
  });
  let outcome = m
    .apply_observation(observe(&v2, Status::PartiallyRedeemed))
    .await
    .unwrap();
  assert_eq!(outcome, UpsertOutcome::Updated);

  let row = m.get(d.prescription_id).await.unwrap().unwrap();
  assert_eq!(row.reference, Some(v2.reference));
  assert_eq!(row.refills_remaining, 1);
  assert_eq!(row.status, Status::PartiallyRedeemed);
}

#[tokio::test]
async fn mark_redeemed_emits_exactly_once() {
  let m = mirror().await;
  let d = datum();
  let l = live(d.clone());
  m.apply_observation(observe(&l, Status::Issued)).await.unwrap();
  assert_eq!(m.unsettled(&store_ref()).await.unwrap().len(), 1);

  let event = || Event::once_per_record(d.prescription_id, EventKind::Redeemed, serde_json::Value::Null, at(120));
  assert!(m.mark_redeemed(d.prescription_id, at(120), event()).await.unwrap());
  assert!(!m.mark_redeemed(d.prescription_id, at(180), event()).await.unwrap());

  let row = m.get(d.prescription_id).await.unwrap().unwrap();
  assert_eq!(row.status, Status::Redeemed);
  assert!(m.unsettled(&store_ref()).await.unwrap().is_empty());
  assert_eq!(m.pending_events(10).await.unwrap().len(), 1);
}

// ─── Queries ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn query_filters_and_paginates() {
  let m = mirror().await;
  let a = datum();
  let b = PrescriptionDatum { issuer: pharmacy(), issued_at: NOW + 5, ..datum() };
  let c = PrescriptionDatum { issued_at: NOW + 10, ..datum() };
  for d in [&a, &b, &c] {
    m.apply_observation(observe(&live(d.clone()), Status::Issued)).await.unwrap();
  }
  m.apply_observation(observe(&live(c.clone()), Status::Expired)).await.unwrap();

  let by_doctor = m
    .query(&MirrorQuery { issuer: Some(doctor()), ..MirrorQuery::default() })
    .await
    .unwrap();
  assert_eq!(by_doctor.len(), 2);
  assert_eq!(by_doctor[0].record_id, c.prescription_id);

  let expired = m
    .query(&MirrorQuery { status: Some(Status::Expired), ..MirrorQuery::default() })
    .await
    .unwrap();
  assert_eq!(expired.len(), 1);

  let patient = m
    .query(&MirrorQuery { patient: Some(a.patient_commitment.clone()), ..MirrorQuery::default() })
    .await
    .unwrap();
  assert_eq!(patient.len(), 3);

  let page = m
    .query(&MirrorQuery { limit: Some(1), offset: Some(1), ..MirrorQuery::default() })
    .await
    .unwrap();
  assert_eq!(page.len(), 1);
  assert_eq!(page[0].record_id, b.prescription_id);
}

// ─── Outbox ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn outbox_dedups_and_tracks_delivery() {
  let m = mirror().await;
  let id = Uuid::new_v4();
  let issued = Event::once_per_record(id, EventKind::Issued, serde_json::json!({"n": 1}), at(0));
  let dup = Event::once_per_record(id, EventKind::Issued, serde_json::json!({"n": 2}), at(1));
  let expired = Event::once_per_record(id, EventKind::Expired, serde_json::Value::Null, at(2));

  assert!(m.emit_once(issued.clone()).await.unwrap());
  assert!(!m.emit_once(dup).await.unwrap());
  assert!(m.emit_once(expired.clone()).await.unwrap());

  let pending = m.pending_events(10).await.unwrap();
  assert_eq!(pending.len(), 2);
  assert_eq!(pending[0].event, issued);
  assert_eq!(pending[0].attempts, 0);

  m.mark_failed(issued.event_id, "timeout".into(), false).await.unwrap();
  let pending = m.pending_events(10).await.unwrap();
  assert_eq!(pending[0].attempts, 1);

  m.mark_delivered(issued.event_id, at(5)).await.unwrap();
  m.mark_failed(expired.event_id, "gone".into(), true).await.unwrap();
  assert!(m.pending_events(10).await.unwrap().is_empty());
}

// ─── Consent challenges ──────────────────────────────────────────────────────

#[tokio::test]
async fn consent_challenges_count_attempts() {
  let m = mirror().await;
  let id = Uuid::new_v4();
  assert_eq!(m.record_failed_attempt(id).await.unwrap(), None);

  let challenge = ConsentChallenge {
    prescription_id: id,
    code_hash:       "abc".into(),
    expires_at:      NOW + 300,
    attempts:        0,
  };
  m.put_challenge(challenge.clone()).await.unwrap();
  assert_eq!(m.get_challenge(id).await.unwrap(), Some(challenge.clone()));

  assert_eq!(m.record_failed_attempt(id).await.unwrap(), Some(1));
  assert_eq!(m.record_failed_attempt(id).await.unwrap(), Some(2));

  m.put_challenge(challenge).await.unwrap();
  assert_eq!(m.get_challenge(id).await.unwrap().unwrap().attempts, 0);

  m.remove_challenge(id).await.unwrap();
  assert!(m.get_challenge(id).await.unwrap().is_none());
}
