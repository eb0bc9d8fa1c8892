//! Integration tests for the SQLite stores against in-memory databases.

mod mirror;

use std::sync::Arc;

use rxledger_core::{
  builder::{SequentialReferences, SignedRequest, TransactionBuilder},
  clock::ManualClock,
  commitment::hash_identifier,
  ledger::{Ledger, SubmitOutcome},
  record::{ActorId, LiveRecord, PrescriptionDatum, StoreRef},
};
use uuid::Uuid;

use crate::SqliteLedger;

pub const DAY: i64 = 24 * 60 * 60;
pub const NOW: i64 = 1_700_000_000;
pub const RESERVE: u64 = 2_000_000;

pub fn doctor() -> ActorId { ActorId::new("doctor-pkh") }
pub fn pharmacy() -> ActorId { ActorId::new("pharmacy-pkh") }
pub fn store_ref() -> StoreRef { StoreRef::new("script:prescriptions") }

pub fn builder() -> TransactionBuilder<SequentialReferences> {
  TransactionBuilder::with_references(SequentialReferences::default())
}

pub fn datum() -> PrescriptionDatum {
  PrescriptionDatum {
    prescription_id:    Uuid::new_v4(),
    patient_commitment: hash_identifier("patient-42", "test-salt").unwrap(),
    drug_id:            "DRUG-12345".into(),
    dosage:             "500mg twice daily".into(),
    quantity:           30,
    issuer:             doctor(),
    issued_at:          NOW,
    expiry_at:          NOW + 30 * DAY,
    refills_remaining:  2,
    metadata_ref:       Some("ipfs://meta".into()),
    continued_at:       None,
  }
}

pub async fn ledger() -> (SqliteLedger, Arc<ManualClock>) {
  let clock = Arc::new(ManualClock::at(NOW));
  let ledger = SqliteLedger::open_in_memory()
    .await
    .expect("in-memory ledger")
    .with_clock(clock.clone());
  (ledger, clock)
}

/// Submit a create for `datum` and return the live version it produced.
pub async fn create(
  ledger: &SqliteLedger,
  builder: &TransactionBuilder<SequentialReferences>,
  datum: &PrescriptionDatum,
) -> LiveRecord {
  let request = builder
    .build_create(datum, &store_ref(), &datum.issuer, RESERVE, NOW)
    .unwrap();
  let signed = SignedRequest::attest(request, datum.issuer.clone()).unwrap();
  let receipt = match ledger.submit(signed).await.unwrap() {
    SubmitOutcome::Accepted(receipt) => receipt,
    other => panic!("create rejected: {other:?}"),
  };
  ledger
    .lookup(receipt.produced.unwrap())
    .await
    .unwrap()
    .unwrap()
    .decode()
    .unwrap()
}
