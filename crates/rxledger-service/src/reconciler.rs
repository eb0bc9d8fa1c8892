//! Ledger → mirror reconciliation.
//!
//! One pass reads every live version at each monitored location, upserts it
//! into the mirror, and settles rows whose record the ledger confirms has left
//! the live set. Every write is idempotent, so a pass interrupted half-way is
//! simply repeated.

use std::{collections::HashSet, sync::Arc};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rxledger_core::{
  clock::{Clock, SystemClock},
  event::{Event, EventKind},
  ledger::Ledger,
  mirror::{MirrorStore, Observation, UpsertOutcome},
  record::{LiveRecord, RecordRef, Status, StoreRef, derive_status},
};

use crate::{Error, Result, config::ReconcilerConfig};

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub observed:  usize,
  pub inserted:  usize,
  pub updated:   usize,
  /// Live entries whose datum could not be decoded.
  pub skipped:   usize,
  pub redeemed:  usize,
  /// Events newly queued this pass.
  pub emitted:   usize,
  /// Monitored locations whose pass failed.
  pub failed:    usize,
}

pub struct Reconciler<L, M> {
  ledger:     Arc<L>,
  mirror:     Arc<M>,
  clock:      Arc<dyn Clock>,
  store_refs: Vec<StoreRef>,
  config:     ReconcilerConfig,
}

fn record_payload(record: &LiveRecord, status: Status) -> serde_json::Value {
  let datum = &record.datum;
  serde_json::json!({
    "record_id": datum.prescription_id,
    "reference": record.reference,
    "patient_commitment": datum.patient_commitment,
    "issuer": datum.issuer,
    "drug_id": datum.drug_id,
    "expiry_at": datum.expiry_at,
    "refills_remaining": datum.refills_remaining,
    "status": status,
  })
}

impl<L, M> Reconciler<L, M>
where
  L: Ledger,
  M: MirrorStore,
{
  /// `default_store_ref` is monitored when the configuration names none.
  pub fn new(
    ledger: Arc<L>,
    mirror: Arc<M>,
    default_store_ref: StoreRef,
    config: ReconcilerConfig,
  ) -> Self {
    let store_refs = if config.store_refs.is_empty() {
      vec![default_store_ref]
    } else {
      config.store_refs.clone()
    };
    Self { ledger, mirror, clock: Arc::new(SystemClock), store_refs, config }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Run one full pass over every monitored location. A location that fails
  /// is logged and counted; the pass errors only when every location failed.
  pub async fn sync_once(&self) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let mut last_error = None;
    for store_ref in &self.store_refs {
      if let Err(e) = self.sync_store(store_ref, &mut report).await {
        warn!(%store_ref, error = %e, "store reconciliation failed");
        report.failed += 1;
        last_error = Some(e);
      }
    }
    match last_error {
      Some(e) if report.failed == self.store_refs.len() => Err(e),
      _ => Ok(report),
    }
  }

  async fn emit(&self, event: Event, report: &mut SyncReport) -> Result<()> {
    if self.mirror.emit_once(event).await.map_err(Error::mirror)? {
      report.emitted += 1;
    }
    Ok(())
  }

  async fn sync_store(&self, store_ref: &StoreRef, report: &mut SyncReport) -> Result<()> {
    let entries = self
      .ledger
      .live_records(store_ref)
      .await
      .map_err(Error::store)?;
    let now = self.clock.now();
    let at = self.clock.now_utc();

    let mut live_ids = HashSet::<Uuid>::with_capacity(entries.len());
    let mut undecodable = HashSet::<RecordRef>::new();
    for entry in entries {
      let record = match entry.decode() {
        Ok(record) => record,
        Err(e) => {
          warn!(reference = %entry.reference, %store_ref, error = %e, "skipping undecodable ledger entry");
          report.skipped += 1;
          undecodable.insert(entry.reference);
          continue;
        }
      };
      report.observed += 1;

      let record_id = record.datum.prescription_id;
      live_ids.insert(record_id);
      let status = derive_status(&record.datum, now);

      let issued = Event::once_per_record(
        record_id,
        EventKind::Issued,
        record_payload(&record, status),
        at,
      );
      let refilled = record.datum.continued_at.map(|_| {
        Event::once_per_version(
          record_id,
          EventKind::Refilled,
          record.reference,
          record_payload(&record, status),
          at,
        )
      });
      let expired = (status == Status::Expired).then(|| {
        Event::once_per_record(record_id, EventKind::Expired, record_payload(&record, status), at)
      });

      let outcome = self
        .mirror
        .apply_observation(Observation { record, status, observed_at: at })
        .await
        .map_err(Error::mirror)?;
      match outcome {
        UpsertOutcome::Inserted => report.inserted += 1,
        UpsertOutcome::Updated => report.updated += 1,
        UpsertOutcome::Unchanged => {}
      }

      self.emit(issued, report).await?;
      if let Some(event) = refilled {
        self.emit(event, report).await?;
      }
      if let Some(event) = expired {
        self.emit(event, report).await?;
      }
    }

    // Anything the mirror still considers live but the ledger no longer holds
    // was consumed without a successor.
    let unsettled = self
      .mirror
      .unsettled(store_ref)
      .await
      .map_err(Error::mirror)?;
    let candidates = unsettled.into_iter().filter(|r| {
      !live_ids.contains(&r.record_id)
        && !r.reference.is_some_and(|reference| undecodable.contains(&reference))
    });
    for row in candidates {
      if let Some(entry) = self
        .ledger
        .current_version(row.record_id)
        .await
        .map_err(Error::store)?
      {
        debug!(record_id = %row.record_id, reference = %entry.reference, "still live, not settling");
        continue;
      }

      let event = Event::once_per_record(
        row.record_id,
        EventKind::Redeemed,
        serde_json::json!({
          "record_id": row.record_id,
          "reference": row.reference,
          "patient_commitment": row.patient_commitment,
          "issuer": row.issuer,
          "drug_id": row.drug_id,
        }),
        at,
      );
      if self
        .mirror
        .mark_redeemed(row.record_id, at, event)
        .await
        .map_err(Error::mirror)?
      {
        info!(record_id = %row.record_id, %store_ref, "prescription redeemed");
        report.redeemed += 1;
        report.emitted += 1;
      }
    }

    debug!(%store_ref, ?report, "store reconciled");
    Ok(())
  }

  /// Poll until `shutdown` flips to `true` or its sender is dropped. A failed
  /// pass is logged and retried on the next tick.
  pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(self.config.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(stores = ?self.store_refs, interval = ?self.config.poll_interval(), "reconciler started");

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          match self.sync_once().await {
            Ok(report) if report != SyncReport::default() => {
              info!(?report, "reconciliation pass complete");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "reconciliation pass failed"),
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    info!("reconciler stopped");
  }
}
