//! [`SqliteLedger`], the SQLite implementation of [`Ledger`].
//!
//! Every produced version is a row in `ledger_outputs`. Consumption is a
//! compare-and-swap on `spent_by IS NULL` inside the same transaction that
//! inserts the continuation and records the outcome, so two requests racing
//! for one version cannot both be accepted.

use std::{path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, types::Value};
use tracing::debug;
use uuid::Uuid;

use rxledger_core::{
  builder::SignedRequest,
  clock::{Clock, SystemClock},
  error::TransitionError,
  ledger::{Ledger, LedgerEntry, Receipt, RequestStatus, SubmitOutcome},
  lifecycle::{TransitionPolicy, verify_request},
  record::{LiveRecord, RecordRef, StoreRef},
};

use crate::{
  Error, Result,
  encode::{RawOutput, encode_amount, encode_dt, encode_uuid},
  schema::LEDGER_SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// An authoritative record store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteLedger {
  conn:   tokio_rusqlite::Connection,
  clock:  Arc<dyn Clock>,
  policy: Arc<TransitionPolicy>,
}

impl SqliteLedger {
  /// Open (or create) a ledger at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open an in-memory ledger, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch(LEDGER_SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(Self {
      conn,
      clock: Arc::new(SystemClock),
      policy: Arc::new(TransitionPolicy::default()),
    })
  }

  /// Replace the time source used to judge expiry and stamp receipts.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
    self.policy = Arc::new(policy);
    self
  }

  async fn select_live(
    &self,
    filter: &'static str,
    params: Vec<Value>,
  ) -> Result<Vec<LedgerEntry>> {
    let sql = format!(
      "SELECT {} FROM ledger_outputs WHERE spent_by IS NULL AND {filter} ORDER BY rowid",
      RawOutput::COLUMNS
    );

    let raws: Vec<RawOutput> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params.iter()), RawOutput::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawOutput::into_entry).collect()
  }
}

// ─── Submission ──────────────────────────────────────────────────────────────

fn other(e: impl std::error::Error + Send + Sync + 'static) -> tokio_rusqlite::Error {
  tokio_rusqlite::Error::Other(Box::new(e))
}

fn invalid(reason: impl Into<String>) -> TransitionError {
  TransitionError::InvalidAction { reason: reason.into() }
}

fn recorded_outcome(
  conn: &rusqlite::Connection,
  request_id: Uuid,
) -> tokio_rusqlite::Result<Option<SubmitOutcome>> {
  let json: Option<String> = conn
    .query_row(
      "SELECT outcome FROM ledger_requests WHERE request_id = ?1",
      rusqlite::params![encode_uuid(request_id)],
      |r| r.get(0),
    )
    .optional()?;
  json
    .map(|s| serde_json::from_str(&s))
    .transpose()
    .map_err(other)
}

/// Decide a request and, if it is accepted, apply it. Every check runs before
/// the first write; the only write that can still lose is the swap itself.
fn decide(
  conn: &rusqlite::Connection,
  signed: &SignedRequest,
  reserve: Option<i64>,
  now: i64,
  accepted_at: DateTime<Utc>,
  policy: &TransitionPolicy,
) -> tokio_rusqlite::Result<SubmitOutcome> {
  let request = &signed.request;
  let reject = |reason: TransitionError| -> tokio_rusqlite::Result<SubmitOutcome> {
    Ok(SubmitOutcome::Rejected { request_id: request.request_id, reason })
  };

  let current: Option<LiveRecord> = match request.consumes {
    None => None,
    Some(reference) => {
      let row = conn
        .query_row(
          &format!(
            "SELECT {}, spent_by FROM ledger_outputs WHERE tx_id = ?1 AND output_index = ?2",
            RawOutput::COLUMNS
          ),
          rusqlite::params![encode_uuid(reference.tx_id), reference.index],
          |row| Ok((RawOutput::from_row(row)?, row.get::<_, Option<String>>(5)?)),
        )
        .optional()?;
      match row {
        None => return reject(invalid(format!("unknown reference {reference}"))),
        Some((_, Some(_))) => return reject(TransitionError::StaleReference { reference }),
        Some((raw, None)) => {
          let entry = raw.into_entry().map_err(other)?;
          Some(entry.decode().map_err(other)?)
        }
      }
    }
  };

  let produced = match verify_request(current.as_ref(), request, &signed.signer, now, policy) {
    Ok(produced) => produced,
    Err(reason) => return reject(reason),
  };

  let derived = RecordRef::new(request.request_id, 0);
  if request.output.as_ref().is_some_and(|o| o.reference != derived) {
    return reject(invalid("produced reference must be derived from the request id"));
  }

  if let (None, Some(datum)) = (request.consumes, &produced) {
    let taken: bool = conn.query_row(
      "SELECT EXISTS(SELECT 1 FROM ledger_outputs WHERE record_id = ?1)",
      rusqlite::params![encode_uuid(datum.prescription_id)],
      |r| r.get(0),
    )?;
    if taken {
      return reject(invalid(format!("prescription {} already exists", datum.prescription_id)));
    }
  }

  if let Some(reference) = request.consumes {
    let swapped = conn.execute(
      "UPDATE ledger_outputs SET spent_by = ?1, spent_at = ?2
       WHERE tx_id = ?3 AND output_index = ?4 AND spent_by IS NULL",
      rusqlite::params![
        encode_uuid(request.request_id),
        encode_dt(accepted_at),
        encode_uuid(reference.tx_id),
        reference.index,
      ],
    )?;
    if swapped == 0 {
      return reject(TransitionError::StaleReference { reference });
    }
  }

  let mut produced_ref = None;
  if let (Some(output), Some(datum), Some(reserve)) = (&request.output, &produced, reserve) {
    conn.execute(
      "INSERT INTO ledger_outputs (
         tx_id, output_index, record_id, store_ref, reserve, datum, created_at
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      rusqlite::params![
        encode_uuid(output.reference.tx_id),
        output.reference.index,
        encode_uuid(datum.prescription_id),
        output.store_ref.as_str(),
        reserve,
        output.datum,
        encode_dt(accepted_at),
      ],
    )?;
    produced_ref = Some(output.reference);
  }

  Ok(SubmitOutcome::Accepted(Receipt {
    request_id: request.request_id,
    consumed: request.consumes,
    produced: produced_ref,
    accepted_at,
  }))
}

// ─── Ledger impl ─────────────────────────────────────────────────────────────

impl Ledger for SqliteLedger {
  type Error = Error;

  async fn live_records<'a>(&'a self, store_ref: &'a StoreRef) -> Result<Vec<LedgerEntry>> {
    self
      .select_live("store_ref = ?1", vec![Value::Text(store_ref.as_str().to_owned())])
      .await
  }

  async fn lookup(&self, reference: RecordRef) -> Result<Option<LedgerEntry>> {
    let mut found = self
      .select_live(
        "tx_id = ?1 AND output_index = ?2",
        vec![
          Value::Text(encode_uuid(reference.tx_id)),
          Value::Integer(i64::from(reference.index)),
        ],
      )
      .await?;
    Ok(found.pop())
  }

  async fn current_version(&self, record_id: Uuid) -> Result<Option<LedgerEntry>> {
    let mut found = self
      .select_live("record_id = ?1", vec![Value::Text(encode_uuid(record_id))])
      .await?;
    Ok(found.pop())
  }

  async fn submit(&self, signed: SignedRequest) -> Result<SubmitOutcome> {
    let request_id = signed.request.request_id;

    if signed.request.digest()? != signed.signature {
      debug!(%request_id, "signature does not cover the submitted request");
      return Ok(SubmitOutcome::Rejected {
        request_id,
        reason: invalid("signature does not match the request"),
      });
    }

    let reserve = signed
      .request
      .output
      .as_ref()
      .map(|o| encode_amount(o.reserve))
      .transpose()?;
    let now = self.clock.now();
    let accepted_at = self.clock.now_utc();
    let policy = Arc::clone(&self.policy);

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if let Some(prior) = recorded_outcome(&tx, request_id)? {
          return Ok(prior);
        }

        let outcome = decide(&tx, &signed, reserve, now, accepted_at, &policy)?;
        tx.execute(
          "INSERT INTO ledger_requests (request_id, outcome, recorded_at) VALUES (?1, ?2, ?3)",
          rusqlite::params![
            encode_uuid(request_id),
            serde_json::to_string(&outcome).map_err(other)?,
            encode_dt(accepted_at),
          ],
        )?;
        tx.commit()?;
        Ok(outcome)
      })
      .await?;

    if let SubmitOutcome::Rejected { reason, .. } = &outcome {
      debug!(%request_id, kind = reason.kind(), "request rejected");
    }
    Ok(outcome)
  }

  async fn request_status(&self, request_id: Uuid) -> Result<RequestStatus> {
    let outcome = self
      .conn
      .call(move |conn| recorded_outcome(conn, request_id))
      .await?;

    Ok(match outcome {
      Some(SubmitOutcome::Accepted(receipt)) => RequestStatus::Accepted(receipt),
      Some(SubmitOutcome::Rejected { reason, .. }) => RequestStatus::Rejected { reason },
      None => RequestStatus::Unknown,
    })
  }
}
