//! [`SqliteMirror`], the SQLite implementation of [`MirrorStore`] and
//! [`ConsentStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, types::Value};
use uuid::Uuid;

use rxledger_core::{
  consent::{ConsentChallenge, ConsentStore},
  event::{DeliveryState, Event, PendingEvent},
  mirror::{
    Claim, IdempotencyEntry, MirrorQuery, MirrorRecord, MirrorStore, Observation, UpsertOutcome,
  },
  record::{Status, StoreRef},
};

use crate::{
  Error, Result,
  encode::{
    RawChallenge, RawEvent, RawIdempotency, RawMirrorRecord, encode_dt, encode_uuid,
  },
  schema::MIRROR_SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// Mirror database: query rows, idempotency keys, the event outbox and
/// consent challenges, in one SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteMirror {
  conn: tokio_rusqlite::Connection,
}

impl SqliteMirror {
  /// Open (or create) a mirror at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory mirror, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(MIRROR_SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn select_records(&self, sql: String, params: Vec<Value>) -> Result<Vec<MirrorRecord>> {
    let raws: Vec<RawMirrorRecord> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params.iter()), RawMirrorRecord::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawMirrorRecord::into_record).collect()
  }
}

// ─── Statement helpers ───────────────────────────────────────────────────────

fn insert_record(conn: &rusqlite::Connection, row: &MirrorRecord) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO mirror_records (
       record_id, store_ref, tx_id, output_index, patient_commitment,
       issuer, drug_id, dosage, quantity, issued_at, expiry_at,
       refills_remaining, metadata_ref, status, optimistic,
       last_event_at, idempotency_key
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
    rusqlite::params![
      encode_uuid(row.record_id),
      row.store_ref.as_str(),
      row.reference.map(|r| encode_uuid(r.tx_id)),
      row.reference.map(|r| r.index),
      row.patient_commitment.as_str(),
      row.issuer.as_str(),
      row.drug_id,
      row.dosage,
      row.quantity,
      row.issued_at,
      row.expiry_at,
      row.refills_remaining,
      row.metadata_ref,
      row.status.as_ref(),
      row.optimistic,
      encode_dt(row.last_event_at),
      row.idempotency_key,
    ],
  )?;
  Ok(())
}

/// Claim an idempotency key. Returns the existing entry when the key is
/// already taken.
fn claim_key(
  conn: &rusqlite::Connection,
  entry: &IdempotencyEntry,
  response: &str,
) -> rusqlite::Result<Option<RawIdempotency>> {
  let inserted = conn.execute(
    "INSERT OR IGNORE INTO idempotency_keys
       (key, operation, fingerprint, record_id, response, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    rusqlite::params![
      entry.key,
      entry.operation,
      entry.fingerprint,
      encode_uuid(entry.record_id),
      response,
      encode_dt(entry.created_at),
    ],
  )?;
  if inserted == 1 {
    return Ok(None);
  }
  conn
    .query_row(
      &format!("SELECT {} FROM idempotency_keys WHERE key = ?1", RawIdempotency::COLUMNS),
      rusqlite::params![entry.key],
      RawIdempotency::from_row,
    )
    .map(Some)
}

fn insert_event(
  conn: &rusqlite::Connection,
  event: &Event,
  payload: &str,
) -> rusqlite::Result<bool> {
  let inserted = conn.execute(
    "INSERT OR IGNORE INTO events (event_id, record_id, kind, dedup_key, payload, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    rusqlite::params![
      encode_uuid(event.event_id),
      encode_uuid(event.record_id),
      event.kind.as_ref(),
      event.dedup_key,
      payload,
      encode_dt(event.created_at),
    ],
  )?;
  Ok(inserted == 1)
}

fn into_claim(existing: Option<RawIdempotency>) -> Result<Claim> {
  Ok(match existing {
    None => Claim::Claimed,
    Some(raw) => Claim::Existing(raw.into_entry()?),
  })
}

enum Staged {
  Done(Option<RawIdempotency>),
  Missing,
}

// ─── MirrorStore impl ────────────────────────────────────────────────────────

impl MirrorStore for SqliteMirror {
  type Error = Error;

  // ── Staged writes ─────────────────────────────────────────────────────────

  async fn reserve(&self, row: MirrorRecord, entry: IdempotencyEntry) -> Result<Claim> {
    let response = serde_json::to_string(&entry.response)?;

    let existing = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if let Some(existing) = claim_key(&tx, &entry, &response)? {
          return Ok(Some(existing));
        }
        insert_record(&tx, &row)?;
        tx.commit()?;
        Ok(None)
      })
      .await?;

    into_claim(existing)
  }

  async fn stage_transition(
    &self,
    record_id: Uuid,
    status: Status,
    at: DateTime<Utc>,
    entry: IdempotencyEntry,
  ) -> Result<Claim> {
    let response = serde_json::to_string(&entry.response)?;

    let staged = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if let Some(existing) = claim_key(&tx, &entry, &response)? {
          return Ok(Staged::Done(Some(existing)));
        }
        let updated = tx.execute(
          "UPDATE mirror_records SET status = ?1, optimistic = 1, last_event_at = ?2
           WHERE record_id = ?3",
          rusqlite::params![status.as_ref(), encode_dt(at), encode_uuid(record_id)],
        )?;
        if updated == 0 {
          return Ok(Staged::Missing);
        }
        tx.commit()?;
        Ok(Staged::Done(None))
      })
      .await?;

    match staged {
      Staged::Done(existing) => into_claim(existing),
      Staged::Missing => Err(Error::RecordNotFound(record_id)),
    }
  }

  async fn find_idempotent<'a>(&'a self, key: &'a str) -> Result<Option<IdempotencyEntry>> {
    let key = key.to_owned();
    let raw: Option<RawIdempotency> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {} FROM idempotency_keys WHERE key = ?1", RawIdempotency::COLUMNS),
            rusqlite::params![key],
            RawIdempotency::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawIdempotency::into_entry).transpose()
  }

  // ── Reconciler writes ─────────────────────────────────────────────────────

  async fn apply_observation(&self, observation: Observation) -> Result<UpsertOutcome> {
    let row = observation.to_record();

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let id = encode_uuid(row.record_id);
        let existing: Option<(Option<String>, Option<u32>, String, bool)> = tx
          .query_row(
            "SELECT tx_id, output_index, status, optimistic FROM mirror_records
             WHERE record_id = ?1",
            rusqlite::params![id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
          )
          .optional()?;

        let reference = row.reference.map(|r| (encode_uuid(r.tx_id), r.index));
        let outcome = match existing {
          None => {
            insert_record(&tx, &row)?;
            UpsertOutcome::Inserted
          }
          Some((tx_id, index, status, optimistic))
            if !optimistic
              && status == row.status.as_ref()
              && tx_id.as_deref() == reference.as_ref().map(|(t, _)| t.as_str())
              && index == reference.as_ref().map(|(_, i)| *i) =>
          {
            UpsertOutcome::Unchanged
          }
          Some(_) => {
            tx.execute(
              "UPDATE mirror_records SET
                 store_ref = ?1, tx_id = ?2, output_index = ?3,
                 refills_remaining = ?4, status = ?5, optimistic = 0,
                 last_event_at = ?6
               WHERE record_id = ?7",
              rusqlite::params![
                row.store_ref.as_str(),
                reference.as_ref().map(|(tx_id, _)| tx_id),
                reference.as_ref().map(|(_, index)| index),
                row.refills_remaining,
                row.status.as_ref(),
                encode_dt(row.last_event_at),
                id,
              ],
            )?;
            UpsertOutcome::Updated
          }
        };
        tx.commit()?;
        Ok(outcome)
      })
      .await?;

    Ok(outcome)
  }

  async fn mark_redeemed(&self, record_id: Uuid, at: DateTime<Utc>, event: Event) -> Result<bool> {
    let payload = serde_json::to_string(&event.payload)?;

    let emitted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "UPDATE mirror_records SET status = ?1, optimistic = 0, last_event_at = ?2
           WHERE record_id = ?3",
          rusqlite::params![
            Status::Redeemed.as_ref(),
            encode_dt(at),
            encode_uuid(record_id)
          ],
        )?;
        let emitted = insert_event(&tx, &event, &payload)?;
        tx.commit()?;
        Ok(emitted)
      })
      .await?;

    Ok(emitted)
  }

  async fn unsettled<'a>(&'a self, store_ref: &'a StoreRef) -> Result<Vec<MirrorRecord>> {
    let sql = format!(
      "SELECT {} FROM mirror_records
       WHERE store_ref = ?1 AND tx_id IS NOT NULL
         AND (status != 'redeemed' OR optimistic = 1)
       ORDER BY rowid",
      RawMirrorRecord::COLUMNS
    );
    self
      .select_records(sql, vec![Value::Text(store_ref.as_str().to_owned())])
      .await
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  async fn get(&self, record_id: Uuid) -> Result<Option<MirrorRecord>> {
    let sql = format!("SELECT {} FROM mirror_records WHERE record_id = ?1", RawMirrorRecord::COLUMNS);
    let mut rows = self
      .select_records(sql, vec![Value::Text(encode_uuid(record_id))])
      .await?;
    Ok(rows.pop())
  }

  async fn query<'a>(&'a self, query: &'a MirrorQuery) -> Result<Vec<MirrorRecord>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if let Some(issuer) = &query.issuer {
      params.push(Value::Text(issuer.as_str().to_owned()));
      clauses.push(format!("issuer = ?{}", params.len()));
    }
    if let Some(patient) = &query.patient {
      params.push(Value::Text(patient.as_str().to_owned()));
      clauses.push(format!("patient_commitment = ?{}", params.len()));
    }
    if let Some(status) = query.status {
      params.push(Value::Text(status.as_ref().to_owned()));
      clauses.push(format!("status = ?{}", params.len()));
    }

    let where_sql = if clauses.is_empty() {
      String::new()
    } else {
      format!("WHERE {}", clauses.join(" AND "))
    };

    // SQLite treats a negative LIMIT as unbounded.
    let limit = query.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
    let offset = query.offset.map_or(0, |o| i64::try_from(o).unwrap_or(i64::MAX));
    params.push(Value::Integer(limit));
    let limit_idx = params.len();
    params.push(Value::Integer(offset));
    let offset_idx = params.len();

    let sql = format!(
      "SELECT {} FROM mirror_records {where_sql}
       ORDER BY issued_at DESC, record_id
       LIMIT ?{limit_idx} OFFSET ?{offset_idx}",
      RawMirrorRecord::COLUMNS
    );
    self.select_records(sql, params).await
  }

  // ── Event outbox ──────────────────────────────────────────────────────────

  async fn emit_once(&self, event: Event) -> Result<bool> {
    let payload = serde_json::to_string(&event.payload)?;
    let emitted = self
      .conn
      .call(move |conn| Ok(insert_event(conn, &event, &payload)?))
      .await?;
    Ok(emitted)
  }

  async fn pending_events(&self, limit: usize) -> Result<Vec<PendingEvent>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let raws: Vec<RawEvent> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM events WHERE state = ?1 ORDER BY rowid LIMIT ?2",
          RawEvent::COLUMNS
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![DeliveryState::Pending.to_string(), limit],
            RawEvent::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawEvent::into_pending).collect()
  }

  async fn mark_delivered(&self, event_id: Uuid, at: DateTime<Utc>) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE events SET state = ?1, delivered_at = ?2, attempts = attempts + 1
           WHERE event_id = ?3",
          rusqlite::params![
            DeliveryState::Delivered.to_string(),
            encode_dt(at),
            encode_uuid(event_id)
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn mark_failed(&self, event_id: Uuid, error: String, give_up: bool) -> Result<()> {
    let state = if give_up { DeliveryState::Failed } else { DeliveryState::Pending };
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE events SET state = ?1, last_error = ?2, attempts = attempts + 1
           WHERE event_id = ?3",
          rusqlite::params![state.to_string(), error, encode_uuid(event_id)],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── ConsentStore impl ───────────────────────────────────────────────────────

impl ConsentStore for SqliteMirror {
  type Error = Error;

  async fn put_challenge(&self, challenge: ConsentChallenge) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO consent_challenges
             (prescription_id, code_hash, expires_at, attempts)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![
            encode_uuid(challenge.prescription_id),
            challenge.code_hash,
            challenge.expires_at,
            challenge.attempts,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_challenge(&self, prescription_id: Uuid) -> Result<Option<ConsentChallenge>> {
    let id = encode_uuid(prescription_id);
    let raw: Option<RawChallenge> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT prescription_id, code_hash, expires_at, attempts
             FROM consent_challenges WHERE prescription_id = ?1",
            rusqlite::params![id],
            |row| {
              Ok(RawChallenge {
                prescription_id: row.get(0)?,
                code_hash:       row.get(1)?,
                expires_at:      row.get(2)?,
                attempts:        row.get(3)?,
              })
            },
          )
          .optional()?)
      })
      .await?;

    raw.map(RawChallenge::into_challenge).transpose()
  }

  async fn record_failed_attempt(&self, prescription_id: Uuid) -> Result<Option<u32>> {
    let id = encode_uuid(prescription_id);
    let attempts = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "UPDATE consent_challenges SET attempts = attempts + 1
             WHERE prescription_id = ?1 RETURNING attempts",
            rusqlite::params![id],
            |r| r.get(0),
          )
          .optional()?)
      })
      .await?;
    Ok(attempts)
  }

  async fn remove_challenge(&self, prescription_id: Uuid) -> Result<()> {
    let id = encode_uuid(prescription_id);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM consent_challenges WHERE prescription_id = ?1",
          rusqlite::params![id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
