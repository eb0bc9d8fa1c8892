//! SQL schemas for the ledger and mirror databases.
//!
//! Each is executed once at connection startup. Future migrations will be
//! gated on `PRAGMA user_version`.

/// Authoritative store DDL.
pub const LEDGER_SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- One row per produced record version. A version is live while spent_by is
-- NULL; spent_by is written exactly once, by compare-and-swap.
CREATE TABLE IF NOT EXISTS ledger_outputs (
    tx_id         TEXT    NOT NULL,
    output_index  INTEGER NOT NULL,
    record_id     TEXT    NOT NULL,
    store_ref     TEXT    NOT NULL,
    reserve       INTEGER NOT NULL,
    datum         TEXT    NOT NULL,   -- codec-encoded PrescriptionDatum
    created_at    TEXT    NOT NULL,
    spent_by      TEXT,
    spent_at      TEXT,
    PRIMARY KEY (tx_id, output_index)
);

-- At most one live version per prescription.
CREATE UNIQUE INDEX IF NOT EXISTS ledger_outputs_live_record_idx
    ON ledger_outputs(record_id) WHERE spent_by IS NULL;
CREATE INDEX IF NOT EXISTS ledger_outputs_store_idx
    ON ledger_outputs(store_ref) WHERE spent_by IS NULL;

-- Recorded outcome of every decided request, so a resubmission is answered
-- with the original decision.
CREATE TABLE IF NOT EXISTS ledger_requests (
    request_id   TEXT PRIMARY KEY,
    outcome      TEXT NOT NULL,       -- JSON SubmitOutcome
    recorded_at  TEXT NOT NULL
);

PRAGMA user_version = 1;
";

/// Mirror, idempotency, outbox and consent DDL.
pub const MIRROR_SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS mirror_records (
    record_id           TEXT PRIMARY KEY,
    store_ref           TEXT    NOT NULL,
    tx_id               TEXT,            -- NULL while provisional
    output_index        INTEGER,
    patient_commitment  TEXT    NOT NULL,
    issuer              TEXT    NOT NULL,
    drug_id             TEXT    NOT NULL,
    dosage              TEXT    NOT NULL,
    quantity            INTEGER NOT NULL,
    issued_at           INTEGER NOT NULL,
    expiry_at           INTEGER NOT NULL,
    refills_remaining   INTEGER NOT NULL,
    metadata_ref        TEXT,
    status              TEXT    NOT NULL, -- 'issued' | 'partially_redeemed' | 'redeemed' | 'expired'
    optimistic          INTEGER NOT NULL DEFAULT 0,
    last_event_at       TEXT    NOT NULL,
    idempotency_key     TEXT
);

CREATE INDEX IF NOT EXISTS mirror_issuer_idx  ON mirror_records(issuer);
CREATE INDEX IF NOT EXISTS mirror_patient_idx ON mirror_records(patient_commitment);
CREATE INDEX IF NOT EXISTS mirror_status_idx  ON mirror_records(status);
CREATE INDEX IF NOT EXISTS mirror_store_idx   ON mirror_records(store_ref);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key          TEXT PRIMARY KEY,
    operation    TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    record_id    TEXT NOT NULL,
    response     TEXT NOT NULL,       -- JSON
    created_at   TEXT NOT NULL
);

-- Outbox. dedup_key makes each logical event insertable once.
CREATE TABLE IF NOT EXISTS events (
    event_id      TEXT PRIMARY KEY,
    record_id     TEXT    NOT NULL,
    kind          TEXT    NOT NULL,
    dedup_key     TEXT    NOT NULL UNIQUE,
    payload       TEXT    NOT NULL,   -- JSON
    created_at    TEXT    NOT NULL,
    state         TEXT    NOT NULL DEFAULT 'pending',
    attempts      INTEGER NOT NULL DEFAULT 0,
    last_error    TEXT,
    delivered_at  TEXT
);

CREATE INDEX IF NOT EXISTS events_pending_idx ON events(state, created_at);

CREATE TABLE IF NOT EXISTS consent_challenges (
    prescription_id  TEXT PRIMARY KEY,
    code_hash        TEXT    NOT NULL,
    expires_at       INTEGER NOT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0
);

PRAGMA user_version = 1;
";
