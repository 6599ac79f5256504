//! SQL schema for the bidline SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per (source, tender_id). Only the pointer columns are ever updated.
CREATE TABLE IF NOT EXISTS tenders (
    id                             INTEGER PRIMARY KEY,
    source                         TEXT NOT NULL,
    tender_id                      TEXT NOT NULL,
    title                          TEXT NOT NULL,
    agency                         TEXT,
    status                         TEXT NOT NULL,   -- 'active' | 'closed'
    current_revision_id            INTEGER REFERENCES tender_revisions(id),
    latest_raw_content_hash        TEXT,
    latest_normalized_content_hash TEXT,
    first_seen_at                  TEXT NOT NULL,
    last_seen_at                   TEXT NOT NULL,
    UNIQUE (source, tender_id)
);

-- Strictly append-only. No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS tender_revisions (
    id                      INTEGER PRIMARY KEY,
    tender_pk               INTEGER NOT NULL REFERENCES tenders(id),
    revision_number         INTEGER NOT NULL,
    revision_hash           TEXT NOT NULL,
    raw_content_hash        TEXT NOT NULL,
    normalized_content_hash TEXT,               -- NULL when FAILED
    source_payload          TEXT NOT NULL,
    normalized_payload      TEXT,               -- JSON NormalizedTender; NULL when FAILED
    changed_fields          TEXT NOT NULL DEFAULT '[]',
    revision_status         TEXT NOT NULL,      -- 'SUCCESS' | 'FAILED'
    error_message           TEXT,
    observed_at             TEXT NOT NULL,
    created_at              TEXT NOT NULL,
    UNIQUE (tender_pk, revision_number),
    UNIQUE (tender_pk, revision_hash)
);

CREATE TABLE IF NOT EXISTS raw_payloads (
    id                 INTEGER PRIMARY KEY,
    tender_revision_pk INTEGER NOT NULL REFERENCES tender_revisions(id),
    content_hash       TEXT NOT NULL,
    payload            TEXT NOT NULL,
    captured_at        TEXT NOT NULL,
    UNIQUE (tender_revision_pk, content_hash)
);

CREATE TABLE IF NOT EXISTS index_documents (
    id                 INTEGER PRIMARY KEY,
    tender_revision_pk INTEGER NOT NULL REFERENCES tender_revisions(id),
    tender_pk          INTEGER NOT NULL REFERENCES tenders(id),
    title              TEXT NOT NULL,
    agency             TEXT,
    region             TEXT,
    category           TEXT,
    deadline           TEXT,                    -- YYYY-MM-DD
    budget             INTEGER,
    body               TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    UNIQUE (tender_revision_pk)
);

CREATE TABLE IF NOT EXISTS index_chunks (
    id                 INTEGER PRIMARY KEY,
    tender_revision_pk INTEGER NOT NULL REFERENCES tender_revisions(id),
    chunk_index        INTEGER NOT NULL,
    chunk_hash         TEXT NOT NULL,
    model_version      TEXT NOT NULL,
    text               TEXT NOT NULL,
    embedding          BLOB NOT NULL,           -- little-endian f32
    created_at         TEXT NOT NULL,
    UNIQUE (tender_revision_pk, chunk_hash),
    UNIQUE (tender_revision_pk, chunk_index, model_version)
);

-- Owned by the surrounding application; read-only to the pipeline.
CREATE TABLE IF NOT EXISTS subscriptions (
    id             INTEGER PRIMARY KEY,
    user_ref       TEXT NOT NULL,
    name           TEXT NOT NULL,
    channels       TEXT NOT NULL DEFAULT '[]',
    criteria       TEXT NOT NULL DEFAULT '{}',
    profile_fields TEXT NOT NULL DEFAULT '{}',
    active         INTEGER NOT NULL DEFAULT 1,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS match_results (
    id                 INTEGER PRIMARY KEY,
    subscription_pk    INTEGER NOT NULL REFERENCES subscriptions(id),
    tender_revision_pk INTEGER NOT NULL REFERENCES tender_revisions(id),
    fit_score          REAL NOT NULL,
    is_match           INTEGER NOT NULL,
    signal_count       INTEGER NOT NULL,
    explanation        TEXT NOT NULL,
    evaluated_at       TEXT NOT NULL,
    UNIQUE (subscription_pk, tender_revision_pk)
);

-- The notification outbox. One row per send; retries mutate it in place.
CREATE TABLE IF NOT EXISTS delivery_logs (
    id                    INTEGER PRIMARY KEY,
    subscription_pk       INTEGER NOT NULL REFERENCES subscriptions(id),
    tender_revision_pk    INTEGER NOT NULL REFERENCES tender_revisions(id),
    channel               TEXT NOT NULL,
    event_key             TEXT NOT NULL,
    delivery_status       TEXT NOT NULL,  -- 'queued' | 'processing' | 'delivered' | 'failed'
    attempt_count         INTEGER NOT NULL DEFAULT 0,
    max_attempts          INTEGER NOT NULL,
    next_retry_at         TEXT NOT NULL,
    last_error            TEXT,
    processing_started_at TEXT,
    delivered_at          TEXT,
    created_at            TEXT NOT NULL,
    UNIQUE (subscription_pk, channel, event_key)
);

CREATE TABLE IF NOT EXISTS ingestion_jobs (
    id               INTEGER PRIMARY KEY,
    job_name         TEXT NOT NULL,
    idempotency_key  TEXT NOT NULL,
    payload          TEXT NOT NULL,
    status           TEXT NOT NULL,     -- 'pending' | 'leased' | 'completed'
    attempts         INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL,
    available_at     TEXT NOT NULL,
    leased_by        TEXT,
    lease_expires_at TEXT,
    last_error       TEXT,
    created_at       TEXT NOT NULL,
    UNIQUE (job_name, idempotency_key)
);

-- Dead letters: jobs that exhausted their budget or failed permanently.
CREATE TABLE IF NOT EXISTS failed_jobs (
    id              INTEGER PRIMARY KEY,
    job_name        TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    payload         TEXT NOT NULL,
    attempts        INTEGER NOT NULL,
    error_message   TEXT NOT NULL,
    failed_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS revisions_tender_idx   ON tender_revisions(tender_pk, revision_number);
CREATE INDEX IF NOT EXISTS deliveries_due_idx     ON delivery_logs(delivery_status, next_retry_at);
CREATE INDEX IF NOT EXISTS jobs_available_idx     ON ingestion_jobs(status, available_at);
CREATE INDEX IF NOT EXISTS matches_revision_idx   ON match_results(tender_revision_pk);

PRAGMA user_version = 1;
";
