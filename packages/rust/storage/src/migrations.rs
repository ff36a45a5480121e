//! SQL migration definitions for the Docflow per-job database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: chunk_records, baselines, retrieval_cache, rebuild_marks, proposals",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Derived chunk records (identity = content hash within a source)
CREATE TABLE IF NOT EXISTS chunk_records (
    id           TEXT PRIMARY KEY,
    job_id       TEXT NOT NULL,
    source_id    TEXT NOT NULL,
    seq          INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    UNIQUE(job_id, source_id, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_chunks_job_source ON chunk_records(job_id, source_id);

-- Expected-count baselines; superseded rows are kept, never mutated
CREATE TABLE IF NOT EXISTS baselines (
    id             TEXT PRIMARY KEY,
    job_id         TEXT NOT NULL,
    source_id      TEXT NOT NULL,
    expected_count INTEGER NOT NULL,
    established_by TEXT NOT NULL,
    superseded     INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_baselines_job_source ON baselines(job_id, source_id, superseded);

-- Retrieval cache: purely derived, no cross-references, purgeable without approval
CREATE TABLE IF NOT EXISTS retrieval_cache (
    chunk_hash TEXT PRIMARY KEY,
    job_id     TEXT NOT NULL,
    source_id  TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_job_source ON retrieval_cache(job_id, source_id);

-- Downstream artifacts flagged for rebuild by reconciliation
CREATE TABLE IF NOT EXISTS rebuild_marks (
    id        TEXT PRIMARY KEY,
    job_id    TEXT NOT NULL,
    artifact  TEXT NOT NULL,
    source_id TEXT NOT NULL,
    marked_at TEXT NOT NULL,
    UNIQUE(job_id, artifact, source_id)
);

-- Deletion approval queue
CREATE TABLE IF NOT EXISTS proposals (
    id          TEXT PRIMARY KEY,
    job_id      TEXT NOT NULL,
    target      TEXT NOT NULL,
    reason      TEXT NOT NULL,
    evidence    TEXT NOT NULL,
    state       TEXT NOT NULL,
    proposed_by TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    decided_by  TEXT,
    decided_at  TEXT,
    executed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_proposals_job_state ON proposals(job_id, state);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
