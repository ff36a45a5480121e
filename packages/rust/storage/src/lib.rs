//! libSQL storage layer for one job's derived state.
//!
//! The [`Storage`] struct wraps a per-job libSQL database holding derived
//! chunk records, expected-count baselines, the retrieval cache, rebuild
//! marks, and the deletion approval queue.
//!
//! **Record kinds and deletion policy** (explicit, per the reconciliation
//! contract):
//! - `chunk_records` carry provenance and are cross-referenced by downstream
//!   artifacts — stale rows are removed only through an APPROVED deletion
//!   proposal.
//! - `retrieval_cache` rows are purely derived caches with no
//!   cross-references — stale rows may be purged directly.

mod audit;
mod migrations;
mod queue;

pub use audit::{AuditEntry, AuditLog};
pub use queue::{ApprovalQueue, Decision, ExecutionOutcome};

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use docflow_shared::{DocflowError, Result};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A derived retrieval chunk, identified within its source by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Unique record identifier (UUID v7).
    pub id: String,
    /// Owning job.
    pub job_id: String,
    /// Source document this chunk was derived from.
    pub source_id: String,
    /// Position within the source's chunk sequence.
    pub seq: u64,
    /// `sha256:<hex>` over source id + chunk text.
    pub content_hash: String,
    /// When the record was first stored.
    pub created_at: DateTime<Utc>,
}

/// An expected-count baseline for one source within one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub id: String,
    pub job_id: String,
    pub source_id: String,
    /// Authoritative expected chunk count.
    pub expected_count: u64,
    /// Which component established it (`outline` or `reconciliation`).
    pub established_by: String,
    /// Superseded baselines are retained for provenance, never mutated.
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a deletion proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Pending,
    Approved,
    Rejected,
    Executed,
}

impl ProposalState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalState::Pending => "pending",
            ProposalState::Approved => "approved",
            ProposalState::Rejected => "rejected",
            ProposalState::Executed => "executed",
        }
    }
}

impl std::fmt::Display for ProposalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProposalState {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ProposalState::Pending),
            "approved" => Ok(ProposalState::Approved),
            "rejected" => Ok(ProposalState::Rejected),
            "executed" => Ok(ProposalState::Executed),
            other => Err(DocflowError::validation(format!(
                "unknown proposal state '{other}'"
            ))),
        }
    }
}

/// A request to remove stale or orphaned derived data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionProposal {
    pub id: String,
    pub job_id: String,
    /// Target identifier, e.g. `chunk:<record id>`.
    pub target: String,
    pub reason: String,
    /// Supporting evidence (diff summary, counts).
    pub evidence: String,
    pub state: ProposalState,
    pub proposed_by: String,
    pub created_at: DateTime<Utc>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a per-job libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (status queries).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    DocflowError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DocflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunk record operations
    // -----------------------------------------------------------------------

    /// Insert a chunk record, ignoring duplicates of `(job, source, hash)`.
    pub async fn upsert_chunk(&self, chunk: &ChunkRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO chunk_records (id, job_id, source_id, seq, content_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(job_id, source_id, content_hash) DO NOTHING",
                params![
                    chunk.id.as_str(),
                    chunk.job_id.as_str(),
                    chunk.source_id.as_str(),
                    chunk.seq as i64,
                    chunk.content_hash.as_str(),
                    chunk.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a chunk record by ID.
    pub async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_id, source_id, seq, content_hash, created_at
                 FROM chunk_records WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_chunk(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DocflowError::Storage(e.to_string())),
        }
    }

    /// List all chunk records for one source, in sequence order.
    pub async fn list_chunks(&self, job_id: &str, source_id: &str) -> Result<Vec<ChunkRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_id, source_id, seq, content_hash, created_at
                 FROM chunk_records WHERE job_id = ?1 AND source_id = ?2 ORDER BY seq",
                params![job_id, source_id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_chunk(&row)?);
        }
        Ok(results)
    }

    /// Count stored chunks for one source.
    pub async fn count_chunks(&self, job_id: &str, source_id: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM chunk_records WHERE job_id = ?1 AND source_id = ?2",
                params![job_id, source_id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row
                .get::<i64>(0)
                .map_err(|e| DocflowError::Storage(e.to_string()))? as u64),
            _ => Ok(0),
        }
    }

    /// Delete a chunk record by ID. Only the approval queue executor calls this.
    pub(crate) async fn delete_chunk(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM chunk_records WHERE id = ?1", params![id])
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Baseline operations
    // -----------------------------------------------------------------------

    /// The current (non-superseded) baseline for a source, if any.
    pub async fn active_baseline(&self, job_id: &str, source_id: &str) -> Result<Option<Baseline>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_id, source_id, expected_count, established_by, superseded, created_at
                 FROM baselines
                 WHERE job_id = ?1 AND source_id = ?2 AND superseded = 0
                 ORDER BY created_at DESC LIMIT 1",
                params![job_id, source_id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_baseline(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DocflowError::Storage(e.to_string())),
        }
    }

    /// All current baselines for a job, for contract validation.
    pub async fn list_active_baselines(&self, job_id: &str) -> Result<Vec<Baseline>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_id, source_id, expected_count, established_by, superseded, created_at
                 FROM baselines WHERE job_id = ?1 AND superseded = 0 ORDER BY source_id",
                params![job_id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_baseline(&row)?);
        }
        Ok(results)
    }

    /// Establish a baseline for a source. Created once per source per job;
    /// later authoritative counts supersede rather than mutate it.
    pub async fn establish_baseline(
        &self,
        job_id: &str,
        source_id: &str,
        expected_count: u64,
        established_by: &str,
    ) -> Result<Baseline> {
        self.check_writable()?;
        let baseline = Baseline {
            id: Uuid::now_v7().to_string(),
            job_id: job_id.into(),
            source_id: source_id.into(),
            expected_count,
            established_by: established_by.into(),
            superseded: false,
            created_at: Utc::now(),
        };
        self.conn
            .execute(
                "INSERT INTO baselines (id, job_id, source_id, expected_count, established_by, superseded, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    baseline.id.as_str(),
                    job_id,
                    source_id,
                    expected_count as i64,
                    established_by,
                    baseline.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(baseline)
    }

    /// Supersede the active baseline with a newly computed authoritative
    /// count. The old row is flagged, never rewritten.
    pub async fn supersede_baseline(
        &self,
        job_id: &str,
        source_id: &str,
        expected_count: u64,
        established_by: &str,
    ) -> Result<Baseline> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE baselines SET superseded = 1
                 WHERE job_id = ?1 AND source_id = ?2 AND superseded = 0",
                params![job_id, source_id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        self.establish_baseline(job_id, source_id, expected_count, established_by)
            .await
    }

    // -----------------------------------------------------------------------
    // Retrieval cache (purgeable derived data)
    // -----------------------------------------------------------------------

    /// Upsert a retrieval-cache entry keyed by chunk hash.
    pub async fn upsert_cache_entry(
        &self,
        chunk_hash: &str,
        job_id: &str,
        source_id: &str,
        payload: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO retrieval_cache (chunk_hash, job_id, source_id, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chunk_hash) DO UPDATE SET payload = excluded.payload",
                params![
                    chunk_hash,
                    job_id,
                    source_id,
                    payload,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Fetch a cache payload by chunk hash.
    pub async fn get_cache_entry(&self, chunk_hash: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload FROM retrieval_cache WHERE chunk_hash = ?1",
                params![chunk_hash],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row.get::<String>(0)
                    .map_err(|e| DocflowError::Storage(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DocflowError::Storage(e.to_string())),
        }
    }

    /// Purge cache entries for the given chunk hashes. Returns the number
    /// removed. Direct purge is allowed: the cache is purely derived.
    pub async fn purge_cache_entries(&self, hashes: &[String]) -> Result<u64> {
        self.check_writable()?;
        let mut purged = 0;
        for hash in hashes {
            purged += self
                .conn
                .execute(
                    "DELETE FROM retrieval_cache WHERE chunk_hash = ?1",
                    params![hash.as_str()],
                )
                .await
                .map_err(|e| DocflowError::Storage(e.to_string()))?;
        }
        Ok(purged)
    }

    // -----------------------------------------------------------------------
    // Rebuild marks
    // -----------------------------------------------------------------------

    /// Flag a downstream artifact for rebuild. Idempotent per
    /// `(job, artifact, source)`.
    pub async fn mark_for_rebuild(
        &self,
        job_id: &str,
        artifact: &str,
        source_id: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO rebuild_marks (id, job_id, artifact, source_id, marked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(job_id, artifact, source_id) DO NOTHING",
                params![
                    Uuid::now_v7().to_string(),
                    job_id,
                    artifact,
                    source_id,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// List `(artifact, source_id)` pairs currently marked for rebuild.
    pub async fn list_rebuild_marks(&self, job_id: &str) -> Result<Vec<(String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT artifact, source_id FROM rebuild_marks WHERE job_id = ?1
                 ORDER BY artifact, source_id",
                params![job_id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push((
                row.get::<String>(0)
                    .map_err(|e| DocflowError::Storage(e.to_string()))?,
                row.get::<String>(1)
                    .map_err(|e| DocflowError::Storage(e.to_string()))?,
            ));
        }
        Ok(results)
    }

    /// Clear rebuild marks for an artifact once its producing pass reruns.
    pub async fn clear_rebuild_marks(&self, job_id: &str, artifact: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM rebuild_marks WHERE job_id = ?1 AND artifact = ?2",
                params![job_id, artifact],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Proposal rows (state transitions live in `ApprovalQueue`)
    // -----------------------------------------------------------------------

    pub(crate) async fn insert_proposal(&self, proposal: &DeletionProposal) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO proposals (id, job_id, target, reason, evidence, state, proposed_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    proposal.id.as_str(),
                    proposal.job_id.as_str(),
                    proposal.target.as_str(),
                    proposal.reason.as_str(),
                    proposal.evidence.as_str(),
                    proposal.state.as_str(),
                    proposal.proposed_by.as_str(),
                    proposal.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a proposal by ID.
    pub async fn get_proposal(&self, id: &str) -> Result<Option<DeletionProposal>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_id, target, reason, evidence, state, proposed_by, created_at,
                        decided_by, decided_at, executed_at
                 FROM proposals WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_proposal(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DocflowError::Storage(e.to_string())),
        }
    }

    /// List proposals for a job, optionally filtered by state.
    pub async fn list_proposals(
        &self,
        job_id: &str,
        state: Option<ProposalState>,
    ) -> Result<Vec<DeletionProposal>> {
        let mut rows = match state {
            Some(state) => self
                .conn
                .query(
                    "SELECT id, job_id, target, reason, evidence, state, proposed_by, created_at,
                            decided_by, decided_at, executed_at
                     FROM proposals WHERE job_id = ?1 AND state = ?2 ORDER BY created_at",
                    params![job_id, state.as_str()],
                )
                .await
                .map_err(|e| DocflowError::Storage(e.to_string()))?,
            None => self
                .conn
                .query(
                    "SELECT id, job_id, target, reason, evidence, state, proposed_by, created_at,
                            decided_by, decided_at, executed_at
                     FROM proposals WHERE job_id = ?1 ORDER BY created_at",
                    params![job_id],
                )
                .await
                .map_err(|e| DocflowError::Storage(e.to_string()))?,
        };

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_proposal(&row)?);
        }
        Ok(results)
    }

    /// Targets of proposals that are still open (pending or approved).
    pub async fn open_proposal_targets(&self, job_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT target FROM proposals
                 WHERE job_id = ?1 AND state IN ('pending', 'approved')",
                params![job_id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(
                row.get::<String>(0)
                    .map_err(|e| DocflowError::Storage(e.to_string()))?,
            );
        }
        Ok(results)
    }

    /// Guarded PENDING → APPROVED/REJECTED transition. Returns the number of
    /// rows updated; 0 means the proposal was not pending.
    pub(crate) async fn transition_decided(
        &self,
        id: &str,
        new_state: ProposalState,
        decided_by: &str,
    ) -> Result<u64> {
        self.check_writable()?;
        let updated = self
            .conn
            .execute(
                "UPDATE proposals SET state = ?1, decided_by = ?2, decided_at = ?3
                 WHERE id = ?4 AND state = 'pending'",
                params![
                    new_state.as_str(),
                    decided_by,
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(updated)
    }

    /// Guarded APPROVED → EXECUTED transition. Returns rows updated.
    pub(crate) async fn transition_executed(&self, id: &str) -> Result<u64> {
        self.check_writable()?;
        let updated = self
            .conn
            .execute(
                "UPDATE proposals SET state = 'executed', executed_at = ?1
                 WHERE id = ?2 AND state = 'approved'",
                params![Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(updated)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn get_str(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx)
        .map_err(|e| DocflowError::Storage(e.to_string()))
}

fn get_opt_str(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DocflowError::Storage(format!("invalid timestamp '{value}': {e}")))
}

fn row_to_chunk(row: &Row) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: get_str(row, 0)?,
        job_id: get_str(row, 1)?,
        source_id: get_str(row, 2)?,
        seq: row
            .get::<i64>(3)
            .map_err(|e| DocflowError::Storage(e.to_string()))? as u64,
        content_hash: get_str(row, 4)?,
        created_at: parse_ts(&get_str(row, 5)?)?,
    })
}

fn row_to_baseline(row: &Row) -> Result<Baseline> {
    Ok(Baseline {
        id: get_str(row, 0)?,
        job_id: get_str(row, 1)?,
        source_id: get_str(row, 2)?,
        expected_count: row
            .get::<i64>(3)
            .map_err(|e| DocflowError::Storage(e.to_string()))? as u64,
        established_by: get_str(row, 4)?,
        superseded: row
            .get::<i64>(5)
            .map_err(|e| DocflowError::Storage(e.to_string()))?
            != 0,
        created_at: parse_ts(&get_str(row, 6)?)?,
    })
}

fn row_to_proposal(row: &Row) -> Result<DeletionProposal> {
    let decided_at = match get_opt_str(row, 9) {
        Some(ts) => Some(parse_ts(&ts)?),
        None => None,
    };
    let executed_at = match get_opt_str(row, 10) {
        Some(ts) => Some(parse_ts(&ts)?),
        None => None,
    };
    Ok(DeletionProposal {
        id: get_str(row, 0)?,
        job_id: get_str(row, 1)?,
        target: get_str(row, 2)?,
        reason: get_str(row, 3)?,
        evidence: get_str(row, 4)?,
        state: get_str(row, 5)?.parse()?,
        proposed_by: get_str(row, 6)?,
        created_at: parse_ts(&get_str(row, 7)?)?,
        decided_by: get_opt_str(row, 8),
        decided_at,
        executed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(&dir.path().join("docflow.db"))
            .await
            .expect("open storage");
        (dir, storage)
    }

    fn chunk(job: &str, source: &str, seq: u64, hash: &str) -> ChunkRecord {
        ChunkRecord {
            id: Uuid::now_v7().to_string(),
            job_id: job.into(),
            source_id: source.into(),
            seq,
            content_hash: hash.into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("docflow.db");
        {
            let _first = Storage::open(&path).await.expect("first open");
        }
        let _second = Storage::open(&path).await.expect("reopen");
    }

    #[tokio::test]
    async fn chunk_insert_list_and_duplicate_ignore() {
        let (_tmp, storage) = open_temp().await;

        storage
            .upsert_chunk(&chunk("j1", "s1", 0, "sha256:aaa"))
            .await
            .expect("insert");
        storage
            .upsert_chunk(&chunk("j1", "s1", 1, "sha256:bbb"))
            .await
            .expect("insert");
        // Same hash again — ignored.
        storage
            .upsert_chunk(&chunk("j1", "s1", 7, "sha256:aaa"))
            .await
            .expect("dup insert");

        let chunks = storage.list_chunks("j1", "s1").await.expect("list");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(storage.count_chunks("j1", "s1").await.expect("count"), 2);
        assert_eq!(storage.count_chunks("j1", "other").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn baseline_supersede_keeps_history() {
        let (_tmp, storage) = open_temp().await;

        storage
            .establish_baseline("j1", "s1", 120, "outline")
            .await
            .expect("establish");
        let active = storage
            .active_baseline("j1", "s1")
            .await
            .expect("query")
            .expect("baseline exists");
        assert_eq!(active.expected_count, 120);

        storage
            .supersede_baseline("j1", "s1", 125, "reconciliation")
            .await
            .expect("supersede");
        let active = storage
            .active_baseline("j1", "s1")
            .await
            .expect("query")
            .expect("baseline exists");
        assert_eq!(active.expected_count, 125);
        assert_eq!(active.established_by, "reconciliation");

        let all = storage.list_active_baselines("j1").await.expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn cache_purge_is_direct() {
        let (_tmp, storage) = open_temp().await;

        storage
            .upsert_cache_entry("sha256:aaa", "j1", "s1", "chunk text")
            .await
            .expect("upsert");
        assert!(
            storage
                .get_cache_entry("sha256:aaa")
                .await
                .expect("get")
                .is_some()
        );

        let purged = storage
            .purge_cache_entries(&["sha256:aaa".into(), "sha256:missing".into()])
            .await
            .expect("purge");
        assert_eq!(purged, 1);
        assert!(
            storage
                .get_cache_entry("sha256:aaa")
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn rebuild_marks_are_idempotent() {
        let (_tmp, storage) = open_temp().await;

        storage
            .mark_for_rebuild("j1", "embeddings", "s1")
            .await
            .expect("mark");
        storage
            .mark_for_rebuild("j1", "embeddings", "s1")
            .await
            .expect("mark again");
        storage
            .mark_for_rebuild("j1", "graph", "s1")
            .await
            .expect("mark");

        let marks = storage.list_rebuild_marks("j1").await.expect("list");
        assert_eq!(marks.len(), 2);

        storage
            .clear_rebuild_marks("j1", "embeddings")
            .await
            .expect("clear");
        let marks = storage.list_rebuild_marks("j1").await.expect("list");
        assert_eq!(marks, vec![("graph".to_string(), "s1".to_string())]);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("docflow.db");
        {
            let _rw = Storage::open(&path).await.expect("create");
        }
        let ro = Storage::open_readonly(&path).await.expect("open readonly");
        let err = ro
            .upsert_chunk(&chunk("j1", "s1", 0, "sha256:aaa"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }
}
