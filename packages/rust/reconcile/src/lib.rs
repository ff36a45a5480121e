//! Reconciliation engine for count drift.
//!
//! When contract validation reports drift between a baseline and the counts
//! a pass produced, the engine recomputes the authoritative chunk set from
//! canonical text and diffs it against the stored records by content hash.
//! New records are inserted immediately; stale records are never deleted
//! here — each one becomes a PENDING deletion proposal for an admin to
//! decide. Downstream artifacts that referenced the affected source get
//! rebuild marks, and the baseline is superseded with the recomputed count.
//!
//! Re-running reconciliation over an already-reconciled source is a no-op:
//! records with an open proposal are excluded from the diff, so the same
//! stale row is never proposed twice.

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use docflow_shared::Result;
use docflow_storage::{ApprovalQueue, ChunkRecord, Storage};

/// Downstream artifacts invalidated when a source's chunk set changes.
const DOWNSTREAM_ARTIFACTS: [&str; 3] = ["embeddings", "graph", "bundle"];

// ---------------------------------------------------------------------------
// Recompute seam
// ---------------------------------------------------------------------------

/// One chunk as recomputed from canonical text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthoritativeChunk {
    pub source_id: String,
    pub seq: u64,
    /// `sha256:<hex>` over source id + chunk text.
    pub content_hash: String,
    pub text: String,
}

/// Recomputes the authoritative chunk set for a source from canonical text.
///
/// The engine owns the diff and the storage writes; the chunking logic
/// itself is injected so it stays identical to the chunk pass's.
pub trait Recompute {
    fn recompute(&self, source_id: &str) -> Result<Vec<AuthoritativeChunk>>;
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// Hash-diff between stored records and the authoritative set.
#[derive(Debug, Default)]
pub struct RecordDiff {
    /// Present on both sides; left untouched.
    pub unchanged: Vec<ChunkRecord>,
    /// Authoritative but not stored; to insert.
    pub new: Vec<AuthoritativeChunk>,
    /// Stored but no longer authoritative; to propose for deletion.
    pub stale: Vec<ChunkRecord>,
}

/// Diff by content hash. Order does not matter; identity is the hash.
pub fn diff_records(stored: &[ChunkRecord], authoritative: &[AuthoritativeChunk]) -> RecordDiff {
    let stored_hashes: std::collections::BTreeSet<&str> =
        stored.iter().map(|r| r.content_hash.as_str()).collect();
    let auth_hashes: std::collections::BTreeSet<&str> = authoritative
        .iter()
        .map(|c| c.content_hash.as_str())
        .collect();

    RecordDiff {
        unchanged: stored
            .iter()
            .filter(|r| auth_hashes.contains(r.content_hash.as_str()))
            .cloned()
            .collect(),
        new: authoritative
            .iter()
            .filter(|c| !stored_hashes.contains(c.content_hash.as_str()))
            .cloned()
            .collect(),
        stale: stored
            .iter()
            .filter(|r| !auth_hashes.contains(r.content_hash.as_str()))
            .cloned()
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// What one reconciliation run did to one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub source_id: String,
    /// New records inserted (with cache entries).
    pub inserted: u64,
    /// Stale records turned into pending deletion proposals.
    pub proposed: u64,
    /// Recomputed count the baseline was superseded with.
    pub new_expected: u64,
}

/// Reconcile one source's stored records against a fresh recompute.
///
/// If the recompute itself fails, nothing is written and the drift stands.
#[instrument(skip_all, fields(job_id, source_id))]
pub async fn reconcile(
    job_id: &str,
    source_id: &str,
    recompute: &dyn Recompute,
    storage: &Storage,
    queue: &ApprovalQueue,
) -> Result<ReconcileReport> {
    let authoritative = recompute.recompute(source_id).inspect_err(|e| {
        warn!(source_id, error = %e, "recompute failed, store left untouched");
    })?;

    let stored = storage.list_chunks(job_id, source_id).await?;

    // Records already under an open proposal are spoken for: excluding them
    // keeps a second run from re-proposing the same stale rows.
    let open_targets = storage.open_proposal_targets(job_id).await?;
    let stored: Vec<ChunkRecord> = stored
        .into_iter()
        .filter(|r| !open_targets.contains(&format!("chunk:{}", r.id)))
        .collect();

    let diff = diff_records(&stored, &authoritative);

    for chunk in &diff.new {
        storage
            .upsert_chunk(&ChunkRecord {
                id: Uuid::now_v7().to_string(),
                job_id: job_id.into(),
                source_id: source_id.into(),
                seq: chunk.seq,
                content_hash: chunk.content_hash.clone(),
                created_at: Utc::now(),
            })
            .await?;
        storage
            .upsert_cache_entry(&chunk.content_hash, job_id, source_id, &chunk.text)
            .await?;
    }

    let evidence = format!(
        "recompute diff for '{source_id}': {} unchanged, {} new, {} stale",
        diff.unchanged.len(),
        diff.new.len(),
        diff.stale.len()
    );
    for record in &diff.stale {
        queue
            .propose(
                storage,
                job_id,
                &format!("chunk:{}", record.id),
                "record no longer present in recomputed chunk set",
                &evidence,
                "reconciliation",
            )
            .await?;
    }

    if !diff.new.is_empty() || !diff.stale.is_empty() {
        for artifact in DOWNSTREAM_ARTIFACTS {
            storage.mark_for_rebuild(job_id, artifact, source_id).await?;
        }
    }

    let new_expected = authoritative.len() as u64;
    storage
        .supersede_baseline(job_id, source_id, new_expected, "reconciliation")
        .await?;

    info!(
        source_id,
        inserted = diff.new.len(),
        proposed = diff.stale.len(),
        new_expected,
        "reconciliation complete"
    );

    Ok(ReconcileReport {
        source_id: source_id.into(),
        inserted: diff.new.len() as u64,
        proposed: diff.stale.len() as u64,
        new_expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_shared::{ActorRole, DocflowError};
    use docflow_storage::{AuditLog, ProposalState};

    struct FixedRecompute(Vec<AuthoritativeChunk>);

    impl Recompute for FixedRecompute {
        fn recompute(&self, _source_id: &str) -> Result<Vec<AuthoritativeChunk>> {
            Ok(self.0.clone())
        }
    }

    struct FailingRecompute;

    impl Recompute for FailingRecompute {
        fn recompute(&self, source_id: &str) -> Result<Vec<AuthoritativeChunk>> {
            Err(DocflowError::Reconciliation(format!(
                "cannot recompute '{source_id}'"
            )))
        }
    }

    fn auth(seq: u64, hash: &str) -> AuthoritativeChunk {
        AuthoritativeChunk {
            source_id: "s1".into(),
            seq,
            content_hash: format!("sha256:{hash}"),
            text: format!("text of {hash}"),
        }
    }

    async fn setup() -> (tempfile::TempDir, Storage, ApprovalQueue) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(&dir.path().join("docflow.db"))
            .await
            .expect("open storage");
        let queue = ApprovalQueue::new(AuditLog::for_job_dir(dir.path()), ActorRole::Admin);
        (dir, storage, queue)
    }

    async fn seed(storage: &Storage, hashes: &[&str]) {
        for (seq, hash) in hashes.iter().enumerate() {
            storage
                .upsert_chunk(&ChunkRecord {
                    id: Uuid::now_v7().to_string(),
                    job_id: "j1".into(),
                    source_id: "s1".into(),
                    seq: seq as u64,
                    content_hash: format!("sha256:{hash}"),
                    created_at: Utc::now(),
                })
                .await
                .expect("seed chunk");
        }
    }

    #[test]
    fn diff_partitions_by_hash() {
        let stored = vec![
            ChunkRecord {
                id: "r1".into(),
                job_id: "j1".into(),
                source_id: "s1".into(),
                seq: 0,
                content_hash: "sha256:one".into(),
                created_at: Utc::now(),
            },
            ChunkRecord {
                id: "r2".into(),
                job_id: "j1".into(),
                source_id: "s1".into(),
                seq: 1,
                content_hash: "sha256:two".into(),
                created_at: Utc::now(),
            },
        ];
        let authoritative = vec![auth(0, "two"), auth(1, "three")];

        let diff = diff_records(&stored, &authoritative);
        assert_eq!(diff.unchanged.len(), 1);
        assert_eq!(diff.unchanged[0].content_hash, "sha256:two");
        assert_eq!(diff.new.len(), 1);
        assert_eq!(diff.new[0].content_hash, "sha256:three");
        assert_eq!(diff.stale.len(), 1);
        assert_eq!(diff.stale[0].content_hash, "sha256:one");
    }

    #[tokio::test]
    async fn inserts_new_and_proposes_stale() {
        let (_dir, storage, queue) = setup().await;
        seed(&storage, &["one", "two", "three"]).await;
        storage
            .establish_baseline("j1", "s1", 3, "outline")
            .await
            .expect("baseline");

        let recompute = FixedRecompute(vec![auth(0, "two"), auth(1, "three"), auth(2, "four")]);
        let report = reconcile("j1", "s1", &recompute, &storage, &queue)
            .await
            .expect("reconcile");

        assert_eq!(report.inserted, 1);
        assert_eq!(report.proposed, 1);
        assert_eq!(report.new_expected, 3);

        // New record stored with a cache entry; stale record still present,
        // awaiting approval.
        let chunks = storage.list_chunks("j1", "s1").await.expect("list");
        assert_eq!(chunks.len(), 4);
        assert!(
            storage
                .get_cache_entry("sha256:four")
                .await
                .expect("get")
                .is_some()
        );

        let pending = storage
            .list_proposals("j1", Some(ProposalState::Pending))
            .await
            .expect("list proposals");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].proposed_by, "reconciliation");

        // Downstream artifacts flagged.
        let marks = storage.list_rebuild_marks("j1").await.expect("marks");
        let artifacts: Vec<&str> = marks.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(artifacts, vec!["bundle", "embeddings", "graph"]);

        // Baseline superseded with the recomputed count.
        let baseline = storage
            .active_baseline("j1", "s1")
            .await
            .expect("query")
            .expect("baseline");
        assert_eq!(baseline.expected_count, 3);
        assert_eq!(baseline.established_by, "reconciliation");
    }

    #[tokio::test]
    async fn rerun_is_idempotent_while_proposals_are_open() {
        let (_dir, storage, queue) = setup().await;
        seed(&storage, &["one", "two"]).await;
        storage
            .establish_baseline("j1", "s1", 2, "outline")
            .await
            .expect("baseline");

        let recompute = FixedRecompute(vec![auth(0, "two"), auth(1, "three")]);
        let first = reconcile("j1", "s1", &recompute, &storage, &queue)
            .await
            .expect("first run");
        assert_eq!(first.proposed, 1);

        let second = reconcile("j1", "s1", &recompute, &storage, &queue)
            .await
            .expect("second run");
        assert_eq!(second.inserted, 0);
        assert_eq!(second.proposed, 0);

        let pending = storage
            .list_proposals("j1", Some(ProposalState::Pending))
            .await
            .expect("list");
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn recompute_failure_leaves_store_untouched() {
        let (_dir, storage, queue) = setup().await;
        seed(&storage, &["one"]).await;
        storage
            .establish_baseline("j1", "s1", 1, "outline")
            .await
            .expect("baseline");

        let err = reconcile("j1", "s1", &FailingRecompute, &storage, &queue)
            .await
            .unwrap_err();
        assert!(matches!(err, DocflowError::Reconciliation(_)));

        assert_eq!(storage.count_chunks("j1", "s1").await.expect("count"), 1);
        assert!(
            storage
                .list_proposals("j1", None)
                .await
                .expect("list")
                .is_empty()
        );
        let baseline = storage
            .active_baseline("j1", "s1")
            .await
            .expect("query")
            .expect("baseline");
        assert_eq!(baseline.established_by, "outline");
    }

    #[tokio::test]
    async fn identical_sets_supersede_baseline_without_marks() {
        let (_dir, storage, queue) = setup().await;
        seed(&storage, &["one", "two"]).await;
        storage
            .establish_baseline("j1", "s1", 5, "outline")
            .await
            .expect("baseline");

        let recompute = FixedRecompute(vec![auth(0, "one"), auth(1, "two")]);
        let report = reconcile("j1", "s1", &recompute, &storage, &queue)
            .await
            .expect("reconcile");
        assert_eq!(report.inserted, 0);
        assert_eq!(report.proposed, 0);
        assert_eq!(report.new_expected, 2);

        assert!(
            storage
                .list_rebuild_marks("j1")
                .await
                .expect("marks")
                .is_empty()
        );
        let baseline = storage
            .active_baseline("j1", "s1")
            .await
            .expect("query")
            .expect("baseline");
        assert_eq!(baseline.expected_count, 2);
    }
}
