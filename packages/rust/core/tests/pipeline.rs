//! End-to-end pipeline runs against a real temp job directory and database.

use std::path::{Path, PathBuf};

use docflow_contract::schema::{ChunkEntry, ChunkSet, SourceChunks, SourceSet};
use docflow_core::passes::chunk::{chunk_hash, split_source};
use docflow_core::passes::DerivedChunk;
use docflow_core::{
    CancelToken, HandlerRegistry, Orchestrator, PassContext, PassHandler, PassOutput, RunOptions,
    SilentProgress,
};
use docflow_manifest::ManifestStore;
use docflow_shared::{
    ActorRole, AppConfig, ArtifactRef, DocflowError, JobId, PassName, PassStatus, trace,
};
use docflow_storage::{ApprovalQueue, AuditLog, Decision, ProposalState, Storage};

const GUIDE: &str = "# Guide\n\nIntro paragraph.\n\n## Install\n\nInstall text.\n\n## Usage\n\nUsage text.\n";
const NOTES: &str = "Plain notes.\n\nMore notes.\n";

fn write_sources(dir: &Path) {
    std::fs::create_dir_all(dir).expect("mkdir sources");
    std::fs::write(dir.join("guide.md"), GUIDE).expect("write guide");
    std::fs::write(dir.join("notes.txt"), NOTES).expect("write notes");
}

async fn orchestrator(root: &Path, job_id: &JobId, handlers: HandlerRegistry) -> Orchestrator {
    let store = ManifestStore::new(root.join("jobs"));
    let job_dir = store.job_dir(job_id);
    let storage = Storage::open(&job_dir.join("indexes").join("docflow.db"))
        .await
        .expect("open storage");
    let queue = ApprovalQueue::new(AuditLog::for_job_dir(&job_dir), ActorRole::Admin);
    Orchestrator::new(store, storage, queue, &AppConfig::default(), handlers)
        .expect("build orchestrator")
}

fn opts(job_id: &JobId, sources: &Path) -> RunOptions {
    RunOptions {
        job_id: job_id.clone(),
        environment: "dev".into(),
        sources_root: sources.to_path_buf(),
        from: None,
        only: Vec::new(),
    }
}

fn job_dir(root: &Path, job_id: &JobId) -> PathBuf {
    root.join("jobs").join(job_id.to_string())
}

// ---------------------------------------------------------------------------
// Test handlers
// ---------------------------------------------------------------------------

struct FailingEmbed;

impl PassHandler for FailingEmbed {
    fn name(&self) -> PassName {
        PassName::Embed
    }

    fn run(&self, _ctx: &PassContext) -> docflow_shared::Result<PassOutput> {
        Err(DocflowError::pass_failed("embed", "synthetic failure"))
    }
}

/// Chunk handler that silently loses the last chunk of every source.
struct LossyChunk;

impl PassHandler for LossyChunk {
    fn name(&self) -> PassName {
        PassName::Chunk
    }

    fn run(&self, ctx: &PassContext) -> docflow_shared::Result<PassOutput> {
        let refs = ctx.inputs.get(&PassName::Intake).expect("intake inputs");
        let artifact = refs
            .iter()
            .find(|a| a.name == "source_set")
            .expect("source_set artifact");
        let bytes = std::fs::read(ctx.job_dir.join(&artifact.path)).expect("read source_set");
        let source_set: SourceSet = serde_json::from_slice(&bytes).expect("parse source_set");

        let mut sources = Vec::new();
        let mut records = Vec::new();
        for source in &source_set.sources {
            let text = std::fs::read_to_string(ctx.job_dir.join(&source.canonical_path))
                .expect("read canonical");
            let mut pieces = split_source(&text, ctx.settings.max_chunk_bytes);
            pieces.pop();

            let mut chunks = Vec::new();
            for (seq, piece) in pieces.iter().enumerate() {
                let hash = chunk_hash(&source.id, &piece.text);
                chunks.push(ChunkEntry {
                    hash: hash.clone(),
                    seq: seq as u64,
                    heading: piece.heading.clone(),
                });
                records.push(DerivedChunk {
                    source_id: source.id.clone(),
                    seq: seq as u64,
                    content_hash: hash,
                    text: piece.text.clone(),
                });
            }
            sources.push(SourceChunks {
                source_id: source.id.clone(),
                chunk_count: chunks.len() as u64,
                chunks,
            });
        }

        let set = ChunkSet { sources };
        let rel = format!("artifacts/chunk_set.v{}.json", ctx.version);
        let path = ctx.job_dir.join(&rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        let bytes = serde_json::to_vec_pretty(&set).expect("serialize");
        std::fs::write(&path, &bytes).expect("write chunk_set");

        Ok(PassOutput {
            artifacts: vec![ArtifactRef {
                name: "chunk_set".into(),
                version: ctx.version,
                path: rel,
                content_hash: trace::content_hash(&bytes),
            }],
            records_out: records.len() as u64,
            records,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_run_succeeds_and_publishes_a_bundle() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    write_sources(&sources);
    let job_id = JobId::new();

    let orch = orchestrator(tmp.path(), &job_id, HandlerRegistry::default_handlers()).await;
    let summary = orch
        .run(&opts(&job_id, &sources), &SilentProgress, &CancelToken::new())
        .await
        .expect("run");

    assert!(
        summary
            .statuses
            .values()
            .all(|s| *s == PassStatus::Success)
    );
    assert!(summary.reconciled.is_empty());

    let dir = job_dir(tmp.path(), &job_id);
    assert!(dir.join("bundle").join("index.json").exists());
    assert!(dir.join("bundle").join("docs").join("guide.txt").exists());

    let manifest = ManifestStore::new(tmp.path().join("jobs"))
        .snapshot(&job_id)
        .expect("snapshot");
    assert_eq!(manifest.source_fingerprints.len(), 2);
    assert!(
        manifest
            .source_fingerprints
            .values()
            .all(|f| f.starts_with("tp1:"))
    );
    assert_eq!(manifest.metrics.passes_succeeded, 6);

    // Chunk records and baselines landed in storage.
    let storage = Storage::open_readonly(&dir.join("indexes").join("docflow.db"))
        .await
        .expect("open readonly");
    let job_key = job_id.to_string();
    assert_eq!(storage.count_chunks(&job_key, "guide").await.expect("count"), 3);
    assert_eq!(storage.count_chunks(&job_key, "notes").await.expect("count"), 1);
    let baselines = storage.list_active_baselines(&job_key).await.expect("baselines");
    assert_eq!(baselines.len(), 2);
    assert!(baselines.iter().all(|b| b.established_by == "outline"));
}

#[tokio::test]
async fn reruns_produce_byte_identical_artifacts() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    write_sources(&sources);
    let job_id = JobId::new();

    let orch = orchestrator(tmp.path(), &job_id, HandlerRegistry::default_handlers()).await;
    let run_opts = opts(&job_id, &sources);
    orch.run(&run_opts, &SilentProgress, &CancelToken::new())
        .await
        .expect("first run");
    let second = orch
        .run(&run_opts, &SilentProgress, &CancelToken::new())
        .await
        .expect("second run");
    assert!(second.reconciled.is_empty());

    let artifacts = job_dir(tmp.path(), &job_id).join("artifacts");
    for name in ["source_set", "outline", "chunk_set", "embeddings", "graph"] {
        let v1 = std::fs::read(artifacts.join(format!("{name}.v1.json"))).expect("v1");
        let v2 = std::fs::read(artifacts.join(format!("{name}.v2.json"))).expect("v2");
        assert_eq!(v1, v2, "artifact '{name}' changed across identical reruns");
    }

    // Duplicate records were ignored, not re-inserted.
    let storage = Storage::open_readonly(
        &job_dir(tmp.path(), &job_id).join("indexes").join("docflow.db"),
    )
    .await
    .expect("open readonly");
    assert_eq!(
        storage
            .count_chunks(&job_id.to_string(), "guide")
            .await
            .expect("count"),
        3
    );
}

#[tokio::test]
async fn failed_pass_resumes_from_that_pass() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    write_sources(&sources);
    let job_id = JobId::new();

    let mut handlers = HandlerRegistry::default_handlers();
    handlers.insert(Box::new(FailingEmbed));
    {
        let orch = orchestrator(tmp.path(), &job_id, handlers).await;
        let err = orch
            .run(&opts(&job_id, &sources), &SilentProgress, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DocflowError::PassFailed { .. }));
    }

    let store = ManifestStore::new(tmp.path().join("jobs"));
    let manifest = store.snapshot(&job_id).expect("snapshot");
    assert_eq!(manifest.pass(PassName::Chunk).status, PassStatus::Success);
    assert_eq!(manifest.pass(PassName::Embed).status, PassStatus::Failed);
    assert_eq!(
        manifest.pass(PassName::Embed).failure_reason.as_deref(),
        Some("pass 'embed' failed: synthetic failure")
    );
    assert_eq!(manifest.pass(PassName::Graph).status, PassStatus::Pending);

    // Resume from the failed pass with a working handler.
    let orch = orchestrator(tmp.path(), &job_id, HandlerRegistry::default_handlers()).await;
    let mut run_opts = opts(&job_id, &sources);
    run_opts.from = Some(PassName::Embed);
    let summary = orch
        .run(&run_opts, &SilentProgress, &CancelToken::new())
        .await
        .expect("resume");
    assert!(
        summary
            .statuses
            .values()
            .all(|s| *s == PassStatus::Success)
    );

    // Earlier passes were not re-executed: their artifacts are still v1.
    let manifest = store.snapshot(&job_id).expect("snapshot");
    assert_eq!(manifest.pass(PassName::Chunk).artifacts[0].version, 1);
    assert_eq!(manifest.pass(PassName::Embed).artifacts[0].version, 1);
}

#[tokio::test]
async fn starting_midway_on_a_fresh_job_is_gate_blocked() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    write_sources(&sources);
    let job_id = JobId::new();

    let orch = orchestrator(tmp.path(), &job_id, HandlerRegistry::default_handlers()).await;
    let mut run_opts = opts(&job_id, &sources);
    run_opts.from = Some(PassName::Chunk);
    let err = orch
        .run(&run_opts, &SilentProgress, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DocflowError::GateBlocked { .. }));
}

#[tokio::test]
async fn tampered_artifact_blocks_the_next_gate() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    write_sources(&sources);
    let job_id = JobId::new();

    let orch = orchestrator(tmp.path(), &job_id, HandlerRegistry::default_handlers()).await;
    orch.run(&opts(&job_id, &sources), &SilentProgress, &CancelToken::new())
        .await
        .expect("first run");

    // External edit after the run recorded the hash.
    let chunk_set = job_dir(tmp.path(), &job_id)
        .join("artifacts")
        .join("chunk_set.v1.json");
    let mut bytes = std::fs::read(&chunk_set).expect("read");
    bytes.push(b'\n');
    std::fs::write(&chunk_set, bytes).expect("tamper");

    let mut run_opts = opts(&job_id, &sources);
    run_opts.from = Some(PassName::Embed);
    let err = orch
        .run(&run_opts, &SilentProgress, &CancelToken::new())
        .await
        .unwrap_err();
    match err {
        DocflowError::GateBlocked { reason, .. } => {
            assert!(reason.contains("re-validation"), "unexpected reason: {reason}");
        }
        other => panic!("expected gate block, got {other}"),
    }
}

#[tokio::test]
async fn tampered_upstream_artifact_blocks_a_resume() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    write_sources(&sources);
    let job_id = JobId::new();

    let orch = orchestrator(tmp.path(), &job_id, HandlerRegistry::default_handlers()).await;
    orch.run(&opts(&job_id, &sources), &SilentProgress, &CancelToken::new())
        .await
        .expect("first run");

    // Tamper well upstream of the resume point: the intake output is not
    // the predecessor of any resumed pass, but publish still consumes it.
    let source_set = job_dir(tmp.path(), &job_id)
        .join("artifacts")
        .join("source_set.v1.json");
    let mut bytes = std::fs::read(&source_set).expect("read");
    bytes.push(b'\n');
    std::fs::write(&source_set, bytes).expect("tamper");

    let mut run_opts = opts(&job_id, &sources);
    run_opts.from = Some(PassName::Embed);
    let err = orch
        .run(&run_opts, &SilentProgress, &CancelToken::new())
        .await
        .unwrap_err();
    match err {
        DocflowError::GateBlocked { reason, .. } => {
            assert!(
                reason.contains("intake") && reason.contains("re-validation"),
                "unexpected reason: {reason}"
            );
        }
        other => panic!("expected gate block, got {other}"),
    }

    // Nothing ran: the resumed passes still carry their first-run records.
    let manifest = ManifestStore::new(tmp.path().join("jobs"))
        .snapshot(&job_id)
        .expect("snapshot");
    assert_eq!(manifest.pass(PassName::Embed).artifacts[0].version, 1);
}

#[tokio::test]
async fn sources_colliding_on_one_id_fail_intake() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    std::fs::create_dir_all(&sources).expect("mkdir sources");
    std::fs::write(sources.join("a b.md"), "Alpha text.\n").expect("write");
    std::fs::write(sources.join("a-b.md"), "Beta text.\n").expect("write");
    let job_id = JobId::new();

    let orch = orchestrator(tmp.path(), &job_id, HandlerRegistry::default_handlers()).await;
    let err = orch
        .run(&opts(&job_id, &sources), &SilentProgress, &CancelToken::new())
        .await
        .unwrap_err();
    match err {
        DocflowError::PassFailed { pass, reason } => {
            assert_eq!(pass, "intake");
            assert!(reason.contains("collide on id 'a-b'"), "unexpected reason: {reason}");
        }
        other => panic!("expected intake failure, got {other}"),
    }
}

#[tokio::test]
async fn undercounting_chunk_pass_triggers_reconciliation() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    write_sources(&sources);
    let job_id = JobId::new();

    let mut handlers = HandlerRegistry::default_handlers();
    handlers.insert(Box::new(LossyChunk));
    let orch = orchestrator(tmp.path(), &job_id, handlers).await;
    let summary = orch
        .run(&opts(&job_id, &sources), &SilentProgress, &CancelToken::new())
        .await
        .expect("run");

    // Drift is not failure: the run completed and both sources reconciled.
    assert!(
        summary
            .statuses
            .values()
            .all(|s| *s == PassStatus::Success)
    );
    assert_eq!(summary.reconciled.len(), 2);
    let guide = summary
        .reconciled
        .iter()
        .find(|r| r.source_id == "guide")
        .expect("guide report");
    assert_eq!(guide.inserted, 1);
    assert_eq!(guide.proposed, 0);
    assert_eq!(guide.new_expected, 3);

    // The record store carries the full recomputed set and the baselines
    // were superseded by reconciliation.
    let dir = job_dir(tmp.path(), &job_id);
    let storage = Storage::open_readonly(&dir.join("indexes").join("docflow.db"))
        .await
        .expect("open readonly");
    let job_key = job_id.to_string();
    assert_eq!(storage.count_chunks(&job_key, "guide").await.expect("count"), 3);
    let baselines = storage.list_active_baselines(&job_key).await.expect("baselines");
    assert!(baselines.iter().all(|b| b.established_by == "reconciliation"));

    // Nothing went stale, so no deletion proposals were filed.
    assert!(
        storage
            .list_proposals(&job_key, None)
            .await
            .expect("proposals")
            .is_empty()
    );
}

#[tokio::test]
async fn shrunken_source_proposes_stale_records_for_deletion() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    write_sources(&sources);
    let job_id = JobId::new();

    let orch = orchestrator(tmp.path(), &job_id, HandlerRegistry::default_handlers()).await;
    let run_opts = opts(&job_id, &sources);
    orch.run(&run_opts, &SilentProgress, &CancelToken::new())
        .await
        .expect("first run");

    // Drop the usage section; the two remaining chunks keep their hashes.
    std::fs::write(
        sources.join("guide.md"),
        "# Guide\n\nIntro paragraph.\n\n## Install\n\nInstall text.\n",
    )
    .expect("shrink guide");

    let summary = orch
        .run(&run_opts, &SilentProgress, &CancelToken::new())
        .await
        .expect("second run");
    assert_eq!(summary.reconciled.len(), 1);
    assert_eq!(summary.reconciled[0].source_id, "guide");
    assert_eq!(summary.reconciled[0].inserted, 0);
    assert_eq!(summary.reconciled[0].proposed, 1);
    assert_eq!(summary.reconciled[0].new_expected, 2);

    let dir = job_dir(tmp.path(), &job_id);
    let job_key = job_id.to_string();
    drop(orch);
    let storage = Storage::open(&dir.join("indexes").join("docflow.db"))
        .await
        .expect("reopen storage");

    // The stale record survives until an admin approves its deletion.
    assert_eq!(storage.count_chunks(&job_key, "guide").await.expect("count"), 3);
    let pending = storage
        .list_proposals(&job_key, Some(ProposalState::Pending))
        .await
        .expect("pending");
    assert_eq!(pending.len(), 1);

    let queue = ApprovalQueue::new(AuditLog::for_job_dir(&dir), ActorRole::Admin);
    queue
        .decide(&storage, &pending[0].id, "alice", ActorRole::Admin, Decision::Approve)
        .await
        .expect("approve");
    queue
        .execute(&storage, &pending[0].id, "alice")
        .await
        .expect("execute");
    assert_eq!(storage.count_chunks(&job_key, "guide").await.expect("count"), 2);

    // Full trail: reconciliation proposed, admin approved, executor removed.
    let actions: Vec<String> = AuditLog::for_job_dir(&dir)
        .read_all()
        .expect("audit")
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions, vec!["propose", "approved", "execute"]);
}

#[tokio::test]
async fn cancellation_leaves_remaining_passes_pending() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = tmp.path().join("sources");
    write_sources(&sources);
    let job_id = JobId::new();

    let orch = orchestrator(tmp.path(), &job_id, HandlerRegistry::default_handlers()).await;
    let cancel = CancelToken::new();
    cancel.cancel();
    let summary = orch
        .run(&opts(&job_id, &sources), &SilentProgress, &cancel)
        .await
        .expect("cancelled run");
    assert!(
        summary
            .statuses
            .values()
            .all(|s| *s == PassStatus::Pending)
    );
}
