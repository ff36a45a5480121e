//! Run orchestrator: owns the manifest, enforces gates, routes drift.
//!
//! The orchestrator is the only writer of manifest state during a run. It
//! holds the job lease for the whole run, persists the manifest after every
//! status transition, and validates each pass's artifacts twice: once at
//! completion and again at the gate before the next pass consumes them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use docflow_contract::schema::{OutlineDoc, SourceSet};
use docflow_contract::{ValidationContext, Verdict, declared_outputs, validate};
use docflow_manifest::ManifestStore;
use docflow_reconcile::{AuthoritativeChunk, Recompute, ReconcileReport, reconcile};
use docflow_shared::{
    AppConfig, ArtifactRef, DocflowError, JobId, Manifest, PassMetrics, PassName, PassStatus,
    Result,
};
use docflow_storage::{ApprovalQueue, ChunkRecord, Storage};

use crate::passes::{HandlerRegistry, PassContext, PipelineSettings, chunk};

// ---------------------------------------------------------------------------
// Run surface
// ---------------------------------------------------------------------------

/// Parameters for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub job_id: JobId,
    pub environment: String,
    /// Directory the intake pass scans.
    pub sources_root: PathBuf,
    /// Start at this pass; everything before it must already be SUCCESS
    /// with artifacts that still validate.
    pub from: Option<PassName>,
    /// Restrict the run to these passes (empty = all).
    pub only: Vec<PassName>,
}

/// Cooperative cancellation flag checked between passes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-pass progress callbacks for the CLI.
pub trait ProgressReporter {
    fn pass_started(&self, pass: PassName);
    fn pass_finished(&self, pass: PassName, status: PassStatus);
}

/// Reporter that says nothing (tests, library callers).
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn pass_started(&self, _pass: PassName) {}
    fn pass_finished(&self, _pass: PassName, _status: PassStatus) {}
}

/// What one run did.
#[derive(Debug)]
pub struct RunSummary {
    pub job_id: JobId,
    pub statuses: BTreeMap<PassName, PassStatus>,
    /// Reconciliations triggered by count drift during this run.
    pub reconciled: Vec<ReconcileReport>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    store: ManifestStore,
    storage: Storage,
    queue: ApprovalQueue,
    handlers: HandlerRegistry,
    settings: PipelineSettings,
    drift_tolerance: f64,
    halt_on_reconcile_failure: bool,
}

impl Orchestrator {
    pub fn new(
        store: ManifestStore,
        storage: Storage,
        queue: ApprovalQueue,
        config: &AppConfig,
        handlers: HandlerRegistry,
    ) -> Result<Self> {
        Ok(Self {
            store,
            storage,
            queue,
            handlers,
            settings: PipelineSettings {
                max_chunk_bytes: config.pipeline.max_chunk_bytes,
                patterns: config.sources.compile()?,
            },
            drift_tolerance: config.pipeline.drift_tolerance,
            halt_on_reconcile_failure: config.pipeline.halt_on_reconcile_failure,
        })
    }

    /// Execute the selected passes in order. Holds the job lease for the
    /// duration; a second concurrent run against the same job fails fast.
    #[instrument(skip_all, fields(job_id = %opts.job_id))]
    pub async fn run(
        &self,
        opts: &RunOptions,
        progress: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<RunSummary> {
        let job_id = &opts.job_id;
        let _lease = self.store.acquire_lease(job_id)?;
        let mut manifest = self.store.create_or_load(job_id, &opts.environment)?;
        let job_dir = self.store.job_dir(job_id);
        let job_key = job_id.to_string();

        let selected = select_passes(opts, &manifest)?;
        if let Some(first) = selected.first() {
            self.revalidate_upstream(*first, &manifest, &job_dir, &job_key)
                .await?;
        }
        let mut reconciled = Vec::new();

        for pass in PassName::ALL {
            if cancel.is_cancelled() {
                warn!(%pass, "run cancelled, remaining passes left pending");
                break;
            }

            if !selected.contains(&pass) {
                if manifest.pass(pass).status == PassStatus::Pending {
                    manifest.mark_skipped(pass)?;
                    self.store.persist(&manifest)?;
                }
                continue;
            }

            self.check_gate(pass, &manifest, &job_dir, &job_key).await?;

            progress.pass_started(pass);
            let version = manifest
                .pass(pass)
                .artifacts
                .iter()
                .map(|a| a.version)
                .max()
                .unwrap_or(0)
                + 1;
            manifest.mark_running(pass)?;
            self.store.persist(&manifest)?;

            let inputs = successful_artifacts(&manifest);
            let ctx = PassContext {
                job_id,
                environment: &manifest.job.environment,
                job_dir: &job_dir,
                sources_root: &opts.sources_root,
                version,
                inputs: &inputs,
                settings: &self.settings,
            };

            let started = Instant::now();
            let handler = self.handlers.get(pass)?;
            let output = match handler.run(&ctx) {
                Ok(output) => output,
                Err(e) => {
                    manifest.mark_failed(pass, e.to_string())?;
                    self.store.persist(&manifest)?;
                    progress.pass_finished(pass, PassStatus::Failed);
                    return Err(e);
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            // Derived records go in before validation so the record store
            // and the artifact describe the same set.
            for record in &output.records {
                self.storage
                    .upsert_chunk(&ChunkRecord {
                        id: Uuid::now_v7().to_string(),
                        job_id: job_key.clone(),
                        source_id: record.source_id.clone(),
                        seq: record.seq,
                        content_hash: record.content_hash.clone(),
                        created_at: Utc::now(),
                    })
                    .await?;
                self.storage
                    .upsert_cache_entry(&record.content_hash, &job_key, &record.source_id, &record.text)
                    .await?;
            }

            match pass {
                PassName::Intake => {
                    record_fingerprints(&mut manifest, &job_dir, &output.artifacts)?;
                }
                PassName::Outline => {
                    self.establish_baselines(&job_key, &job_dir, &output.artifacts)
                        .await?;
                }
                _ => {}
            }

            let baselines = self.baseline_map(&job_key).await?;
            let vctx = ValidationContext {
                job_dir: &job_dir,
                drift_tolerance: self.drift_tolerance,
                baselines: &baselines,
            };
            match validate(pass, &output.artifacts, &vctx) {
                Verdict::Ok => {}
                Verdict::Violation(reason) => {
                    manifest.mark_failed(pass, reason.clone())?;
                    self.store.persist(&manifest)?;
                    progress.pass_finished(pass, PassStatus::Failed);
                    return Err(DocflowError::contract(pass.as_str(), reason));
                }
                Verdict::Drift(reports) => {
                    info!(
                        %pass,
                        sources = reports.len(),
                        "count drift detected, reconciling"
                    );
                    let recompute =
                        CanonicalRecompute::load(&job_dir, &inputs, self.settings.max_chunk_bytes)?;
                    for report in reports {
                        match reconcile(
                            &job_key,
                            &report.source_id,
                            &recompute,
                            &self.storage,
                            &self.queue,
                        )
                        .await
                        {
                            Ok(r) => reconciled.push(r),
                            Err(e) if self.halt_on_reconcile_failure => {
                                manifest.mark_failed(pass, e.to_string())?;
                                self.store.persist(&manifest)?;
                                progress.pass_finished(pass, PassStatus::Failed);
                                return Err(e);
                            }
                            Err(e) => {
                                warn!(
                                    source_id = %report.source_id,
                                    error = %e,
                                    "reconciliation failed, drift stands"
                                );
                            }
                        }
                    }
                }
            }

            // This pass just rebuilt its outputs; any standing marks on
            // them are satisfied.
            for name in declared_outputs(pass) {
                self.storage.clear_rebuild_marks(&job_key, name).await?;
            }

            manifest.mark_success(
                pass,
                output.artifacts,
                PassMetrics {
                    records_out: output.records_out,
                    duration_ms,
                },
            )?;
            self.store.persist(&manifest)?;
            progress.pass_finished(pass, PassStatus::Success);
        }

        Ok(RunSummary {
            job_id: job_id.clone(),
            statuses: manifest
                .passes
                .iter()
                .map(|(pass, record)| (*pass, record.status))
                .collect(),
            reconciled,
        })
    }

    /// Gate before `pass`: the nearest non-skipped predecessor must be
    /// SUCCESS and its artifacts must still validate, byte for byte.
    async fn check_gate(
        &self,
        pass: PassName,
        manifest: &Manifest,
        job_dir: &Path,
        job_key: &str,
    ) -> Result<()> {
        let mut pred = pass.predecessor();
        while let Some(p) = pred {
            if manifest.pass(p).status != PassStatus::Skipped {
                break;
            }
            pred = p.predecessor();
        }
        let Some(pred) = pred else {
            return Ok(());
        };

        let record = manifest.pass(pred);
        if record.status != PassStatus::Success {
            return Err(DocflowError::gate(
                pass.as_str(),
                format!("predecessor '{pred}' is {}", record.status),
            ));
        }

        let baselines = self.baseline_map(job_key).await?;
        let vctx = ValidationContext {
            job_dir,
            drift_tolerance: self.drift_tolerance,
            baselines: &baselines,
        };
        match validate(pred, &record.artifacts, &vctx) {
            Verdict::Ok => Ok(()),
            // Gate-time drift is tolerated: the record store may already be
            // reconciled ahead of the persisted artifact.
            Verdict::Drift(reports) => {
                warn!(
                    %pred,
                    sources = reports.len(),
                    "gate-time count drift tolerated"
                );
                Ok(())
            }
            Verdict::Violation(reason) => Err(DocflowError::gate(
                pass.as_str(),
                format!("predecessor '{pred}' artifacts failed re-validation: {reason}"),
            )),
        }
    }

    /// A resumed or subset run inherits every earlier SUCCESS pass's
    /// artifacts as inputs. The per-pass gate only re-checks the nearest
    /// predecessor, so all passes before the first selected one get
    /// re-validated here before anything executes.
    async fn revalidate_upstream(
        &self,
        first: PassName,
        manifest: &Manifest,
        job_dir: &Path,
        job_key: &str,
    ) -> Result<()> {
        let baselines = self.baseline_map(job_key).await?;
        let vctx = ValidationContext {
            job_dir,
            drift_tolerance: self.drift_tolerance,
            baselines: &baselines,
        };
        for pass in PassName::ALL {
            if pass >= first {
                break;
            }
            let record = manifest.pass(pass);
            if record.status != PassStatus::Success {
                continue;
            }
            match validate(pass, &record.artifacts, &vctx) {
                Verdict::Ok => {}
                Verdict::Drift(reports) => {
                    warn!(
                        %pass,
                        sources = reports.len(),
                        "gate-time count drift tolerated"
                    );
                }
                Verdict::Violation(reason) => {
                    return Err(DocflowError::gate(
                        first.as_str(),
                        format!("upstream pass '{pass}' artifacts failed re-validation: {reason}"),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn baseline_map(&self, job_key: &str) -> Result<BTreeMap<String, u64>> {
        Ok(self
            .storage
            .list_active_baselines(job_key)
            .await?
            .into_iter()
            .map(|b| (b.source_id, b.expected_count))
            .collect())
    }

    /// Turn outline expected counts into baselines. A source keeps its
    /// existing baseline across reruns; only reconciliation supersedes one.
    async fn establish_baselines(
        &self,
        job_key: &str,
        job_dir: &Path,
        artifacts: &[ArtifactRef],
    ) -> Result<()> {
        let outline: OutlineDoc = read_artifact_payload(job_dir, artifacts, "outline")?;
        for source in &outline.sources {
            if self
                .storage
                .active_baseline(job_key, &source.source_id)
                .await?
                .is_none()
            {
                self.storage
                    .establish_baseline(job_key, &source.source_id, source.expected_chunks, "outline")
                    .await?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Which passes this run executes, honoring `--from` and `--only`.
fn select_passes(opts: &RunOptions, manifest: &Manifest) -> Result<Vec<PassName>> {
    let mut selected = Vec::new();
    for pass in PassName::ALL {
        if let Some(from) = opts.from {
            if pass < from {
                if manifest.pass(pass).status != PassStatus::Success {
                    return Err(DocflowError::gate(
                        from.as_str(),
                        format!(
                            "cannot start at '{from}': earlier pass '{pass}' is {}",
                            manifest.pass(pass).status
                        ),
                    ));
                }
                continue;
            }
        }
        if !opts.only.is_empty() && !opts.only.contains(&pass) {
            continue;
        }
        selected.push(pass);
    }
    Ok(selected)
}

/// Snapshot of validated artifacts per successful pass.
fn successful_artifacts(manifest: &Manifest) -> BTreeMap<PassName, Vec<ArtifactRef>> {
    manifest
        .passes
        .iter()
        .filter(|(_, record)| record.status == PassStatus::Success)
        .map(|(pass, record)| (*pass, record.artifacts.clone()))
        .collect()
}

fn record_fingerprints(
    manifest: &mut Manifest,
    job_dir: &Path,
    artifacts: &[ArtifactRef],
) -> Result<()> {
    let source_set: SourceSet = read_artifact_payload(job_dir, artifacts, "source_set")?;
    for source in &source_set.sources {
        manifest
            .source_fingerprints
            .insert(source.id.clone(), source.fingerprint.clone());
    }
    Ok(())
}

fn read_artifact_payload<T: serde::de::DeserializeOwned>(
    job_dir: &Path,
    artifacts: &[ArtifactRef],
    name: &str,
) -> Result<T> {
    let artifact = artifacts
        .iter()
        .find(|a| a.name == name)
        .ok_or_else(|| DocflowError::validation(format!("artifact '{name}' not recorded")))?;
    let path = job_dir.join(&artifact.path);
    let bytes = std::fs::read(&path).map_err(|e| DocflowError::io(&path, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| DocflowError::validation(format!("artifact '{name}' failed to parse: {e}")))
}

/// Recompute seam backed by the canonical text of the current source set,
/// using the same splitter and hashing as the chunk pass.
struct CanonicalRecompute {
    job_dir: PathBuf,
    canonical_paths: BTreeMap<String, String>,
    max_chunk_bytes: usize,
}

impl CanonicalRecompute {
    fn load(
        job_dir: &Path,
        inputs: &BTreeMap<PassName, Vec<ArtifactRef>>,
        max_chunk_bytes: usize,
    ) -> Result<Self> {
        let artifacts = inputs.get(&PassName::Intake).map(Vec::as_slice).unwrap_or(&[]);
        let source_set: SourceSet = read_artifact_payload(job_dir, artifacts, "source_set")?;
        Ok(Self {
            job_dir: job_dir.to_path_buf(),
            canonical_paths: source_set
                .sources
                .into_iter()
                .map(|s| (s.id, s.canonical_path))
                .collect(),
            max_chunk_bytes,
        })
    }
}

impl Recompute for CanonicalRecompute {
    fn recompute(&self, source_id: &str) -> Result<Vec<AuthoritativeChunk>> {
        let rel = self.canonical_paths.get(source_id).ok_or_else(|| {
            DocflowError::Reconciliation(format!("no canonical text for source '{source_id}'"))
        })?;
        let path = self.job_dir.join(rel);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            DocflowError::Reconciliation(format!("cannot read {}: {e}", path.display()))
        })?;

        Ok(chunk::split_source(&text, self.max_chunk_bytes)
            .into_iter()
            .enumerate()
            .map(|(seq, piece)| AuthoritativeChunk {
                source_id: source_id.into(),
                seq: seq as u64,
                content_hash: chunk::chunk_hash(source_id, &piece.text),
                text: piece.text,
            })
            .collect())
    }
}
