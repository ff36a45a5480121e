//! Core domain types for Docflow ingestion jobs.
//!
//! The [`Manifest`] is the single source of truth for one job. It is owned
//! for writes by the orchestrator alone; every other component receives it
//! explicitly and reads it. Pass status transitions are centralized in the
//! `mark_*` methods so an illegal transition is a constructed error, never
//! a silent field mutation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DocflowError, Result};

/// Current schema version for the persisted manifest format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for job identifiers (time-sortable, opaque).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// PassName
// ---------------------------------------------------------------------------

/// The fixed, ordered set of ingestion passes.
///
/// Declaration order is execution order; `Ord` derives from it, so a
/// `BTreeMap<PassName, _>` iterates in pipeline order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PassName {
    /// Scan, canonicalize, and fingerprint source documents.
    Intake,
    /// Derive the authoritative section outline and expected chunk counts.
    Outline,
    /// Split canonical text into retrieval chunks.
    Chunk,
    /// Compute deterministic embeddings per chunk.
    Embed,
    /// Link chunks into a cross-reference graph.
    Graph,
    /// Assemble the final bundle directory.
    Publish,
}

impl PassName {
    /// All passes in execution order.
    pub const ALL: [PassName; 6] = [
        PassName::Intake,
        PassName::Outline,
        PassName::Chunk,
        PassName::Embed,
        PassName::Graph,
        PassName::Publish,
    ];

    /// The pass immediately before this one, if any.
    pub fn predecessor(self) -> Option<PassName> {
        let idx = Self::ALL.iter().position(|p| *p == self)?;
        if idx == 0 {
            None
        } else {
            Some(Self::ALL[idx - 1])
        }
    }

    /// Stable lowercase name used in CLI flags and persisted forms.
    pub fn as_str(self) -> &'static str {
        match self {
            PassName::Intake => "intake",
            PassName::Outline => "outline",
            PassName::Chunk => "chunk",
            PassName::Embed => "embed",
            PassName::Graph => "graph",
            PassName::Publish => "publish",
        }
    }
}

impl std::fmt::Display for PassName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PassName {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "intake" => Ok(PassName::Intake),
            "outline" => Ok(PassName::Outline),
            "chunk" => Ok(PassName::Chunk),
            "embed" => Ok(PassName::Embed),
            "graph" => Ok(PassName::Graph),
            "publish" => Ok(PassName::Publish),
            other => Err(DocflowError::validation(format!(
                "unknown pass '{other}': expected one of intake, outline, chunk, embed, graph, publish"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// PassStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of one pass record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for PassStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PassStatus::Pending => "pending",
            PassStatus::Running => "running",
            PassStatus::Success => "success",
            PassStatus::Failed => "failed",
            PassStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ArtifactRef
// ---------------------------------------------------------------------------

/// A named, versioned pointer to a pass's output file.
///
/// Holds the identity and content hash of the output, never the content
/// itself. Only valid for downstream consumption after contract validation;
/// gate-time re-validation re-hashes the file against `content_hash` to
/// catch external tampering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Contract-declared artifact name (e.g., `chunk_set`).
    pub name: String,
    /// Version counter, bumped each time the producing pass reruns.
    pub version: u32,
    /// Path relative to the job directory.
    pub path: String,
    /// `sha256:<hex>` of the raw file bytes.
    pub content_hash: String,
}

// ---------------------------------------------------------------------------
// PassRecord
// ---------------------------------------------------------------------------

/// Per-pass metrics recorded on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassMetrics {
    /// Records emitted by this pass (sources, chunks, edges, ...).
    pub records_out: u64,
    /// Wall-clock duration of the pass invocation.
    pub duration_ms: u64,
}

/// One entry per named pass in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassRecord {
    /// Current lifecycle state.
    pub status: PassStatus,
    /// When the pass started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the pass reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Validated output artifact references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    /// Metrics recorded at completion.
    #[serde(default)]
    pub metrics: PassMetrics,
    /// Failure reason when status is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Default for PassRecord {
    fn default() -> Self {
        Self {
            status: PassStatus::Pending,
            started_at: None,
            ended_at: None,
            artifacts: Vec::new(),
            metrics: PassMetrics::default(),
            failure_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Job metadata, immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    /// Opaque, time-derived job identifier.
    pub id: JobId,
    /// Environment tag (e.g., `dev`, `nightly`).
    pub environment: String,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

/// Aggregate run metrics, updated after each pass transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Passes recorded success across the job's lifetime.
    pub passes_succeeded: u64,
    /// Passes recorded failed across the job's lifetime.
    pub passes_failed: u64,
    /// Sum of `records_out` over successful passes.
    pub total_records: u64,
    /// Sum of pass durations over successful passes.
    pub total_duration_ms: u64,
}

/// The `manifest.json` structure: one job's full durable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Job identity and environment.
    pub job: JobMeta,
    /// One record per pass, keyed in execution order.
    pub passes: BTreeMap<PassName, PassRecord>,
    /// Source identifier → content fingerprint (traceability policy v1).
    #[serde(default)]
    pub source_fingerprints: BTreeMap<String, String>,
    /// Aggregate metrics across all pass transitions.
    #[serde(default)]
    pub metrics: RunMetrics,
}

impl Manifest {
    /// Create a fresh manifest with every pass pending.
    pub fn new(id: JobId, environment: impl Into<String>) -> Self {
        let mut passes = BTreeMap::new();
        for pass in PassName::ALL {
            passes.insert(pass, PassRecord::default());
        }
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            job: JobMeta {
                id,
                environment: environment.into(),
                created_at: Utc::now(),
            },
            passes,
            source_fingerprints: BTreeMap::new(),
            metrics: RunMetrics::default(),
        }
    }

    /// Read access to one pass record.
    pub fn pass(&self, pass: PassName) -> &PassRecord {
        // The constructor seeds every variant, so the entry always exists.
        self.passes.get(&pass).unwrap_or_else(|| {
            panic!("manifest missing record for pass '{pass}'");
        })
    }

    /// Transition a pass to RUNNING. Legal only from PENDING or from a
    /// terminal state when the pass is being re-attempted on resume.
    pub fn mark_running(&mut self, pass: PassName) -> Result<()> {
        let record = self.pass_mut(pass);
        match record.status {
            PassStatus::Running => {
                return Err(DocflowError::invalid_state(format!(
                    "pass '{pass}' is already running"
                )));
            }
            PassStatus::Pending | PassStatus::Failed | PassStatus::Success | PassStatus::Skipped => {}
        }
        *record = PassRecord {
            status: PassStatus::Running,
            started_at: Some(Utc::now()),
            ..PassRecord::default()
        };
        Ok(())
    }

    /// Transition a RUNNING pass to SUCCESS with its validated artifacts.
    pub fn mark_success(
        &mut self,
        pass: PassName,
        artifacts: Vec<ArtifactRef>,
        metrics: PassMetrics,
    ) -> Result<()> {
        let record = self.pass_mut(pass);
        if record.status != PassStatus::Running {
            return Err(DocflowError::invalid_state(format!(
                "pass '{pass}' cannot succeed from status '{}'",
                record.status
            )));
        }
        record.status = PassStatus::Success;
        record.ended_at = Some(Utc::now());
        record.artifacts = artifacts;
        record.metrics = metrics.clone();
        record.failure_reason = None;
        self.metrics.passes_succeeded += 1;
        self.metrics.total_records += metrics.records_out;
        self.metrics.total_duration_ms += metrics.duration_ms;
        Ok(())
    }

    /// Transition a RUNNING pass to FAILED with the failure reason.
    pub fn mark_failed(&mut self, pass: PassName, reason: impl Into<String>) -> Result<()> {
        let record = self.pass_mut(pass);
        if record.status != PassStatus::Running {
            return Err(DocflowError::invalid_state(format!(
                "pass '{pass}' cannot fail from status '{}'",
                record.status
            )));
        }
        record.status = PassStatus::Failed;
        record.ended_at = Some(Utc::now());
        record.failure_reason = Some(reason.into());
        self.metrics.passes_failed += 1;
        Ok(())
    }

    /// Mark a pass SKIPPED because a subset run excludes it.
    /// Only reachable from PENDING; records from earlier runs are untouched.
    pub fn mark_skipped(&mut self, pass: PassName) -> Result<()> {
        let record = self.pass_mut(pass);
        if record.status != PassStatus::Pending {
            return Err(DocflowError::invalid_state(format!(
                "pass '{pass}' cannot be skipped from status '{}'",
                record.status
            )));
        }
        record.status = PassStatus::Skipped;
        Ok(())
    }

    /// True once every pass record is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.passes.values().all(|r| {
            matches!(
                r.status,
                PassStatus::Success | PassStatus::Failed | PassStatus::Skipped
            )
        })
    }

    fn pass_mut(&mut self, pass: PassName) -> &mut PassRecord {
        self.passes.entry(pass).or_default()
    }
}

// ---------------------------------------------------------------------------
// ActorRole
// ---------------------------------------------------------------------------

/// Roles recognized by the deletion approval queue's policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// May run pipelines and file proposals, but not decide them.
    Operator,
    /// May approve or reject deletion proposals.
    Admin,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActorRole::Operator => "operator",
            ActorRole::Admin => "admin",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ActorRole {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "operator" => Ok(ActorRole::Operator),
            "admin" => Ok(ActorRole::Admin),
            other => Err(DocflowError::validation(format!(
                "unknown role '{other}': expected 'operator' or 'admin'"
            ))),
        }
    }
}
