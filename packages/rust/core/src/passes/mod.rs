//! Pass handler seam and the built-in handlers.
//!
//! Handlers are deterministic: same canonical inputs and settings produce
//! byte-identical artifacts, which is what makes gate-time re-hashing and
//! rerun comparison meaningful. Handlers never touch the manifest or the
//! database; they read predecessor artifacts and write their own files,
//! returning references plus any derived records for the orchestrator to
//! persist.

pub mod chunk;
pub mod embed;
pub mod graph;
pub mod intake;
pub mod outline;
pub mod publish;

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use docflow_shared::{ArtifactRef, CompiledPatterns, DocflowError, JobId, PassName, Result, trace};

// ---------------------------------------------------------------------------
// Handler seam
// ---------------------------------------------------------------------------

/// Pipeline knobs a handler may consult.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Target maximum chunk size in bytes of canonical text.
    pub max_chunk_bytes: usize,
    /// Source selection patterns for intake.
    pub patterns: CompiledPatterns,
}

/// Everything a handler sees for one invocation.
pub struct PassContext<'a> {
    pub job_id: &'a JobId,
    pub environment: &'a str,
    /// Job directory; artifact paths are relative to it.
    pub job_dir: &'a Path,
    /// Directory the intake pass scans for source documents.
    pub sources_root: &'a Path,
    /// Artifact version this invocation writes (bumped per rerun).
    pub version: u32,
    /// Validated artifacts of every pass that has succeeded so far.
    pub inputs: &'a BTreeMap<PassName, Vec<ArtifactRef>>,
    pub settings: &'a PipelineSettings,
}

/// A chunk derived by the chunk pass, destined for the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedChunk {
    pub source_id: String,
    pub seq: u64,
    pub content_hash: String,
    pub text: String,
}

/// What one handler invocation produced.
#[derive(Debug, Default)]
pub struct PassOutput {
    /// Artifact references to record on the pass, pending validation.
    pub artifacts: Vec<ArtifactRef>,
    /// Derived chunk records (chunk pass only).
    pub records: Vec<DerivedChunk>,
    /// Records emitted, for pass metrics.
    pub records_out: u64,
}

/// One pipeline pass. Implementations are pure with respect to the job
/// directory: filesystem in, filesystem out.
pub trait PassHandler: Send + Sync {
    fn name(&self) -> PassName;
    fn run(&self, ctx: &PassContext) -> Result<PassOutput>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handler lookup by pass name. `insert` replaces a built-in, which is how
/// tests inject failing or degraded handlers.
pub struct HandlerRegistry {
    handlers: BTreeMap<PassName, Box<dyn PassHandler>>,
}

impl HandlerRegistry {
    /// Registry with the six built-in handlers.
    pub fn default_handlers() -> Self {
        let mut registry = Self {
            handlers: BTreeMap::new(),
        };
        registry.insert(Box::new(intake::IntakeHandler));
        registry.insert(Box::new(outline::OutlineHandler));
        registry.insert(Box::new(chunk::ChunkHandler));
        registry.insert(Box::new(embed::EmbedHandler));
        registry.insert(Box::new(graph::GraphHandler));
        registry.insert(Box::new(publish::PublishHandler));
        registry
    }

    pub fn insert(&mut self, handler: Box<dyn PassHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, pass: PassName) -> Result<&dyn PassHandler> {
        self.handlers
            .get(&pass)
            .map(|h| h.as_ref())
            .ok_or_else(|| {
                DocflowError::validation(format!("no handler registered for pass '{pass}'"))
            })
    }
}

// ---------------------------------------------------------------------------
// Artifact I/O helpers
// ---------------------------------------------------------------------------

/// Serialize a payload to `artifacts/<name>.v<version>.json` and return its
/// reference with the raw content hash.
pub(crate) fn write_artifact<T: Serialize>(
    job_dir: &Path,
    name: &str,
    version: u32,
    payload: &T,
) -> Result<ArtifactRef> {
    let rel = format!("artifacts/{name}.v{version}.json");
    write_artifact_at(job_dir, name, version, &rel, payload)
}

/// Same as [`write_artifact`] but at an explicit relative path (the bundle
/// index lives inside the bundle directory).
pub(crate) fn write_artifact_at<T: Serialize>(
    job_dir: &Path,
    name: &str,
    version: u32,
    rel: &str,
    payload: &T,
) -> Result<ArtifactRef> {
    let path = job_dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DocflowError::io(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(payload)
        .map_err(|e| DocflowError::validation(format!("artifact '{name}' serialization: {e}")))?;
    std::fs::write(&path, &bytes).map_err(|e| DocflowError::io(&path, e))?;
    Ok(ArtifactRef {
        name: name.into(),
        version,
        path: rel.into(),
        content_hash: trace::content_hash(&bytes),
    })
}

/// Read and parse a predecessor's artifact payload by pass and name.
pub(crate) fn read_input<T: DeserializeOwned>(
    job_dir: &Path,
    inputs: &BTreeMap<PassName, Vec<ArtifactRef>>,
    pass: PassName,
    name: &str,
) -> Result<T> {
    let artifact = inputs
        .get(&pass)
        .and_then(|refs| refs.iter().find(|a| a.name == name))
        .ok_or_else(|| {
            DocflowError::validation(format!("missing input artifact '{name}' from pass '{pass}'"))
        })?;
    let path = job_dir.join(&artifact.path);
    let bytes = std::fs::read(&path).map_err(|e| DocflowError::io(&path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        DocflowError::validation(format!("input artifact '{name}' failed to parse: {e}"))
    })
}
