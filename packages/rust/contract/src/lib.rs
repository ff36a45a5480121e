//! Contract validation between passes.
//!
//! Given a pass name and its recorded artifact references, the validator
//! checks that the declared outputs exist, still hash to what the manifest
//! recorded, and parse against the pass's structural schema. For the chunk
//! pass it additionally compares per-source counts against the baseline:
//! deviation beyond the tolerance is reported as **drift** — a signal for
//! the reconciliation engine, distinct from a hard violation.
//!
//! The validator never mutates the manifest; it only returns a verdict.
//! The orchestrator calls it twice per boundary: at pass completion and
//! again at gate time, so external tampering between passes is caught.

pub mod schema;

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;

use docflow_shared::{ArtifactRef, PassName, trace};

use schema::{BundleIndex, ChunkSet, EmbeddingSet, GraphDoc, OutlineDoc, SourceSet};

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Per-source count deviation beyond the tolerance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub source_id: String,
    /// Baseline expected count.
    pub expected: u64,
    /// Count actually recorded in the artifact.
    pub actual: u64,
}

/// Result of validating one pass's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Artifacts exist, hash clean, and conform to the schema.
    Ok,
    /// Structurally valid, but counts deviate from baseline beyond
    /// tolerance. Routed to reconciliation, not a failure.
    Drift(Vec<DriftReport>),
    /// Hard contract violation: missing/unreadable artifact, hash
    /// mismatch, or schema nonconformance.
    Violation(String),
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ok)
    }
}

/// Inputs the validator needs beyond the artifact refs themselves.
#[derive(Debug)]
pub struct ValidationContext<'a> {
    /// Job directory artifact paths are relative to.
    pub job_dir: &'a Path,
    /// Relative count-drift tolerance (e.g., 0.05).
    pub drift_tolerance: f64,
    /// Active baseline per source id, for count checks.
    pub baselines: &'a BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Declared outputs
// ---------------------------------------------------------------------------

/// The artifact names a pass must produce, per its contract.
pub fn declared_outputs(pass: PassName) -> &'static [&'static str] {
    match pass {
        PassName::Intake => &["source_set"],
        PassName::Outline => &["outline"],
        PassName::Chunk => &["chunk_set"],
        PassName::Embed => &["embeddings"],
        PassName::Graph => &["graph"],
        PassName::Publish => &["bundle"],
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a pass's recorded artifacts. Read-only; returns a verdict.
pub fn validate(pass: PassName, artifacts: &[ArtifactRef], ctx: &ValidationContext) -> Verdict {
    for name in declared_outputs(pass) {
        let Some(artifact) = artifacts.iter().find(|a| a.name == *name) else {
            return Verdict::Violation(format!(
                "pass '{pass}' did not record required artifact '{name}'"
            ));
        };

        let bytes = match read_artifact(ctx.job_dir, artifact) {
            Ok(bytes) => bytes,
            Err(reason) => return Verdict::Violation(reason),
        };

        let actual_hash = trace::content_hash(&bytes);
        if actual_hash != artifact.content_hash {
            return Verdict::Violation(format!(
                "artifact '{}' content hash mismatch: recorded {}, found {actual_hash}",
                artifact.name, artifact.content_hash
            ));
        }

        if let Err(reason) = check_schema(pass, artifact, &bytes, ctx) {
            return Verdict::Violation(reason);
        }
    }

    // Count check only applies to the chunk pass, which carries a baseline.
    if pass == PassName::Chunk {
        return check_chunk_counts(artifacts, ctx);
    }

    debug!(%pass, "contract validation ok");
    Verdict::Ok
}

fn read_artifact(job_dir: &Path, artifact: &ArtifactRef) -> Result<Vec<u8>, String> {
    let path = job_dir.join(&artifact.path);
    std::fs::read(&path).map_err(|e| {
        format!(
            "artifact '{}' is not readable at {}: {e}",
            artifact.name,
            path.display()
        )
    })
}

fn parse<T: DeserializeOwned>(artifact: &ArtifactRef, bytes: &[u8]) -> Result<T, String> {
    serde_json::from_slice(bytes)
        .map_err(|e| format!("artifact '{}' failed schema check: {e}", artifact.name))
}

/// Structural checks beyond plain deserialization.
fn check_schema(
    pass: PassName,
    artifact: &ArtifactRef,
    bytes: &[u8],
    ctx: &ValidationContext,
) -> Result<(), String> {
    match pass {
        PassName::Intake => {
            let set: SourceSet = parse(artifact, bytes)?;
            if set.sources.is_empty() {
                return Err("source_set lists no sources".into());
            }
            // Canonical text files must exist and still match their
            // recorded fingerprints.
            for source in &set.sources {
                let path = ctx.job_dir.join(&source.canonical_path);
                let text = std::fs::read(&path).map_err(|e| {
                    format!(
                        "canonical text for source '{}' unreadable at {}: {e}",
                        source.id,
                        path.display()
                    )
                })?;
                let fingerprint = trace::fingerprint_bytes(&text);
                if fingerprint != source.fingerprint {
                    return Err(format!(
                        "source '{}' fingerprint mismatch: recorded {}, found {fingerprint}",
                        source.id, source.fingerprint
                    ));
                }
            }
            Ok(())
        }
        PassName::Outline => {
            let outline: OutlineDoc = parse(artifact, bytes)?;
            for source in &outline.sources {
                if source.expected_chunks == 0 {
                    return Err(format!(
                        "outline for source '{}' expects zero chunks",
                        source.source_id
                    ));
                }
            }
            Ok(())
        }
        PassName::Chunk => {
            let set: ChunkSet = parse(artifact, bytes)?;
            for source in &set.sources {
                if source.chunk_count != source.chunks.len() as u64 {
                    return Err(format!(
                        "chunk_set for source '{}' declares {} chunks but lists {}",
                        source.source_id,
                        source.chunk_count,
                        source.chunks.len()
                    ));
                }
            }
            Ok(())
        }
        PassName::Embed => {
            let set: EmbeddingSet = parse(artifact, bytes)?;
            if set.dim == 0 {
                return Err("embeddings declare dimension zero".into());
            }
            for chunk in &set.chunks {
                if chunk.vector.len() as u32 != set.dim {
                    return Err(format!(
                        "embedding for chunk '{}' has {} dims, expected {}",
                        chunk.chunk_hash,
                        chunk.vector.len(),
                        set.dim
                    ));
                }
            }
            Ok(())
        }
        PassName::Graph => {
            let graph: GraphDoc = parse(artifact, bytes)?;
            for edge in &graph.edges {
                if !graph.nodes.contains(&edge.from) || !graph.nodes.contains(&edge.to) {
                    return Err(format!(
                        "graph edge {} -> {} references an unknown node",
                        edge.from, edge.to
                    ));
                }
            }
            Ok(())
        }
        PassName::Publish => {
            let index: BundleIndex = parse(artifact, bytes)?;
            let listed: u64 = index.sources.iter().map(|s| s.chunk_count).sum();
            if listed != index.chunk_count {
                return Err(format!(
                    "bundle index chunk_count {} disagrees with per-source sum {listed}",
                    index.chunk_count
                ));
            }
            Ok(())
        }
    }
}

/// Compare chunk_set counts against baselines under the tolerance policy.
///
/// Tolerance policy: relative deviation `|actual - expected| / expected`
/// strictly above `drift_tolerance` is drift; at or below it, the
/// deviation is logged and accepted. A source without a baseline is a
/// hard violation — the outline pass must have established one.
fn check_chunk_counts(artifacts: &[ArtifactRef], ctx: &ValidationContext) -> Verdict {
    // declared_outputs guarantees the artifact exists by this point.
    let Some(artifact) = artifacts.iter().find(|a| a.name == "chunk_set") else {
        return Verdict::Violation("chunk_set artifact missing".into());
    };
    let bytes = match read_artifact(ctx.job_dir, artifact) {
        Ok(bytes) => bytes,
        Err(reason) => return Verdict::Violation(reason),
    };
    let set: ChunkSet = match parse(artifact, &bytes) {
        Ok(set) => set,
        Err(reason) => return Verdict::Violation(reason),
    };

    let mut reports = Vec::new();
    for source in &set.sources {
        let Some(&expected) = ctx.baselines.get(&source.source_id) else {
            return Verdict::Violation(format!(
                "no baseline established for source '{}'",
                source.source_id
            ));
        };
        let actual = source.chunk_count;

        let drifted = if expected == 0 {
            actual > 0
        } else {
            let deviation = (actual as f64 - expected as f64).abs() / expected as f64;
            deviation > ctx.drift_tolerance
        };

        if drifted {
            reports.push(DriftReport {
                source_id: source.source_id.clone(),
                expected,
                actual,
            });
        } else if actual != expected {
            debug!(
                source_id = %source.source_id,
                expected,
                actual,
                "count deviation within tolerance"
            );
        }
    }

    if reports.is_empty() {
        Verdict::Ok
    } else {
        Verdict::Drift(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{ChunkEntry, SourceChunks, SourceEntry};

    fn write_artifact(job_dir: &Path, name: &str, payload: &impl serde::Serialize) -> ArtifactRef {
        let rel = format!("artifacts/{name}.v1.json");
        let path = job_dir.join(&rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        let bytes = serde_json::to_vec_pretty(payload).expect("serialize");
        std::fs::write(&path, &bytes).expect("write");
        ArtifactRef {
            name: name.into(),
            version: 1,
            path: rel,
            content_hash: trace::content_hash(&bytes),
        }
    }

    fn chunk_set(counts: &[(&str, u64)]) -> ChunkSet {
        ChunkSet {
            sources: counts
                .iter()
                .map(|(id, n)| SourceChunks {
                    source_id: (*id).into(),
                    chunk_count: *n,
                    chunks: (0..*n)
                        .map(|i| ChunkEntry {
                            hash: format!("sha256:{id}-{i}"),
                            seq: i,
                            heading: "Body".into(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn missing_artifact_is_violation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let baselines = BTreeMap::new();
        let ctx = ValidationContext {
            job_dir: dir.path(),
            drift_tolerance: 0.05,
            baselines: &baselines,
        };
        let verdict = validate(PassName::Outline, &[], &ctx);
        assert!(matches!(verdict, Verdict::Violation(ref r) if r.contains("outline")));
    }

    #[test]
    fn tampered_artifact_is_violation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let set = chunk_set(&[("guide", 3)]);
        let artifact = write_artifact(dir.path(), "chunk_set", &set);

        // External edit after the hash was recorded.
        let path = dir.path().join(&artifact.path);
        let mut bytes = std::fs::read(&path).expect("read");
        bytes.push(b' ');
        std::fs::write(&path, bytes).expect("write");

        let baselines = BTreeMap::from([("guide".to_string(), 3u64)]);
        let ctx = ValidationContext {
            job_dir: dir.path(),
            drift_tolerance: 0.05,
            baselines: &baselines,
        };
        let verdict = validate(PassName::Chunk, &[artifact], &ctx);
        assert!(matches!(verdict, Verdict::Violation(ref r) if r.contains("hash mismatch")));
    }

    #[test]
    fn count_within_tolerance_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        // 98 vs expected 100 is a 2% deviation, under the 5% tolerance.
        let artifact = write_artifact(dir.path(), "chunk_set", &chunk_set(&[("guide", 98)]));
        let baselines = BTreeMap::from([("guide".to_string(), 100u64)]);
        let ctx = ValidationContext {
            job_dir: dir.path(),
            drift_tolerance: 0.05,
            baselines: &baselines,
        };
        assert_eq!(validate(PassName::Chunk, &[artifact], &ctx), Verdict::Ok);
    }

    #[test]
    fn excess_deviation_is_drift_not_violation() {
        let dir = tempfile::tempdir().expect("tempdir");
        // 115 vs expected 120 is ~4.2%... use tolerance 0.02 to force drift.
        let artifact = write_artifact(dir.path(), "chunk_set", &chunk_set(&[("guide", 115)]));
        let baselines = BTreeMap::from([("guide".to_string(), 120u64)]);
        let ctx = ValidationContext {
            job_dir: dir.path(),
            drift_tolerance: 0.02,
            baselines: &baselines,
        };
        match validate(PassName::Chunk, &[artifact], &ctx) {
            Verdict::Drift(reports) => {
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].expected, 120);
                assert_eq!(reports[0].actual, 115);
            }
            other => panic!("expected drift, got {other:?}"),
        }
    }

    #[test]
    fn missing_baseline_is_violation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = write_artifact(dir.path(), "chunk_set", &chunk_set(&[("guide", 3)]));
        let baselines = BTreeMap::new();
        let ctx = ValidationContext {
            job_dir: dir.path(),
            drift_tolerance: 0.05,
            baselines: &baselines,
        };
        let verdict = validate(PassName::Chunk, &[artifact], &ctx);
        assert!(matches!(verdict, Verdict::Violation(ref r) if r.contains("no baseline")));
    }

    #[test]
    fn chunk_count_list_mismatch_is_violation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut set = chunk_set(&[("guide", 3)]);
        set.sources[0].chunk_count = 5; // lies about its own list
        let artifact = write_artifact(dir.path(), "chunk_set", &set);
        let baselines = BTreeMap::from([("guide".to_string(), 5u64)]);
        let ctx = ValidationContext {
            job_dir: dir.path(),
            drift_tolerance: 0.05,
            baselines: &baselines,
        };
        let verdict = validate(PassName::Chunk, &[artifact], &ctx);
        assert!(matches!(verdict, Verdict::Violation(ref r) if r.contains("declares 5")));
    }

    #[test]
    fn intake_verifies_canonical_fingerprints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let text = "# Guide\n\nHello.\n";
        let canonical_rel = "artifacts/sources/guide.txt";
        let canonical_path = dir.path().join(canonical_rel);
        std::fs::create_dir_all(canonical_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&canonical_path, text).expect("write");

        let set = SourceSet {
            sources: vec![SourceEntry {
                id: "guide".into(),
                rel_path: "guide.md".into(),
                fingerprint: trace::fingerprint(text),
                canonical_path: canonical_rel.into(),
                bytes: text.len() as u64,
            }],
        };
        let artifact = write_artifact(dir.path(), "source_set", &set);
        let baselines = BTreeMap::new();
        let ctx = ValidationContext {
            job_dir: dir.path(),
            drift_tolerance: 0.05,
            baselines: &baselines,
        };
        assert_eq!(
            validate(PassName::Intake, std::slice::from_ref(&artifact), &ctx),
            Verdict::Ok
        );

        // Tamper with the canonical text: fingerprint check must fire.
        std::fs::write(&canonical_path, "# Guide\n\nGoodbye.\n").expect("write");
        let verdict = validate(PassName::Intake, &[artifact], &ctx);
        assert!(matches!(verdict, Verdict::Violation(ref r) if r.contains("fingerprint mismatch")));
    }
}
