//! Structural schemas for pass output artifacts.
//!
//! These are the wire shapes passes exchange: identifiers and hashes, never
//! live in-process objects, so a job survives process restarts. Artifact
//! payloads carry no wall-clock timestamps — identical inputs must produce
//! byte-identical outputs.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// source_set (intake)
// ---------------------------------------------------------------------------

/// One ingested source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Stable slug derived from the source's relative path.
    pub id: String,
    /// Path of the original file, relative to the sources root.
    pub rel_path: String,
    /// Traceability fingerprint of the canonical text (`tp1:<hex>`).
    pub fingerprint: String,
    /// Canonical text file, relative to the job directory.
    pub canonical_path: String,
    /// Canonical text length in bytes.
    pub bytes: u64,
}

/// Payload of the `source_set` artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSet {
    pub sources: Vec<SourceEntry>,
}

// ---------------------------------------------------------------------------
// outline
// ---------------------------------------------------------------------------

/// One section heading discovered in a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    /// Heading depth (1 = top level).
    pub depth: u8,
    /// Bytes of canonical text under this section.
    pub bytes: u64,
}

/// Outline of one source plus its authoritative expected chunk count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutline {
    pub source_id: String,
    pub sections: Vec<Section>,
    /// Baseline: the chunk count the chunk pass is expected to produce.
    pub expected_chunks: u64,
}

/// Payload of the `outline` artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineDoc {
    pub sources: Vec<SourceOutline>,
}

// ---------------------------------------------------------------------------
// chunk_set
// ---------------------------------------------------------------------------

/// One chunk's identity within the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// `sha256:<hex>` over source id + chunk text.
    pub hash: String,
    /// Position within the source.
    pub seq: u64,
    /// Section heading the chunk falls under.
    pub heading: String,
}

/// Chunks derived from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChunks {
    pub source_id: String,
    pub chunk_count: u64,
    pub chunks: Vec<ChunkEntry>,
}

/// Payload of the `chunk_set` artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSet {
    pub sources: Vec<SourceChunks>,
}

// ---------------------------------------------------------------------------
// embeddings
// ---------------------------------------------------------------------------

/// Embedding vector for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkVector {
    pub chunk_hash: String,
    pub vector: Vec<f32>,
}

/// Payload of the `embeddings` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSet {
    /// Dimension every vector must have.
    pub dim: u32,
    pub chunks: Vec<ChunkVector>,
}

// ---------------------------------------------------------------------------
// graph
// ---------------------------------------------------------------------------

/// Directed edge between two chunk nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    /// `sequence` (adjacent in one source) or `topic` (shared heading).
    pub kind: String,
}

/// Payload of the `graph` artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDoc {
    /// Chunk hashes, sorted for determinism.
    pub nodes: Vec<String>,
    pub edges: Vec<GraphEdge>,
}

// ---------------------------------------------------------------------------
// bundle
// ---------------------------------------------------------------------------

/// Per-source summary inside the bundle index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSource {
    pub id: String,
    pub fingerprint: String,
    pub chunk_count: u64,
}

/// Payload of the `bundle` artifact (`bundle/index.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleIndex {
    pub environment: String,
    pub sources: Vec<BundleSource>,
    pub chunk_count: u64,
    pub edge_count: u64,
    pub embedding_dim: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_set_roundtrip() {
        let set = ChunkSet {
            sources: vec![SourceChunks {
                source_id: "guide".into(),
                chunk_count: 2,
                chunks: vec![
                    ChunkEntry {
                        hash: "sha256:a".into(),
                        seq: 0,
                        heading: "Intro".into(),
                    },
                    ChunkEntry {
                        hash: "sha256:b".into(),
                        seq: 1,
                        heading: "Usage".into(),
                    },
                ],
            }],
        };
        let json = serde_json::to_string_pretty(&set).expect("serialize");
        let parsed: ChunkSet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, set);
    }

    #[test]
    fn unknown_fields_are_rejected_nowhere_but_shape_must_match() {
        // A payload missing a required field fails to parse.
        let bad = r#"{ "sources": [ { "source_id": "guide" } ] }"#;
        assert!(serde_json::from_str::<OutlineDoc>(bad).is_err());
    }
}
