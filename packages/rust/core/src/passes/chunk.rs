//! Chunk pass: split canonical text into retrieval chunks.
//!
//! The splitter here is the single definition of chunking for the whole
//! system: the outline pass calls it to predict expected counts, and the
//! reconciliation engine calls it to recompute the authoritative set. Any
//! divergence between those callers would manufacture phantom drift.

use tracing::instrument;

use docflow_contract::schema::{ChunkEntry, ChunkSet, SourceChunks, SourceSet};
use docflow_shared::{DocflowError, PassName, Result, trace};

use super::{DerivedChunk, PassContext, PassHandler, PassOutput, read_input, write_artifact};

/// One split piece of a source, tagged with its section heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub heading: String,
    pub text: String,
}

/// Deterministically split canonical text into chunks of at most roughly
/// `max_bytes`. Paragraphs are the unit: they accumulate until the budget
/// is reached, and a heading always starts a fresh chunk.
pub fn split_source(text: &str, max_bytes: usize) -> Vec<ChunkPiece> {
    let mut pieces = Vec::new();
    let mut heading = String::from("Body");
    let mut current = String::new();

    fn flush(heading: &str, current: &mut String, pieces: &mut Vec<ChunkPiece>) {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            pieces.push(ChunkPiece {
                heading: heading.to_string(),
                text: trimmed.to_string(),
            });
        }
        current.clear();
    }

    for block in text.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        if let Some(title) = heading_title(block.lines().next().unwrap_or_default()) {
            flush(&heading, &mut current, &mut pieces);
            heading = title;
        }
        if !current.is_empty() && current.len() + block.len() + 2 > max_bytes {
            flush(&heading, &mut current, &mut pieces);
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(block);
        if current.len() >= max_bytes {
            flush(&heading, &mut current, &mut pieces);
        }
    }
    flush(&heading, &mut current, &mut pieces);
    pieces
}

/// Title of an ATX heading line, if it is one.
fn heading_title(line: &str) -> Option<String> {
    let hashes = line.len() - line.trim_start_matches('#').len();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    let title = rest.strip_prefix(' ')?.trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// Identity hash of one chunk: raw sha256 over source id and chunk text.
/// Chunk identity is content, not position; a reordered but unchanged
/// chunk keeps its hash.
pub fn chunk_hash(source_id: &str, text: &str) -> String {
    let mut keyed = Vec::with_capacity(source_id.len() + text.len() + 1);
    keyed.extend_from_slice(source_id.as_bytes());
    keyed.push(0);
    keyed.extend_from_slice(text.as_bytes());
    trace::content_hash(&keyed)
}

pub struct ChunkHandler;

impl PassHandler for ChunkHandler {
    fn name(&self) -> PassName {
        PassName::Chunk
    }

    #[instrument(skip_all)]
    fn run(&self, ctx: &PassContext) -> Result<PassOutput> {
        let source_set: SourceSet =
            read_input(ctx.job_dir, ctx.inputs, PassName::Intake, "source_set")?;

        let mut sources = Vec::new();
        let mut records = Vec::new();
        for source in &source_set.sources {
            let path = ctx.job_dir.join(&source.canonical_path);
            let text = std::fs::read_to_string(&path).map_err(|e| DocflowError::io(&path, e))?;

            let pieces = split_source(&text, ctx.settings.max_chunk_bytes);
            let mut chunks = Vec::with_capacity(pieces.len());
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

        let records_out = records.len() as u64;
        let set = ChunkSet { sources };
        let artifact = write_artifact(ctx.job_dir, "chunk_set", ctx.version, &set)?;

        Ok(PassOutput {
            artifacts: vec![artifact],
            records,
            records_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Intro\n\nFirst paragraph.\n\nSecond paragraph.\n\n# Usage\n\nRun it.\n";

    #[test]
    fn headings_start_fresh_chunks() {
        let pieces = split_source(DOC, 10_000);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].heading, "Intro");
        assert!(pieces[0].text.contains("Second paragraph."));
        assert_eq!(pieces[1].heading, "Usage");
    }

    #[test]
    fn budget_splits_within_a_section() {
        let long = format!("# One\n\n{}\n\n{}\n\n{}\n", "a".repeat(40), "b".repeat(40), "c".repeat(40));
        let pieces = split_source(&long, 60);
        assert!(pieces.len() >= 2);
        assert!(pieces.iter().all(|p| p.heading == "One"));
    }

    #[test]
    fn splitting_is_deterministic() {
        assert_eq!(split_source(DOC, 80), split_source(DOC, 80));
    }

    #[test]
    fn preamble_before_first_heading_keeps_default_heading() {
        let pieces = split_source("Just text, no headings.\n", 100);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].heading, "Body");
    }

    #[test]
    fn hash_depends_on_source_and_text() {
        let a = chunk_hash("s1", "same text");
        assert_eq!(a, chunk_hash("s1", "same text"));
        assert_ne!(a, chunk_hash("s2", "same text"));
        assert_ne!(a, chunk_hash("s1", "other text"));
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn non_heading_lines_are_not_titles() {
        assert_eq!(heading_title("####### too deep"), None);
        assert_eq!(heading_title("#nospace"), None);
        assert_eq!(heading_title("plain"), None);
        assert_eq!(heading_title("## Usage "), Some("Usage".into()));
    }
}
