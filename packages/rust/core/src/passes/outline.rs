//! Outline pass: derive section structure and the expected chunk count.
//!
//! The expected counts written here are authoritative: the orchestrator
//! turns them into baselines, and the chunk contract judges drift against
//! them. Prediction uses the same splitter the chunk pass runs, so a clean
//! pipeline produces zero deviation.

use tracing::instrument;

use docflow_contract::schema::{OutlineDoc, Section, SourceOutline, SourceSet};
use docflow_shared::{DocflowError, PassName, Result};

use super::chunk::split_source;
use super::{PassContext, PassHandler, PassOutput, read_input, write_artifact};

pub struct OutlineHandler;

impl PassHandler for OutlineHandler {
    fn name(&self) -> PassName {
        PassName::Outline
    }

    #[instrument(skip_all)]
    fn run(&self, ctx: &PassContext) -> Result<PassOutput> {
        let source_set: SourceSet =
            read_input(ctx.job_dir, ctx.inputs, PassName::Intake, "source_set")?;

        let mut outlines = Vec::new();
        for source in &source_set.sources {
            let path = ctx.job_dir.join(&source.canonical_path);
            let text = std::fs::read_to_string(&path).map_err(|e| DocflowError::io(&path, e))?;

            let sections = scan_sections(&text);
            let expected_chunks = split_source(&text, ctx.settings.max_chunk_bytes).len() as u64;
            if expected_chunks == 0 {
                // Intake drops empty sources, so canonical text is nonempty.
                return Err(DocflowError::pass_failed(
                    "outline",
                    format!("source '{}' produced no chunks", source.id),
                ));
            }

            outlines.push(SourceOutline {
                source_id: source.id.clone(),
                sections,
                expected_chunks,
            });
        }

        let records_out = outlines.len() as u64;
        let doc = OutlineDoc { sources: outlines };
        let artifact = write_artifact(ctx.job_dir, "outline", ctx.version, &doc)?;

        Ok(PassOutput {
            artifacts: vec![artifact],
            records: Vec::new(),
            records_out,
        })
    }
}

/// Scan ATX headings into a flat section list with per-section byte sizes.
/// Text before the first heading is attributed to an implicit `Body`
/// section at depth 1.
fn scan_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();

    for line in text.lines() {
        let hashes = line.len() - line.trim_start_matches('#').len();
        let title = if (1..=6).contains(&hashes) {
            line[hashes..].strip_prefix(' ').map(str::trim)
        } else {
            None
        };

        match title {
            Some(title) if !title.is_empty() => {
                sections.push(Section {
                    title: title.to_string(),
                    depth: hashes as u8,
                    bytes: 0,
                });
            }
            _ => {
                if sections.is_empty() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    sections.push(Section {
                        title: "Body".into(),
                        depth: 1,
                        bytes: 0,
                    });
                }
                if let Some(last) = sections.last_mut() {
                    last.bytes += line.len() as u64 + 1;
                }
            }
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_carry_depth_and_bytes() {
        let sections = scan_sections("# Top\n\nabc\n\n## Nested\n\nde\n");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Top");
        assert_eq!(sections[0].depth, 1);
        assert!(sections[0].bytes > 0);
        assert_eq!(sections[1].title, "Nested");
        assert_eq!(sections[1].depth, 2);
    }

    #[test]
    fn preamble_becomes_implicit_body_section() {
        let sections = scan_sections("no headings here\n");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Body");
    }
}
