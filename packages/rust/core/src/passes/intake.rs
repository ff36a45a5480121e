//! Intake pass: scan, canonicalize, and fingerprint source documents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use docflow_contract::schema::{SourceEntry, SourceSet};
use docflow_shared::{DocflowError, PassName, Result, trace};

use super::{PassContext, PassHandler, PassOutput, write_artifact};

/// File extensions considered source documents.
const SOURCE_EXTENSIONS: [&str; 2] = ["md", "txt"];

pub struct IntakeHandler;

impl PassHandler for IntakeHandler {
    fn name(&self) -> PassName {
        PassName::Intake
    }

    #[instrument(skip_all)]
    fn run(&self, ctx: &PassContext) -> Result<PassOutput> {
        let mut rel_paths = Vec::new();
        collect_sources(ctx.sources_root, ctx.sources_root, &mut rel_paths)?;
        rel_paths.sort();

        let mut sources = Vec::new();
        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        for rel in rel_paths {
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if !ctx.settings.patterns.matches(&rel_str) {
                debug!(path = %rel_str, "source excluded by pattern");
                continue;
            }

            let abs = ctx.sources_root.join(&rel);
            let raw = std::fs::read(&abs).map_err(|e| DocflowError::io(&abs, e))?;
            let text = String::from_utf8_lossy(&raw);
            let canonical = trace::canonicalize(&text);
            if canonical.is_empty() {
                warn!(path = %rel_str, "source has no content, skipping");
                continue;
            }

            let id = slugify(&rel_str);
            // Ids name the canonical files; two sources sharing one would
            // silently overwrite each other.
            if let Some(other) = seen.insert(id.clone(), rel_str.clone()) {
                return Err(DocflowError::pass_failed(
                    "intake",
                    format!("sources '{other}' and '{rel_str}' collide on id '{id}'"),
                ));
            }
            let canonical_rel = format!("artifacts/sources/{id}.txt");
            let canonical_path = ctx.job_dir.join(&canonical_rel);
            if let Some(parent) = canonical_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DocflowError::io(parent, e))?;
            }
            std::fs::write(&canonical_path, &canonical)
                .map_err(|e| DocflowError::io(&canonical_path, e))?;

            sources.push(SourceEntry {
                id,
                rel_path: rel_str,
                fingerprint: trace::fingerprint(&canonical),
                canonical_path: canonical_rel,
                bytes: canonical.len() as u64,
            });
        }

        if sources.is_empty() {
            return Err(DocflowError::pass_failed(
                "intake",
                format!(
                    "no source documents found under {}",
                    ctx.sources_root.display()
                ),
            ));
        }

        let records_out = sources.len() as u64;
        let set = SourceSet { sources };
        let artifact = write_artifact(ctx.job_dir, "source_set", ctx.version, &set)?;

        Ok(PassOutput {
            artifacts: vec![artifact],
            records: Vec::new(),
            records_out,
        })
    }
}

fn collect_sources(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| DocflowError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DocflowError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_sources(root, &path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            && let Ok(rel) = path.strip_prefix(root)
        {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

/// Stable slug from a relative source path: lowercase alphanumerics, runs
/// of anything else collapse to single hyphens, extension dropped.
pub fn slugify(rel_path: &str) -> String {
    let stem = rel_path
        .rsplit_once('.')
        .map(|(stem, _ext)| stem)
        .unwrap_or(rel_path);

    let mut slug = String::with_capacity(stem.len());
    let mut last_hyphen = true;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() { "source".into() } else { slug }
}
