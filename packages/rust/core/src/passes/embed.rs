//! Embed pass: deterministic per-chunk vectors.
//!
//! Vectors are derived from the chunk hash alone, so the same chunk always
//! embeds to the same vector with no model or network in the loop.

use sha2::{Digest, Sha256};
use tracing::instrument;

use docflow_contract::schema::{ChunkSet, ChunkVector, EmbeddingSet};
use docflow_shared::{PassName, Result};

use super::{PassContext, PassHandler, PassOutput, read_input, write_artifact};

/// Fixed embedding dimensionality.
pub const EMBEDDING_DIM: u32 = 16;

pub struct EmbedHandler;

impl PassHandler for EmbedHandler {
    fn name(&self) -> PassName {
        PassName::Embed
    }

    #[instrument(skip_all)]
    fn run(&self, ctx: &PassContext) -> Result<PassOutput> {
        let chunk_set: ChunkSet =
            read_input(ctx.job_dir, ctx.inputs, PassName::Chunk, "chunk_set")?;

        let mut chunks = Vec::new();
        for source in &chunk_set.sources {
            for entry in &source.chunks {
                chunks.push(ChunkVector {
                    chunk_hash: entry.hash.clone(),
                    vector: derive_vector(&entry.hash),
                });
            }
        }

        let records_out = chunks.len() as u64;
        let set = EmbeddingSet {
            dim: EMBEDDING_DIM,
            chunks,
        };
        let artifact = write_artifact(ctx.job_dir, "embeddings", ctx.version, &set)?;

        Ok(PassOutput {
            artifacts: vec![artifact],
            records: Vec::new(),
            records_out,
        })
    }
}

/// Map a chunk hash to a unit-range vector of [`EMBEDDING_DIM`] components.
fn derive_vector(chunk_hash: &str) -> Vec<f32> {
    let mut hasher = Sha256::new();
    hasher.update(chunk_hash.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(EMBEDDING_DIM as usize)
        .map(|b| f32::from(*b) / 255.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_are_deterministic_and_sized() {
        let a = derive_vector("sha256:abc");
        let b = derive_vector("sha256:abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM as usize);
        assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_ne!(a, derive_vector("sha256:abd"));
    }
}
