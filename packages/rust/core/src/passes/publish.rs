//! Publish pass: assemble the final bundle directory.
//!
//! Layout under the job directory:
//!
//! ```text
//! bundle/
//! ├── index.json     bundle artifact (environment, per-source summary)
//! └── docs/          canonical text, one file per source
//! ```

use tracing::instrument;

use docflow_contract::schema::{BundleIndex, BundleSource, ChunkSet, EmbeddingSet, GraphDoc, SourceSet};
use docflow_shared::{DocflowError, PassName, Result};

use super::{PassContext, PassHandler, PassOutput, read_input, write_artifact_at};

pub struct PublishHandler;

impl PassHandler for PublishHandler {
    fn name(&self) -> PassName {
        PassName::Publish
    }

    #[instrument(skip_all)]
    fn run(&self, ctx: &PassContext) -> Result<PassOutput> {
        let source_set: SourceSet =
            read_input(ctx.job_dir, ctx.inputs, PassName::Intake, "source_set")?;
        let chunk_set: ChunkSet =
            read_input(ctx.job_dir, ctx.inputs, PassName::Chunk, "chunk_set")?;
        let embeddings: EmbeddingSet =
            read_input(ctx.job_dir, ctx.inputs, PassName::Embed, "embeddings")?;
        let graph: GraphDoc = read_input(ctx.job_dir, ctx.inputs, PassName::Graph, "graph")?;

        let docs_dir = ctx.job_dir.join("bundle").join("docs");
        std::fs::create_dir_all(&docs_dir).map_err(|e| DocflowError::io(&docs_dir, e))?;

        let mut sources = Vec::new();
        for source in &source_set.sources {
            let from = ctx.job_dir.join(&source.canonical_path);
            let to = docs_dir.join(format!("{}.txt", source.id));
            std::fs::copy(&from, &to).map_err(|e| DocflowError::io(&to, e))?;

            let chunk_count = chunk_set
                .sources
                .iter()
                .find(|s| s.source_id == source.id)
                .map(|s| s.chunk_count)
                .unwrap_or(0);
            sources.push(BundleSource {
                id: source.id.clone(),
                fingerprint: source.fingerprint.clone(),
                chunk_count,
            });
        }

        let records_out = sources.len() as u64;
        let index = BundleIndex {
            environment: ctx.environment.into(),
            chunk_count: sources.iter().map(|s| s.chunk_count).sum(),
            edge_count: graph.edges.len() as u64,
            embedding_dim: embeddings.dim,
            sources,
        };
        let artifact =
            write_artifact_at(ctx.job_dir, "bundle", ctx.version, "bundle/index.json", &index)?;

        Ok(PassOutput {
            artifacts: vec![artifact],
            records: Vec::new(),
            records_out,
        })
    }
}
