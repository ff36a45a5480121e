//! Graph pass: link chunks into a cross-reference graph.
//!
//! Two edge kinds: `sequence` between adjacent chunks of one source, and
//! `topic` between chunks of *different* sources that share a section
//! heading. Node and edge order is fully determined by the chunk set, so
//! the artifact is rerun-stable.

use std::collections::BTreeMap;

use tracing::instrument;

use docflow_contract::schema::{ChunkSet, GraphDoc, GraphEdge};
use docflow_shared::{PassName, Result};

use super::{PassContext, PassHandler, PassOutput, read_input, write_artifact};

pub struct GraphHandler;

impl PassHandler for GraphHandler {
    fn name(&self) -> PassName {
        PassName::Graph
    }

    #[instrument(skip_all)]
    fn run(&self, ctx: &PassContext) -> Result<PassOutput> {
        let chunk_set: ChunkSet =
            read_input(ctx.job_dir, ctx.inputs, PassName::Chunk, "chunk_set")?;

        let graph = build_graph(&chunk_set);
        let records_out = graph.edges.len() as u64;
        let artifact = write_artifact(ctx.job_dir, "graph", ctx.version, &graph)?;

        Ok(PassOutput {
            artifacts: vec![artifact],
            records: Vec::new(),
            records_out,
        })
    }
}

fn build_graph(chunk_set: &ChunkSet) -> GraphDoc {
    let mut nodes: Vec<String> = chunk_set
        .sources
        .iter()
        .flat_map(|s| s.chunks.iter().map(|c| c.hash.clone()))
        .collect();
    nodes.sort();
    nodes.dedup();

    let mut edges = Vec::new();

    // Adjacent chunks within each source.
    for source in &chunk_set.sources {
        for pair in source.chunks.windows(2) {
            edges.push(GraphEdge {
                from: pair[0].hash.clone(),
                to: pair[1].hash.clone(),
                kind: "sequence".into(),
            });
        }
    }

    // Chunks under the same heading across sources: chain them in sorted
    // hash order rather than forming a clique.
    let mut by_heading: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
    for source in &chunk_set.sources {
        for chunk in &source.chunks {
            by_heading
                .entry(chunk.heading.as_str())
                .or_default()
                .push((source.source_id.as_str(), chunk.hash.as_str()));
        }
    }
    for members in by_heading.values_mut() {
        let multi_source = members
            .iter()
            .any(|(source, _)| *source != members[0].0);
        if !multi_source {
            continue;
        }
        members.sort_by_key(|(_, hash)| *hash);
        for pair in members.windows(2) {
            if pair[0].0 == pair[1].0 {
                continue;
            }
            edges.push(GraphEdge {
                from: pair[0].1.to_string(),
                to: pair[1].1.to_string(),
                kind: "topic".into(),
            });
        }
    }

    GraphDoc { nodes, edges }
}
