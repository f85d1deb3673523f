//! The node and pipe graph of one run.
//!
//! Building the graph creates every pipe up front, so no process is ever
//! launched against a pipe that does not exist yet. Nodes are started in
//! topological order (writers before readers) and stopped in reverse.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::concat::{ManifestNames, PeriodDir};
use crate::config::{BitrateConfig, Input, InputConfig, InputType, MediaType, PipelineConfig};
use crate::error::{Error, Result};
use crate::node::packager::PackagerStream;
use crate::node::period_concat::PeriodConcatNode;
use crate::node::process::ProcessNode;
use crate::node::relay::CloudRelayNode;
use crate::node::transcoder::{TranscoderInput, TranscoderOutput};
use crate::node::{
    Node, NodeId, NodeKind, external_command, loop_input, packager, transcoder,
};
use crate::pipe::{PipeFabric, PipeId};
use crate::relay::{RelaySettings, RemoteStore};
use crate::stream::{StreamSource, plan_outputs};
use crate::toolchain::Toolchain;

/// What flows along an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    Pipe(PipeId),
    /// The reader watches files the writer leaves in a directory.
    Directory(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub link: Link,
}

/// Everything the graph builder needs besides the inputs.
pub struct GraphContext<'a> {
    pub toolchain: &'a Toolchain,
    pub pipeline: &'a PipelineConfig,
    pub bitrates: &'a BitrateConfig,
    /// Local directory the packagers write into.
    pub output_dir: &'a Path,
    /// Where tool debug logs go.
    pub log_dir: &'a Path,
    /// Remote mirror of `output_dir`, when the destination is not local.
    pub store: Option<Arc<dyn RemoteStore>>,
    pub relay: RelaySettings,
}

#[derive(Debug, Default)]
pub struct Pipeline {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl Pipeline {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids_of(&self, kind: NodeKind) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.kind == kind)
            .map(|n| n.id)
            .collect()
    }

    pub(crate) fn add(
        &mut self,
        kind: NodeKind,
        label: String,
        body: Box<dyn crate::node::Supervised>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(id, kind, label, body));
        id
    }

    pub(crate) fn connect(&mut self, from: NodeId, to: NodeId, link: Link) {
        if let Link::Pipe(pipe) = &link {
            self.nodes[from.0].outputs.push(*pipe);
            self.nodes[to.0].inputs.push(*pipe);
        }
        self.edges.push(Edge { from, to, link });
    }

    /// Every node `id` reads from, directly or not.
    pub fn upstream_of(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut found = BTreeSet::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            for edge in self.edges.iter().filter(|e| e.to == current) {
                if found.insert(edge.from) {
                    pending.push(edge.from);
                }
            }
        }
        found
    }

    /// Writers before readers; ties keep insertion order.
    pub fn start_order(&self) -> Vec<NodeId> {
        let mut indegree = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            indegree[edge.to.0] += 1;
        }

        let mut ready: BTreeSet<NodeId> = (0..self.nodes.len())
            .filter(|&i| indegree[i] == 0)
            .map(NodeId)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.from == id) {
                indegree[edge.to.0] -= 1;
                if indegree[edge.to.0] == 0 {
                    ready.insert(edge.to);
                }
            }
        }
        order
    }

    /// Readers before writers.
    pub fn stop_order(&self) -> Vec<NodeId> {
        let mut order = self.start_order();
        order.reverse();
        order
    }
}

/// Directory of period `period` relative to the output root.
pub fn period_name(period: usize) -> String {
    format!("period_{period}")
}

/// Directory a period's packager writes into.
pub fn period_dir(output_dir: &Path, period: usize, multiperiod: bool) -> PathBuf {
    if multiperiod {
        output_dir.join(period_name(period))
    } else {
        output_dir.to_path_buf()
    }
}

fn input_label(input: &Input, index: usize) -> String {
    format!("{}-{}", input.media_type, index)
}

/// Builds the whole graph and creates its pipes. Nothing is started.
pub fn build_pipeline(
    inputs: &InputConfig,
    ctx: &GraphContext<'_>,
    fabric: &mut PipeFabric,
) -> Result<Pipeline> {
    let mut graph = Pipeline::default();
    let multiperiod = inputs.is_multiperiod();
    let mut packagers = Vec::new();
    let mut period_dirs = Vec::new();

    for (i, period_inputs) in inputs.periods().into_iter().enumerate() {
        let period = if multiperiod { i + 1 } else { 0 };
        let dir = period_dir(ctx.output_dir, period, multiperiod);
        std::fs::create_dir_all(packager::segment_dir(&dir, ctx.pipeline))
            .map_err(|e| Error::resource("creating output directory", &dir, e))?;

        packagers.push(build_period(&mut graph, period, period_inputs, &dir, ctx, fabric)?);
        period_dirs.push(PeriodDir {
            path: dir,
            relative: period_name(period),
        });
    }

    if multiperiod {
        let concat = PeriodConcatNode::new(
            ManifestNames::for_pipeline(ctx.pipeline),
            ctx.output_dir,
            period_dirs.clone(),
        );
        let concat_id = graph.add(
            NodeKind::PeriodConcat,
            "period-concat".to_string(),
            Box::new(concat),
        );
        for (packager_id, dir) in packagers.iter().zip(&period_dirs) {
            graph.connect(*packager_id, concat_id, Link::Directory(dir.path.clone()));
        }
    }

    if let Some(store) = &ctx.store {
        let relay = CloudRelayNode::new(ctx.output_dir, store.clone(), ctx.relay.clone());
        let relay_id = graph.add(NodeKind::CloudRelay, "cloud-relay".to_string(), Box::new(relay));
        for packager_id in packagers {
            graph.connect(
                packager_id,
                relay_id,
                Link::Directory(ctx.output_dir.to_path_buf()),
            );
        }
    }

    debug!(
        nodes = graph.len(),
        edges = graph.edges.len(),
        pipes = fabric.len(),
        "Pipeline graph built"
    );
    Ok(graph)
}

/// Adds the producers, transcoder and packager of one period and returns
/// the packager.
fn build_period(
    graph: &mut Pipeline,
    period: usize,
    inputs: &[Input],
    dir: &Path,
    ctx: &GraphContext<'_>,
    fabric: &mut PipeFabric,
) -> Result<NodeId> {
    let pipeline = ctx.pipeline;
    let tools = ctx.toolchain;

    // Producers feeding the transcoder through a pipe.
    let mut producers: Vec<(NodeId, PipeId)> = Vec::new();
    let mut sources = Vec::with_capacity(inputs.len());
    for (j, input) in inputs.iter().enumerate() {
        let source = match input.input_type {
            InputType::ExternalCommand => {
                let pipe = fabric.create_pipe("")?;
                let spec = external_command::command(&input.name, fabric.path(pipe));
                let label = format!("external-command-{period}-{}", input_label(input, j));
                let id = graph.add(
                    NodeKind::ExternalCommand,
                    label.clone(),
                    Box::new(ProcessNode::new(label, spec)),
                );
                producers.push((id, pipe));
                fabric.path(pipe).to_string_lossy().into_owned()
            }
            InputType::LoopedFile => {
                let pipe = fabric.create_pipe(".ts")?;
                let spec =
                    loop_input::command(&tools.ffmpeg, &input.name, fabric.path(pipe), pipeline.quiet);
                let label = format!("loop-input-{period}-{}", input_label(input, j));
                let id = graph.add(
                    NodeKind::LoopInput,
                    label.clone(),
                    Box::new(ProcessNode::new(label, spec)),
                );
                producers.push((id, pipe));
                fabric.path(pipe).to_string_lossy().into_owned()
            }
            _ => input.name.clone(),
        };
        sources.push(source);
    }

    let mut streams = plan_outputs(inputs, pipeline, ctx.bitrates)?;
    for stream in streams.iter_mut().filter(|s| s.source.is_none()) {
        let suffix = if stream.media_type() == MediaType::Text {
            ".vtt"
        } else {
            ""
        };
        stream.source = Some(StreamSource::Pipe(fabric.create_pipe(suffix)?));
    }

    let transcoder_id = if streams.iter().any(|s| !s.skips_transcoding()) {
        let entries: Vec<_> = inputs
            .iter()
            .zip(&sources)
            .map(|(input, source)| TranscoderInput {
                input,
                source: source.clone(),
            })
            .collect();
        let outputs: Vec<_> = streams
            .iter()
            .filter_map(|stream| match &stream.source {
                Some(StreamSource::Pipe(pipe)) => Some(TranscoderOutput {
                    stream,
                    pipe: fabric.path(*pipe).to_path_buf(),
                }),
                _ => None,
            })
            .collect();
        let spec = transcoder::command(&tools.ffmpeg, period, &entries, &outputs, pipeline, ctx.log_dir)?;
        let label = format!("transcoder-{period}");
        let id = graph.add(
            NodeKind::Transcoder,
            label.clone(),
            Box::new(ProcessNode::new(label, spec)),
        );
        for (producer, pipe) in &producers {
            graph.connect(*producer, id, Link::Pipe(*pipe));
        }
        Some(id)
    } else {
        None
    };

    let entries: Vec<_> = streams
        .iter()
        .filter_map(|stream| {
            let source = match stream.source.as_ref()? {
                StreamSource::Pipe(pipe) => fabric.path(*pipe).to_path_buf(),
                StreamSource::File(path) => path.clone(),
            };
            Some(PackagerStream { stream, source })
        })
        .collect();
    let spec = packager::command(&tools.packager, period, &entries, pipeline, dir, ctx.log_dir);
    let label = format!("packager-{period}");
    let packager_id = graph.add(
        NodeKind::Packager,
        label.clone(),
        Box::new(ProcessNode::new(label, spec)),
    );

    if let Some(transcoder_id) = transcoder_id {
        for stream in &streams {
            if let Some(StreamSource::Pipe(pipe)) = stream.source {
                graph.connect(transcoder_id, packager_id, Link::Pipe(pipe));
            }
        }
    }

    Ok(packager_id)
}
