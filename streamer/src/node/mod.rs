//! Pipeline nodes: supervised units of work connected by pipes.
//!
//! Every node wraps either one external process ([`process::ProcessNode`])
//! or in-process work ([`relay::CloudRelayNode`],
//! [`period_concat::PeriodConcatNode`]) behind the same [`Supervised`]
//! contract. The command-line builders for each process
//! kind live in the sibling modules.

pub mod external_command;
pub mod loop_input;
pub mod packager;
pub mod period_concat;
pub mod process;
pub mod relay;
pub mod transcoder;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::pipe::PipeId;

/// What a status poll reports. Ordered so that the aggregate status of a
/// set of nodes is the maximum: any error wins over running, which wins
/// over finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Finished,
    Running,
    Errored,
}

impl NodeStatus {
    /// `Finished` for an empty set.
    pub fn aggregate(statuses: impl IntoIterator<Item = NodeStatus>) -> NodeStatus {
        statuses.into_iter().max().unwrap_or(NodeStatus::Finished)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Finished => "finished",
            Self::Running => "running",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one node. `Finished`, `Errored` and `Stopped` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    NotStarted,
    Running,
    Finished,
    Errored,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    LoopInput,
    ExternalCommand,
    Transcoder,
    Packager,
    PeriodConcat,
    CloudRelay,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoopInput => "loop-input",
            Self::ExternalCommand => "external-command",
            Self::Transcoder => "transcoder",
            Self::Packager => "packager",
            Self::PeriodConcat => "period-concat",
            Self::CloudRelay => "cloud-relay",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-wide facts handed to every node at start.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: String,
}

/// The lifecycle contract every node implements.
#[async_trait]
pub trait Supervised: Send {
    /// Launches the process or task and returns once it is running. Never
    /// waits for it to finish.
    fn start(&mut self, ctx: &NodeContext) -> Result<()>;

    /// Non-blocking poll.
    fn check_status(&mut self) -> NodeStatus;

    /// Asks for a graceful exit, waits up to `timeout`, then forces it.
    /// A no-op unless running.
    async fn stop(&mut self, timeout: Duration);

    fn state(&self) -> NodeState;

    /// Asks a node holding buffered work to push it out and finish. Nodes
    /// without such work ignore it.
    fn flush(&mut self) {}
}

/// Index of a node within its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node of the pipeline graph.
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Human readable name used in logs and errors, e.g. `transcoder-1`.
    pub label: String,
    /// Pipes this node reads.
    pub inputs: Vec<PipeId>,
    /// Pipes this node writes.
    pub outputs: Vec<PipeId>,
    body: Box<dyn Supervised>,
}

impl Node {
    pub fn new(
        id: NodeId,
        kind: NodeKind,
        label: impl Into<String>,
        body: Box<dyn Supervised>,
    ) -> Self {
        Self {
            id,
            kind,
            label: label.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            body,
        }
    }

    pub fn start(&mut self, ctx: &NodeContext) -> Result<()> {
        self.body.start(ctx)
    }

    pub fn check_status(&mut self) -> NodeStatus {
        self.body.check_status()
    }

    pub async fn stop(&mut self, timeout: Duration) {
        self.body.stop(timeout).await
    }

    pub fn state(&self) -> NodeState {
        self.body.state()
    }

    pub fn flush(&mut self) {
        self.body.flush()
    }

    pub fn was_started(&self) -> bool {
        self.state() != NodeState::NotStarted
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_prefers_errors() {
        use NodeStatus::*;
        assert_eq!(NodeStatus::aggregate([]), Finished);
        assert_eq!(NodeStatus::aggregate([Finished, Finished]), Finished);
        assert_eq!(NodeStatus::aggregate([Finished, Running]), Running);
        assert_eq!(NodeStatus::aggregate([Running, Errored, Finished]), Errored);
    }
}
