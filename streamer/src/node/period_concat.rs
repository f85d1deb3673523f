//! Joins the period manifests once every packager of a multi-period run is
//! done. Runs in the caller's thread when flushed; there is nothing to
//! supervise before that.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error};

use super::{NodeContext, NodeState, NodeStatus, Supervised};
use crate::concat::{ManifestNames, PeriodDir, concat_periods};
use crate::error::{Error, Result};

pub struct PeriodConcatNode {
    names: ManifestNames,
    output_dir: PathBuf,
    periods: Vec<PeriodDir>,
    state: NodeState,
}

impl PeriodConcatNode {
    pub fn new(names: ManifestNames, output_dir: impl Into<PathBuf>, periods: Vec<PeriodDir>) -> Self {
        Self {
            names,
            output_dir: output_dir.into(),
            periods,
            state: NodeState::NotStarted,
        }
    }
}

#[async_trait]
impl Supervised for PeriodConcatNode {
    fn start(&mut self, ctx: &NodeContext) -> Result<()> {
        if self.state != NodeState::NotStarted {
            return Err(Error::AlreadyStarted);
        }
        self.state = NodeState::Running;
        debug!(run_id = %ctx.run_id, periods = self.periods.len(), "Period concatenation armed");
        Ok(())
    }

    fn check_status(&mut self) -> NodeStatus {
        match self.state {
            NodeState::Running => NodeStatus::Running,
            NodeState::Errored => NodeStatus::Errored,
            _ => NodeStatus::Finished,
        }
    }

    async fn stop(&mut self, _timeout: Duration) {
        if self.state == NodeState::Running {
            self.state = NodeState::Stopped;
        }
    }

    fn state(&self) -> NodeState {
        self.state
    }

    /// Writes the joined manifests. Only meaningful once every packager
    /// has finished.
    fn flush(&mut self) {
        if self.state != NodeState::Running {
            return;
        }
        self.state = match concat_periods(&self.names, &self.output_dir, &self.periods) {
            Ok(()) => NodeState::Finished,
            Err(e) => {
                error!(error = %e, "Period concatenation failed");
                NodeState::Errored
            }
        };
    }
}
