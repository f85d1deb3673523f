//! The cloud relay node: a background task rather than a process.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{NodeContext, NodeState, NodeStatus, Supervised};
use crate::error::{Error, Result};
use crate::relay::{RelayPhase, RelayReport, RelaySettings, RemoteStore, Watcher};

pub struct CloudRelayNode {
    root: PathBuf,
    store: Arc<dyn RemoteStore>,
    settings: RelaySettings,
    cancel: CancellationToken,
    flush: CancellationToken,
    task: Option<JoinHandle<()>>,
    report: Option<watch::Receiver<RelayReport>>,
    state: NodeState,
}

impl CloudRelayNode {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn RemoteStore>, settings: RelaySettings) -> Self {
        Self {
            root: root.into(),
            store,
            settings,
            cancel: CancellationToken::new(),
            flush: CancellationToken::new(),
            task: None,
            report: None,
            state: NodeState::NotStarted,
        }
    }

    /// Asks for a final pass that pushes everything regardless of
    /// stability. The node reports `Finished` once it is done.
    pub fn request_flush(&self) {
        if !self.flush.is_cancelled() {
            debug!("Relay flush requested");
            self.flush.cancel();
        }
    }

    pub fn report(&self) -> Option<RelayReport> {
        self.report.as_ref().map(|rx| rx.borrow().clone())
    }
}

#[async_trait]
impl Supervised for CloudRelayNode {
    fn start(&mut self, ctx: &NodeContext) -> Result<()> {
        if self.state != NodeState::NotStarted {
            return Err(Error::AlreadyStarted);
        }
        let (watcher, rx) = Watcher::new(&self.root, self.store.clone(), self.settings.clone());
        // Spawning needs a runtime; outside one this is a launch failure.
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::launch(
                "cloud-relay",
                "relay task",
                std::io::Error::other(e.to_string()),
            )
        })?;
        self.task = Some(handle.spawn(watcher.run(self.cancel.clone(), self.flush.clone())));
        self.report = Some(rx);
        self.state = NodeState::Running;
        debug!(run_id = %ctx.run_id, root = %self.root.display(), "Relay started");
        Ok(())
    }

    fn check_status(&mut self) -> NodeStatus {
        match self.state {
            NodeState::Running => {}
            NodeState::Errored => return NodeStatus::Errored,
            _ => return NodeStatus::Finished,
        }

        let phase = self
            .report
            .as_ref()
            .map(|rx| rx.borrow().phase)
            .unwrap_or(RelayPhase::Watching);
        match phase {
            RelayPhase::Errored => {
                self.state = NodeState::Errored;
                NodeStatus::Errored
            }
            phase if phase.is_terminal() => {
                self.state = NodeState::Finished;
                NodeStatus::Finished
            }
            _ => {
                if self.task.as_ref().is_some_and(JoinHandle::is_finished) {
                    // The task ended without reporting: it panicked.
                    error!("Relay task ended unexpectedly");
                    self.state = NodeState::Errored;
                    NodeStatus::Errored
                } else {
                    NodeStatus::Running
                }
            }
        }
    }

    async fn stop(&mut self, timeout: Duration) {
        self.cancel.cancel();
        let Some(mut task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Relay did not stop in time, aborting");
            task.abort();
        }
        if self.state == NodeState::Running {
            self.state = NodeState::Stopped;
        }
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn flush(&mut self) {
        self.request_flush();
    }
}

impl Drop for CloudRelayNode {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    struct RejectingStore;

    #[async_trait]
    impl RemoteStore for RejectingStore {
        async fn upload_file(&self, _local: &Path, _relative: &str) -> Result<()> {
            Err(Error::relay("403 Forbidden"))
        }

        async fn upload_bytes(&self, _relative: &str, _body: Vec<u8>) -> Result<()> {
            Err(Error::relay("403 Forbidden"))
        }

        async fn delete(&self, _relative: &str) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "rejecting".to_string()
        }
    }

    fn settings() -> RelaySettings {
        RelaySettings {
            poll_interval: Duration::from_millis(10),
            max_retries: 1,
            retry_base: Duration::from_millis(1),
        }
    }

    fn ctx() -> NodeContext {
        NodeContext {
            run_id: "test".into(),
        }
    }

    async fn wait_for(node: &mut CloudRelayNode, status: NodeStatus) {
        for _ in 0..200 {
            if node.check_status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("relay never reached {status}");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_errored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("video_1.mp4"), b"moof").unwrap();
        let mut node = CloudRelayNode::new(dir.path(), Arc::new(RejectingStore), settings());

        node.start(&ctx()).unwrap();
        wait_for(&mut node, NodeStatus::Errored).await;
        let report = node.report().unwrap();
        assert_eq!(report.failed_attempts, 2);
        assert!(report.last_error.unwrap().contains("403"));

        node.stop(Duration::from_secs(1)).await;
        assert_eq!(node.state(), NodeState::Errored);
    }

    #[tokio::test]
    async fn flush_on_empty_tree_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = CloudRelayNode::new(dir.path(), Arc::new(RejectingStore), settings());

        node.start(&ctx()).unwrap();
        assert_eq!(node.check_status(), NodeStatus::Running);
        node.request_flush();
        wait_for(&mut node, NodeStatus::Finished).await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = CloudRelayNode::new(dir.path(), Arc::new(RejectingStore), settings());
        node.start(&ctx()).unwrap();
        node.stop(Duration::from_secs(1)).await;
        assert_eq!(node.state(), NodeState::Stopped);
        node.stop(Duration::from_secs(1)).await;
        assert_eq!(node.check_status(), NodeStatus::Finished);
    }
}
