//! The run controller: builds the graph, starts it, reports on it and tears
//! it down.
//!
//! The controller never polls on its own. The owner calls
//! [`Controller::check_status`] at a short interval until the run is
//! finished or errored and then calls [`Controller::stop`] once.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BitrateConfig, InputConfig, ManifestFormat, PipelineConfig};
use crate::error::{ConfigError, Error, Result};
use crate::graph::{GraphContext, Pipeline, build_pipeline};
use crate::location::OutputLocation;
use crate::node::{NodeContext, NodeId, NodeKind, NodeState, NodeStatus};
use crate::pipe::PipeFabric;
use crate::relay::{RelaySettings, store_for};
use crate::toolchain::Toolchain;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub toolchain: Toolchain,
    /// How long each node gets to exit after being asked to.
    pub stop_timeout: Duration,
    pub relay: RelaySettings,
    /// How long a finished VOD run waits for the relay to flush.
    pub relay_grace: Duration,
    /// Parent of the pipe and staging directories; the system temp dir
    /// when unset.
    pub temp_root: Option<PathBuf>,
    /// Where the tools write their debug logs when `debug_logs` is set.
    pub log_dir: PathBuf,
    pub check_dependencies: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            toolchain: Toolchain::default(),
            stop_timeout: Duration::from_secs(10),
            relay: RelaySettings::default(),
            relay_grace: Duration::from_secs(30),
            temp_root: None,
            log_dir: PathBuf::from("."),
            check_dependencies: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopped,
}

/// A node's state, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub label: String,
    pub kind: NodeKind,
    pub state: NodeState,
}

struct Run {
    graph: Pipeline,
    fabric: PipeFabric,
    /// Local copy of a remote destination.
    staging: Option<TempDir>,
    output_dir: PathBuf,
    live: bool,
    /// Set once the VOD processes are done and the relay was told to flush.
    flush_deadline: Option<Instant>,
}

pub struct Controller {
    options: ControllerOptions,
    state: RunState,
    interrupt: CancellationToken,
    run: Option<Run>,
}

fn check_cross_fields(
    inputs: &InputConfig,
    pipeline: &PipelineConfig,
    location: &OutputLocation,
) -> std::result::Result<(), ConfigError> {
    inputs.check_exclusive()?;

    if !pipeline.segment_per_file {
        if pipeline.is_live() {
            return Err(ConfigError::malformed(
                "PipelineConfig",
                "segment_per_file",
                "must be true when streaming_mode is \"live\"",
            ));
        }
        if location.is_remote() {
            return Err(ConfigError::malformed(
                "PipelineConfig",
                "segment_per_file",
                format!("must be true when uploading to {location}"),
            ));
        }
    }

    if pipeline.low_latency_dash_mode {
        if pipeline.manifest_format != [ManifestFormat::Dash] {
            return Err(ConfigError::malformed(
                "PipelineConfig",
                "low_latency_dash_mode",
                "only compatible with DASH output; set manifest_format to [\"dash\"]",
            ));
        }
        if pipeline.utc_timings.is_empty() {
            return Err(ConfigError::malformed(
                "PipelineConfig",
                "utc_timings",
                "must be set for low_latency_dash_mode",
            ));
        }
    }

    if inputs.is_multiperiod() && location.is_remote() {
        return Err(ConfigError::malformed(
            "InputConfig",
            "multiperiod_inputs_list",
            "not supported with a remote output location",
        ));
    }

    for input in inputs.all_inputs() {
        input.require_resolved()?;
    }
    Ok(())
}

impl Controller {
    pub fn new(options: ControllerOptions) -> Self {
        Self {
            options,
            state: RunState::Idle,
            interrupt: CancellationToken::new(),
            run: None,
        }
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Cancelling this token makes an in-progress `start` roll back and
    /// return [`Error::Interrupted`]. The owner should then `stop` once.
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Directory holding the run's pipes.
    pub fn pipe_dir(&self) -> Option<&Path> {
        self.run.as_ref().map(|run| run.fabric.dir())
    }

    /// Local directory the packagers write into.
    pub fn output_dir(&self) -> Option<&Path> {
        self.run.as_ref().map(|run| run.output_dir.as_path())
    }

    pub fn nodes(&self) -> Vec<NodeSummary> {
        self.run
            .as_ref()
            .map(|run| {
                run.graph
                    .nodes()
                    .iter()
                    .map(|node| NodeSummary {
                        label: node.label.clone(),
                        kind: node.kind,
                        state: node.state(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validates the cross-field constraints, builds the graph and starts
    /// every node, writers first. On any failure whatever was already
    /// launched is stopped again before the error is returned.
    pub async fn start(
        &mut self,
        inputs: &InputConfig,
        pipeline: &PipelineConfig,
        bitrates: &BitrateConfig,
        output_location: &str,
    ) -> Result<()> {
        if matches!(self.state, RunState::Starting | RunState::Running) {
            return Err(Error::AlreadyStarted);
        }

        let location = OutputLocation::parse(output_location)?;
        check_cross_fields(inputs, pipeline, &location)?;

        self.state = RunState::Starting;
        let launched = self.launch(inputs, pipeline, bitrates, &location).await;
        self.settle_start(launched).await
    }

    /// Marks the run as running, or rolls back whatever was launched.
    async fn settle_start(&mut self, launched: Result<()>) -> Result<()> {
        match launched {
            Ok(()) => {
                self.state = RunState::Running;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Pipeline start failed, rolling back");
                if self.run.is_some() {
                    self.stop().await;
                } else {
                    self.state = RunState::Idle;
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &mut self,
        inputs: &InputConfig,
        pipeline: &PipelineConfig,
        bitrates: &BitrateConfig,
        location: &OutputLocation,
    ) -> Result<()> {
        if self.options.check_dependencies {
            self.options.toolchain.verify().await?;
        }
        if self.interrupt.is_cancelled() {
            return Err(Error::Interrupted);
        }

        let temp_root = self.options.temp_root.as_deref();
        let (output_dir, staging) = match location.local_dir() {
            Some(dir) => {
                prepare_local_dir(dir)?;
                (dir.to_path_buf(), None)
            }
            None => {
                let parent = temp_root
                    .map(Path::to_path_buf)
                    .unwrap_or_else(std::env::temp_dir);
                let staging = tempfile::Builder::new()
                    .prefix("streamer-output-")
                    .tempdir_in(&parent)
                    .map_err(|e| Error::resource("creating staging directory in", &parent, e))?;
                (staging.path().to_path_buf(), Some(staging))
            }
        };

        let mut fabric = PipeFabric::new(temp_root)?;
        let store = store_for(location, &self.options.toolchain.rclone)?;
        let ctx = GraphContext {
            toolchain: &self.options.toolchain,
            pipeline,
            bitrates,
            output_dir: &output_dir,
            log_dir: &self.options.log_dir,
            store,
            relay: self.options.relay.clone(),
        };
        let graph = build_pipeline(inputs, &ctx, &mut fabric)?;
        let node_ctx = NodeContext {
            run_id: fabric.run_id().to_string(),
        };

        info!(
            run_id = %node_ctx.run_id,
            mode = %pipeline.streaming_mode,
            nodes = graph.len(),
            pipes = fabric.len(),
            output = %location,
            "Starting pipeline"
        );

        self.run = Some(Run {
            graph,
            fabric,
            staging,
            output_dir,
            live: pipeline.is_live(),
            flush_deadline: None,
        });
        self.start_nodes(&node_ctx)?;

        info!(run_id = %node_ctx.run_id, "Pipeline running");
        Ok(())
    }

    /// Starts the run's nodes writers first, checking for an interrupt
    /// before each one.
    fn start_nodes(&mut self, ctx: &NodeContext) -> Result<()> {
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        for id in run.graph.start_order() {
            if self.interrupt.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let node = run.graph.node_mut(id);
            debug!(node = %node.label, id = %id, "Starting node");
            node.start(ctx)?;
        }
        Ok(())
    }

    /// Aggregated status of the run. Never blocks.
    ///
    /// A controller that was never started reports `Errored`, as there is
    /// nothing that could finish. After `stop` it reports `Finished`.
    pub fn check_status(&mut self) -> NodeStatus {
        let relay_grace = self.options.relay_grace;
        let Some(run) = self.run.as_mut() else {
            if self.state == RunState::Idle {
                warn!("Status polled before the pipeline was started");
                return NodeStatus::Errored;
            }
            return NodeStatus::Finished;
        };
        if run.graph.is_empty() {
            return NodeStatus::Finished;
        }

        let mut statuses = Vec::with_capacity(run.graph.len());
        for id in (0..run.graph.len()).map(NodeId) {
            let node = run.graph.node_mut(id);
            statuses.push((id, node.kind, node.check_status()));
        }

        if let Some((id, _, _)) = statuses.iter().find(|(_, _, s)| *s == NodeStatus::Errored) {
            error!(node = %run.graph.node(*id).label, "Node failed");
            return NodeStatus::Errored;
        }

        if run.live {
            // Nothing in a live run ends by itself.
            if let Some((id, _, _)) = statuses
                .iter()
                .find(|(_, kind, s)| *kind != NodeKind::CloudRelay && *s == NodeStatus::Finished)
            {
                error!(node = %run.graph.node(*id).label, "Node exited during a live run");
                return NodeStatus::Errored;
            }
            return NodeStatus::Running;
        }

        let mut required: BTreeSet<NodeId> = BTreeSet::new();
        for packager in run.graph.ids_of(NodeKind::Packager) {
            required.insert(packager);
            required.extend(run.graph.upstream_of(packager));
        }
        let packaging = NodeStatus::aggregate(
            statuses
                .iter()
                .filter(|(id, _, _)| required.contains(id))
                .map(|(_, _, status)| *status),
        );
        if packaging != NodeStatus::Finished {
            return NodeStatus::Running;
        }

        for id in run.graph.ids_of(NodeKind::PeriodConcat) {
            let node = run.graph.node_mut(id);
            node.flush();
            if node.check_status() == NodeStatus::Errored {
                error!(node = %node.label, "Node failed");
                return NodeStatus::Errored;
            }
        }

        let Some(relay) = run.graph.ids_of(NodeKind::CloudRelay).first().copied() else {
            return NodeStatus::Finished;
        };
        let relay_status = statuses[relay.0].2;
        if relay_status == NodeStatus::Finished {
            return NodeStatus::Finished;
        }

        let deadline = *run.flush_deadline.get_or_insert_with(|| {
            info!("Packaging finished, flushing uploads");
            Instant::now() + relay_grace
        });
        run.graph.node_mut(relay).flush();
        if Instant::now() >= deadline {
            warn!(
                grace_secs = relay_grace.as_secs(),
                "Relay did not finish flushing in time"
            );
            return NodeStatus::Finished;
        }
        NodeStatus::Running
    }

    /// Stops every started node, readers first, then removes the pipes and
    /// any staging directory. Safe to call repeatedly; later calls do
    /// nothing.
    pub async fn stop(&mut self) {
        let Some(mut run) = self.run.take() else {
            if self.state != RunState::Idle {
                self.state = RunState::Stopped;
            }
            self.reset_interrupt();
            return;
        };

        let timeout = self.options.stop_timeout;
        for id in run.graph.stop_order() {
            let node = run.graph.node_mut(id);
            if !node.was_started() {
                continue;
            }
            debug!(node = %node.label, "Stopping node");
            node.stop(timeout).await;
        }

        if let Err(e) = run.fabric.cleanup_all() {
            warn!(error = %e, "Failed to remove pipes");
        }
        if let Some(staging) = run.staging.take() {
            let path = staging.path().to_path_buf();
            if let Err(e) = staging.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove staging directory");
            }
        }

        info!("Pipeline stopped");
        self.state = RunState::Stopped;
        self.reset_interrupt();
    }

    /// A consumed interrupt must not cancel the next run. Tokens handed
    /// out earlier stay cancelled.
    fn reset_interrupt(&mut self) {
        if self.interrupt.is_cancelled() {
            self.interrupt = CancellationToken::new();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.run.is_some() {
            // Node and fabric destructors kill and clean up what is left.
            warn!("Controller dropped without stop()");
        }
    }
}

fn prepare_local_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::resource("clearing output directory", dir, e)),
    }
    std::fs::create_dir_all(dir).map_err(|e| Error::resource("creating output directory", dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Input, InputType, MediaType, StreamingMode, UtcTimingPair};
    use crate::error::ConfigErrorKind;
    use crate::graph::Link;
    use crate::node::Supervised;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Logs its lifecycle, and fires `interrupt` while it starts when set.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        interrupt: Option<CancellationToken>,
        state: NodeState,
    }

    #[async_trait]
    impl Supervised for Recorder {
        fn start(&mut self, _ctx: &NodeContext) -> Result<()> {
            self.log.lock().push(format!("start {}", self.name));
            self.state = NodeState::Running;
            if let Some(token) = &self.interrupt {
                token.cancel();
            }
            Ok(())
        }

        fn check_status(&mut self) -> NodeStatus {
            NodeStatus::Running
        }

        async fn stop(&mut self, _timeout: Duration) {
            if self.state == NodeState::Running {
                self.log.lock().push(format!("stop {}", self.name));
                self.state = NodeState::Stopped;
            }
        }

        fn state(&self) -> NodeState {
            self.state
        }
    }

    fn video() -> Input {
        Input::new(InputType::File, "in.mp4", MediaType::Video)
            .with_resolution("720p")
            .with_frame_rate(24.0)
    }

    fn kind_of(result: std::result::Result<(), ConfigError>) -> (ConfigErrorKind, String) {
        let err = result.unwrap_err();
        (err.kind(), err.field().to_string())
    }

    #[test]
    fn remote_destinations_need_segment_per_file() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.segment_per_file = false;
        let inputs = InputConfig::single(vec![video()]);

        let local = OutputLocation::parse("out").unwrap();
        assert!(check_cross_fields(&inputs, &pipeline, &local).is_ok());

        let remote = OutputLocation::parse("https://example.com/up").unwrap();
        assert_eq!(
            kind_of(check_cross_fields(&inputs, &pipeline, &remote)),
            (ConfigErrorKind::MalformedField, "segment_per_file".to_string())
        );
    }

    #[test]
    fn low_latency_dash_needs_dash_only_and_timings() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Live);
        pipeline.low_latency_dash_mode = true;
        let inputs = InputConfig::single(vec![video()]);
        let location = OutputLocation::parse("out").unwrap();

        assert_eq!(
            kind_of(check_cross_fields(&inputs, &pipeline, &location)).1,
            "low_latency_dash_mode"
        );
        pipeline.manifest_format = vec![ManifestFormat::Dash];
        assert_eq!(
            kind_of(check_cross_fields(&inputs, &pipeline, &location)).1,
            "utc_timings"
        );
        pipeline.utc_timings.push(UtcTimingPair {
            scheme_id_uri: "urn:mpeg:dash:utc:http-head:2014".into(),
            value: "https://time.example.com".into(),
        });
        assert!(check_cross_fields(&inputs, &pipeline, &location).is_ok());
    }

    #[test]
    fn multiperiod_stays_local() {
        let pipeline = PipelineConfig::new(StreamingMode::Vod);
        let inputs = InputConfig::multiperiod(vec![vec![video()], vec![video()]]);
        let location = OutputLocation::parse("gs://bucket/vod").unwrap();
        assert_eq!(
            kind_of(check_cross_fields(&inputs, &pipeline, &location)).1,
            "multiperiod_inputs_list"
        );
    }

    #[test]
    fn unresolved_inputs_are_rejected() {
        let pipeline = PipelineConfig::new(StreamingMode::Vod);
        let inputs = InputConfig::single(vec![Input::new(
            InputType::File,
            "in.mp4",
            MediaType::Audio,
        )]);
        let location = OutputLocation::parse("out").unwrap();
        assert_eq!(
            kind_of(check_cross_fields(&inputs, &pipeline, &location)),
            (ConfigErrorKind::MissingRequiredField, "channel_layout".to_string())
        );
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let mut controller = Controller::new(ControllerOptions::default());
        controller.stop().await;
        controller.stop().await;
        assert_eq!(controller.state(), RunState::Idle);
        assert_eq!(controller.check_status(), NodeStatus::Errored);
    }

    #[tokio::test]
    async fn config_errors_leave_controller_idle() {
        let mut controller = Controller::new(ControllerOptions {
            check_dependencies: false,
            ..Default::default()
        });
        let pipeline = PipelineConfig::new(StreamingMode::Vod);
        let err = controller
            .start(&InputConfig::default(), &pipeline, &BitrateConfig::default(), "out")
            .await
            .unwrap_err();
        assert_eq!(
            err.config_kind(),
            Some(ConfigErrorKind::MissingRequiredExclusiveFields)
        );
        assert_eq!(controller.state(), RunState::Idle);
        assert!(controller.pipe_dir().is_none());
    }

    #[tokio::test]
    async fn interrupt_during_launch_stops_only_started_nodes() {
        let root = tempfile::tempdir().unwrap();
        let mut controller = Controller::new(ControllerOptions {
            check_dependencies: false,
            ..Default::default()
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = |name: &'static str, interrupt: Option<CancellationToken>| {
            Box::new(Recorder {
                name,
                log: log.clone(),
                interrupt,
                state: NodeState::NotStarted,
            })
        };

        let mut graph = Pipeline::default();
        let writer = graph.add(
            NodeKind::Transcoder,
            "transcoder-0".to_string(),
            recorder("transcoder", Some(controller.interrupt_token())),
        );
        let reader = graph.add(
            NodeKind::Packager,
            "packager-0".to_string(),
            recorder("packager", None),
        );
        graph.connect(writer, reader, Link::Directory(root.path().to_path_buf()));

        let fabric = PipeFabric::new(Some(root.path())).unwrap();
        let pipe_dir = fabric.dir().to_path_buf();
        controller.run = Some(Run {
            graph,
            fabric,
            staging: None,
            output_dir: root.path().to_path_buf(),
            live: false,
            flush_deadline: None,
        });
        controller.state = RunState::Starting;

        let ctx = NodeContext {
            run_id: "test".into(),
        };
        let launched = controller.start_nodes(&ctx);
        let err = controller.settle_start(launched).await.unwrap_err();

        assert!(matches!(err, Error::Interrupted));
        assert_eq!(*log.lock(), vec!["start transcoder", "stop transcoder"]);
        assert_eq!(controller.state(), RunState::Stopped);
        assert!(controller.pipe_dir().is_none());
        assert!(!pipe_dir.exists());

        // The interrupt is consumed and nothing is stopped twice.
        assert!(!controller.interrupt_token().is_cancelled());
        controller.stop().await;
        assert_eq!(log.lock().len(), 2);
    }
}
