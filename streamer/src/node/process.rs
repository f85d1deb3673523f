//! A node backed by one external process.

use async_trait::async_trait;
use process_utils::{ProcessGroupExt, SignalTarget, StopOutcome};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use super::{NodeContext, NodeState, NodeStatus, Supervised};
use crate::error::{Error, Result};

/// Where a child's stdout and stderr go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    /// Forwarded line by line through `tracing`.
    Log,
    /// Discarded.
    Null,
    /// Both streams written to this file.
    File(PathBuf),
}

/// Everything needed to launch a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Lead a new process group and signal the whole group on stop.
    pub own_group: bool,
    pub output: OutputSink,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            own_group: false,
            output: OutputSink::Log,
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The command as a shell would print it with `set -x`.
    pub fn render(&self) -> String {
        process_utils::render_command_line(&self.program.to_string_lossy(), &self.args)
    }

    fn signal_target(&self) -> SignalTarget {
        if self.own_group {
            SignalTarget::Group
        } else {
            SignalTarget::Process
        }
    }
}

fn forward_lines<R>(label: String, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.to_ascii_lowercase().contains("error") {
                        warn!(node = %label, "{}", line);
                    } else {
                        debug!(node = %label, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(node = %label, error = %e, "Stopped reading process output");
                    break;
                }
            }
        }
    });
}

/// Runs a [`CommandSpec`] under the [`Supervised`] contract.
#[derive(Debug)]
pub struct ProcessNode {
    label: String,
    spec: CommandSpec,
    child: Option<Child>,
    pid: Option<u32>,
    state: NodeState,
    exit: Option<ExitStatus>,
}

impl ProcessNode {
    pub fn new(label: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            label: label.into(),
            spec,
            child: None,
            pid: None,
            state: NodeState::NotStarted,
            exit: None,
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    fn record_exit(&mut self, status: ExitStatus) -> NodeStatus {
        self.exit = Some(status);
        if status.success() {
            info!(node = %self.label, "Process finished");
            self.state = NodeState::Finished;
            NodeStatus::Finished
        } else {
            error!(
                node = %self.label,
                status = %process_utils::describe_exit(&status),
                "Process failed"
            );
            self.state = NodeState::Errored;
            NodeStatus::Errored
        }
    }

    fn stdio(&self) -> Result<(Stdio, Stdio)> {
        match &self.spec.output {
            OutputSink::Log => Ok((Stdio::piped(), Stdio::piped())),
            OutputSink::Null => Ok((Stdio::null(), Stdio::null())),
            OutputSink::File(path) => {
                let file = std::fs::File::create(path)
                    .map_err(|e| Error::resource("creating log file", path, e))?;
                let stderr = file
                    .try_clone()
                    .map_err(|e| Error::resource("creating log file", path, e))?;
                Ok((Stdio::from(file), Stdio::from(stderr)))
            }
        }
    }
}

#[async_trait]
impl Supervised for ProcessNode {
    fn start(&mut self, ctx: &NodeContext) -> Result<()> {
        if self.state != NodeState::NotStarted {
            return Err(Error::AlreadyStarted);
        }

        let (stdout, stderr) = self.stdio()?;
        let mut cmd = process_utils::tokio_command(&self.spec.program);
        cmd.args(&self.spec.args)
            .envs(self.spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if self.spec.own_group {
            cmd.own_process_group();
        }

        info!("+ {}", self.spec.render());
        let mut child = cmd.spawn().map_err(|e| {
            Error::launch(&self.label, self.spec.program.to_string_lossy(), e)
        })?;

        if let Some(out) = child.stdout.take() {
            forward_lines(self.label.clone(), out);
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(self.label.clone(), err);
        }

        self.pid = child.id();
        debug!(node = %self.label, run_id = %ctx.run_id, pid = ?self.pid, "Process started");
        self.child = Some(child);
        self.state = NodeState::Running;
        Ok(())
    }

    fn check_status(&mut self) -> NodeStatus {
        match self.state {
            NodeState::Running => {}
            NodeState::Errored => return NodeStatus::Errored,
            NodeState::NotStarted | NodeState::Finished | NodeState::Stopped => {
                return NodeStatus::Finished;
            }
        }

        let Some(child) = self.child.as_mut() else {
            return NodeStatus::Finished;
        };
        match child.try_wait() {
            Ok(None) => NodeStatus::Running,
            Ok(Some(status)) => self.record_exit(status),
            Err(e) => {
                error!(node = %self.label, error = %e, "Failed to poll process");
                self.state = NodeState::Errored;
                NodeStatus::Errored
            }
        }
    }

    async fn stop(&mut self, timeout: Duration) {
        let target = self.spec.signal_target();

        if self.state == NodeState::Running
            && let Some(child) = self.child.as_mut()
        {
            match process_utils::terminate_gracefully(child, timeout, target).await {
                Ok(StopOutcome::AlreadyExited(status)) => {
                    debug!(
                        node = %self.label,
                        status = %process_utils::describe_exit(&status),
                        "Process had already exited"
                    );
                    self.exit = Some(status);
                }
                Ok(StopOutcome::Terminated(status)) => {
                    info!(node = %self.label, "Process stopped");
                    self.exit = Some(status);
                }
                Ok(StopOutcome::Killed(status)) => {
                    warn!(
                        node = %self.label,
                        timeout_ms = timeout.as_millis() as u64,
                        "Process did not exit in time and was killed"
                    );
                    self.exit = status;
                }
                Err(e) => {
                    warn!(node = %self.label, error = %e, "Failed to stop process");
                }
            }
            self.state = NodeState::Stopped;

            // Whatever a shell forked may outlive the shell itself.
            if target == SignalTarget::Group
                && let Some(pid) = self.pid
            {
                let _ = process_utils::signal_kill(pid, SignalTarget::Group);
            }
        }
    }

    fn state(&self) -> NodeState {
        self.state
    }
}

impl Drop for ProcessNode {
    fn drop(&mut self) {
        if self.state == NodeState::Running
            && let Some(pid) = self.pid
        {
            warn!(node = %self.label, pid, "Process still running on drop, killing it");
            let _ = process_utils::signal_kill(pid, self.spec.signal_target());
        }
    }
}
