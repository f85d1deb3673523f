//! Process supervision primitives shared across the workspace.
//!
//! Everything a pipeline node needs to run an external tool lives here:
//! building commands, rendering them for logs, signalling a child (or its
//! whole process group) and bounded shutdown with escalation to a hard kill.

use std::ffi::OsStr;
use std::process::ExitStatus;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Start the child as the leader of a fresh process group, so that a shell
/// and everything it forks can be signalled together.
pub trait ProcessGroupExt {
    fn own_process_group(&mut self);
}

impl ProcessGroupExt for std::process::Command {
    fn own_process_group(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            self.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl ProcessGroupExt for tokio::process::Command {
    fn own_process_group(&mut self) {
        self.as_std_mut().own_process_group();
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c)
}

/// Quote a single argument the way a POSIX shell would need it.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if arg.chars().all(is_shell_safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\"'\"'"))
}

/// Render a command line in the form `bash -x` prints it, ready to be
/// pasted back into a shell.
pub fn render_command_line<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut rendered = quote_arg(program);
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&quote_arg(arg.as_ref()));
    }
    rendered
}

/// Error returned by [`split_command_line`] for unbalanced quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitError {
    pub reason: &'static str,
}

impl std::fmt::Display for SplitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason)
    }
}

impl std::error::Error for SplitError {}

/// Split a string into arguments using POSIX shell quoting rules
/// (single quotes, double quotes and backslash escapes). No expansion is
/// performed. An empty or blank string yields no arguments.
pub fn split_command_line(line: &str) -> Result<Vec<String>, SplitError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => {
                            return Err(SplitError {
                                reason: "unterminated single quote",
                            });
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some('\n') => {}
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => {
                                return Err(SplitError {
                                    reason: "unterminated double quote",
                                });
                            }
                        },
                        Some(ch) => current.push(ch),
                        None => {
                            return Err(SplitError {
                                reason: "unterminated double quote",
                            });
                        }
                    }
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(ch) => {
                    in_word = true;
                    current.push(ch);
                }
                None => {
                    return Err(SplitError {
                        reason: "trailing backslash",
                    });
                }
            },
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Which processes a signal is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    /// Only the child itself.
    Process,
    /// The process group led by the child.
    Group,
}

#[cfg(unix)]
fn send_signal(
    pid: u32,
    target: SignalTarget,
    signal: nix::sys::signal::Signal,
) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid as i32);
    let result = match target {
        SignalTarget::Process => kill(pid, signal),
        SignalTarget::Group => killpg(pid, signal),
    };

    match result {
        // Already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

/// Politely ask a child (or its group) to exit.
///
/// On Unix this sends `SIGTERM`. Other platforms have no equivalent for
/// console-less children and return `Unsupported`, so callers fall back to
/// a hard kill.
pub fn signal_terminate(pid: u32, target: SignalTarget) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, target, nix::sys::signal::Signal::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, target);
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "graceful termination is not supported on this platform",
        ))
    }
}

/// Hard-kill a child (or its group).
pub fn signal_kill(pid: u32, target: SignalTarget) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, target, nix::sys::signal::Signal::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, target);
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are not supported on this platform",
        ))
    }
}

/// Describe how a process ended, e.g. `exit code 1` or `signal 9`.
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    "unknown exit status".to_string()
}

/// How a child ended during [`terminate_gracefully`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The child had already exited before any signal was sent.
    AlreadyExited(ExitStatus),
    /// The child exited within the grace period after being asked to.
    Terminated(ExitStatus),
    /// The grace period elapsed and the child was killed.
    Killed(Option<ExitStatus>),
}

#[cfg(feature = "tokio")]
const KILL_REAP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Ask `child` to exit, wait up to `grace`, then kill it.
///
/// The child is always reaped before returning unless the kill itself could
/// not be confirmed within a few seconds, in which case `Killed(None)` is
/// returned and tokio reaps it in the background.
#[cfg(feature = "tokio")]
pub async fn terminate_gracefully(
    child: &mut tokio::process::Child,
    grace: std::time::Duration,
    target: SignalTarget,
) -> std::io::Result<StopOutcome> {
    if let Some(status) = child.try_wait()? {
        return Ok(StopOutcome::AlreadyExited(status));
    }

    let Some(pid) = child.id() else {
        let status = child.wait().await?;
        return Ok(StopOutcome::AlreadyExited(status));
    };

    if signal_terminate(pid, target).is_ok()
        && let Ok(status) = tokio::time::timeout(grace, child.wait()).await
    {
        return Ok(StopOutcome::Terminated(status?));
    }

    if target == SignalTarget::Group {
        let _ = signal_kill(pid, SignalTarget::Group);
    }
    // Fails only when the child is already reaped.
    let _ = child.start_kill();

    let status = tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait())
        .await
        .ok()
        .and_then(|r| r.ok());
    Ok(StopOutcome::Killed(status))
}
