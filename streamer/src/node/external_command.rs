//! Runs a user-supplied shell command that writes a stream into a pipe.

use std::path::Path;

use super::process::{CommandSpec, OutputSink};

/// Environment variable telling the command where to write its output.
pub const OUTPUT_ENV: &str = "STREAMER_EXTERNAL_COMMAND_OUTPUT";

/// `sh -c <command>` with line breaks flattened, leading its own process
/// group so that everything it forks is stopped along with it.
pub fn command(command_line: &str, pipe: &Path) -> CommandSpec {
    let flattened = command_line.replace(['\r', '\n'], " ");

    let mut spec = CommandSpec::new(shell());
    spec.arg(shell_flag()).arg(flattened.trim());
    spec.env(OUTPUT_ENV, pipe.to_string_lossy());
    spec.own_group = true;
    spec.output = OutputSink::Log;
    spec
}

#[cfg(not(windows))]
fn shell() -> &'static str {
    "sh"
}

#[cfg(not(windows))]
fn shell_flag() -> &'static str {
    "-c"
}

#[cfg(windows)]
fn shell() -> &'static str {
    "cmd"
}

#[cfg(windows)]
fn shell_flag() -> &'static str {
    "/C"
}
