//! Locations of the external tools and their version checks.

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Matches two or more dot-separated numbers, e.g. `7.1` or `3.4.2`.
static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+(?:\.[0-9]+)+").unwrap());

pub const MIN_FFMPEG_VERSION: &[u32] = &[7, 1];
pub const MIN_PACKAGER_VERSION: &[u32] = &[3, 4];

/// Paths to the external binaries a pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub packager: PathBuf,
    pub rclone: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            packager: PathBuf::from("packager"),
            rclone: PathBuf::from("rclone"),
        }
    }
}

impl Toolchain {
    /// Reads `FFMPEG_PATH`, `FFPROBE_PATH`, `PACKAGER_PATH` and `RCLONE_PATH`,
    /// falling back to the bare command names.
    pub fn from_env() -> Self {
        let var = |name: &str, fallback: PathBuf| {
            std::env::var_os(name)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(fallback)
        };
        let defaults = Self::default();
        Self {
            ffmpeg: var("FFMPEG_PATH", defaults.ffmpeg),
            ffprobe: var("FFPROBE_PATH", defaults.ffprobe),
            packager: var("PACKAGER_PATH", defaults.packager),
            rclone: var("RCLONE_PATH", defaults.rclone),
        }
    }

    /// Checks that FFmpeg, ffprobe and the packager are installed and recent
    /// enough.
    pub async fn verify(&self) -> Result<()> {
        check_command_version("FFmpeg", &self.ffmpeg, MIN_FFMPEG_VERSION).await?;
        check_command_version("ffprobe", &self.ffprobe, MIN_FFMPEG_VERSION).await?;
        check_command_version("Shaka Packager", &self.packager, MIN_PACKAGER_VERSION).await?;
        Ok(())
    }
}

fn version_string(version: &[u32]) -> String {
    version
        .iter()
        .map(|part| part.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Finds the first version number in `-version` output.
pub fn parse_version(output: &str) -> Option<Vec<u32>> {
    let found = VERSION_REGEX.find(output)?;
    found
        .as_str()
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

async fn check_command_version(name: &str, program: &PathBuf, minimum: &[u32]) -> Result<()> {
    let required = version_string(minimum);

    let output = process_utils::tokio_command(program)
        .arg("-version")
        .stdin(std::process::Stdio::null())
        .output()
        .await;

    let output = match output {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!(
                program = %program.display(),
                status = %process_utils::describe_exit(&output.status),
                "Version check failed"
            );
            return Err(Error::version(name, "not found", required));
        }
        Err(e) => {
            debug!(program = %program.display(), error = %e, "Version check failed");
            return Err(Error::version(name, "not found", required));
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let version = parse_version(&text)
        .ok_or_else(|| Error::Other(format!("{name} version could not be parsed!")))?;

    // Lexicographic, like comparing version tuples.
    if version.as_slice() < minimum {
        return Err(Error::version(name, "out of date", required));
    }

    info!(tool = name, version = %version_string(&version), "Found dependency");
    Ok(())
}
