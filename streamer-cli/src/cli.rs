use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use streamer::logging::LoggingOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Input config describing the media sources (.toml or .json)
    #[arg(short, long, env = "STREAMER_INPUT_CONFIG")]
    pub input_config: PathBuf,

    /// Pipeline config describing the encoding and packaging settings
    #[arg(short, long, env = "STREAMER_PIPELINE_CONFIG")]
    pub pipeline_config: PathBuf,

    /// Bitrate config overriding the built-in resolution and layout tables
    #[arg(short, long, env = "STREAMER_BITRATE_CONFIG")]
    pub bitrate_config: Option<PathBuf>,

    /// Local directory, http(s):// URL or gs:// / s3:// bucket for the output
    #[arg(short, long, env = "STREAMER_OUTPUT", default_value = "output_files")]
    pub output: String,

    /// Do not check ffmpeg and packager versions before starting
    #[arg(long)]
    pub skip_deps_check: bool,

    /// Do not probe inputs for missing resolution, frame rate or layout
    #[arg(long)]
    pub no_autodetect: bool,

    /// How often the pipeline status is polled, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// How long each process gets to exit before it is killed, in seconds
    #[arg(long, default_value_t = 10)]
    pub stop_timeout_secs: u64,

    /// Directory for the rolling log file and tool debug logs
    #[arg(long, env = "STREAMER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Print errors as a JSON object on stdout
    #[arg(long)]
    pub json_errors: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    pub fn logging(&self) -> LoggingOptions {
        LoggingOptions {
            verbose: self.verbose,
            quiet: self.quiet,
            log_dir: self.log_dir.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["streamer-cli", "-i", "in.toml", "-p", "pipe.toml"]).unwrap();
        assert_eq!(args.output, "output_files");
        assert_eq!(args.poll_interval(), Duration::from_secs(1));
        assert_eq!(args.stop_timeout(), Duration::from_secs(10));
        assert!(args.bitrate_config.is_none());
        assert!(!args.json_errors);
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["streamer-cli", "-i", "a", "-p", "b", "-v", "-q"]).is_err());
    }
}
