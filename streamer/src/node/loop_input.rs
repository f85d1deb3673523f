//! Replays a finite file into a pipe forever, in real time.

use std::path::Path;

use super::process::{CommandSpec, OutputSink};

/// `ffmpeg` command copying `file` into `pipe` as MPEG-TS, looping at the
/// end of the file.
pub fn command(ffmpeg: &Path, file: &str, pipe: &Path, quiet: bool) -> CommandSpec {
    let mut spec = CommandSpec::new(ffmpeg);
    spec.args(["-hide_banner", "-stream_loop", "-1", "-re"])
        .args(["-loglevel", if quiet { "error" } else { "warning" }])
        .args(["-i", file])
        .args(["-map", "0", "-c", "copy", "-f", "mpegts", "-y"])
        .arg(pipe.to_string_lossy());
    spec.output = OutputSink::Log;
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_every_stream_into_mpegts() {
        let spec = command(Path::new("ffmpeg"), "in.mp4", Path::new("/tmp/p/0000"), false);
        assert_eq!(
            spec.render(),
            "ffmpeg -hide_banner -stream_loop -1 -re -loglevel warning -i in.mp4 \
             -map 0 -c copy -f mpegts -y /tmp/p/0000"
        );
        assert!(!spec.own_group);
    }

    #[test]
    fn quiet_lowers_log_level() {
        let spec = command(Path::new("ffmpeg"), "in.mp4", Path::new("p"), true);
        let pos = spec.args.iter().position(|a| a == "-loglevel").unwrap();
        assert_eq!(spec.args[pos + 1], "error");
    }
}
