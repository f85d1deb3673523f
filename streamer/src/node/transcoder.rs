//! FFmpeg command line for the transcoding node.
//!
//! One FFmpeg process reads every input of a period and writes each planned
//! output stream, as fragmented MP4 (or WebVTT for text), into its own pipe.

use std::path::{Path, PathBuf};

use super::process::{CommandSpec, OutputSink};
use crate::config::{AudioCodec, Input, InputType, PipelineConfig, VideoCodec};
use crate::error::ConfigError;
use crate::stream::{OutputKind, OutputStream};

const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// An input as the transcoder sees it.
#[derive(Debug, Clone)]
pub struct TranscoderInput<'a> {
    pub input: &'a Input,
    /// What `-i` reads: the input name, or a pipe fed by an upstream node.
    pub source: String,
}

/// An output stream and the pipe it is written to.
#[derive(Debug, Clone)]
pub struct TranscoderOutput<'a> {
    pub stream: &'a OutputStream,
    pub pipe: PathBuf,
}

pub fn log_file_name(index: usize) -> String {
    format!("TranscoderNode-{index}.log")
}

/// Builds the full FFmpeg invocation. `index` numbers the transcoder within
/// the run and names its debug log.
pub fn command(
    ffmpeg: &Path,
    index: usize,
    inputs: &[TranscoderInput<'_>],
    outputs: &[TranscoderOutput<'_>],
    pipeline: &PipelineConfig,
    log_dir: &Path,
) -> Result<CommandSpec, ConfigError> {
    let mut spec = CommandSpec::new(ffmpeg);
    // The pipes already exist, and an overwrite prompt would block forever.
    spec.arg("-y");

    if pipeline.quiet {
        spec.args(["-loglevel", "error"]);
    }

    if pipeline.hwaccel_api == "vaapi"
        && outputs.iter().any(|o| o.stream.is_hardware_accelerated())
    {
        spec.args(["-vaapi_device", VAAPI_DEVICE]);
    }

    for entry in inputs {
        let input = entry.input;
        spec.args(input.input_args()?);
        spec.args(input.extra_args()?);

        if pipeline.is_live() {
            // Raw frames from devices queue up here, so the default of 8
            // packets is too small.
            spec.args(["-thread_queue_size", "200"]);
        }
        if input.input_type == InputType::File {
            if let Some(start) = &input.start_time {
                spec.args(["-ss", start.as_str()]);
            }
            if let Some(end) = &input.end_time {
                spec.args(["-to", end.as_str()]);
            }
        }
        spec.args(["-i", entry.source.as_str()]);
    }

    for output in outputs {
        let stream = output.stream;
        let input = inputs
            .get(stream.input_index)
            .map(|entry| entry.input)
            .ok_or_else(|| {
                ConfigError::malformed(
                    "InputConfig",
                    "inputs",
                    format!("no input #{} for output {}", stream.input_index, stream.file_stem()),
                )
            })?;

        spec.arg("-map")
            .arg(format!("{}:{}", stream.input_index, input.stream_specifier()));
        match &stream.kind {
            OutputKind::Audio {
                codec, channels, ..
            } => spec.args(encode_audio(stream, *codec, *channels, input, pipeline)),
            OutputKind::Video {
                codec, max_height, ..
            } => spec.args(encode_video(stream, *codec, *max_height, input, pipeline)?),
            OutputKind::Text => spec.args(["-f", "webvtt"]),
        };
        spec.arg(output.pipe.to_string_lossy());
    }

    if pipeline.debug_logs {
        let report = log_dir.join(log_file_name(index));
        spec.env("FFREPORT", format!("file={}:level=32", report.display()));
    }
    spec.output = OutputSink::Log;
    Ok(spec)
}

fn bitrate(stream: &OutputStream) -> String {
    stream
        .bitrate
        .as_ref()
        .map(|b| b.as_str().to_string())
        .unwrap_or_default()
}

fn encode_audio(
    stream: &OutputStream,
    codec: AudioCodec,
    channels: u32,
    input: &Input,
    pipeline: &PipelineConfig,
) -> Vec<String> {
    let mut args = vec!["-vn".to_string(), "-ac".to_string(), channels.to_string()];

    let mut filters = Vec::new();
    if channels == 6 {
        // The packager rejects FFmpeg's default 5.1(side) layout.
        filters.push("channelmap=channel_layout=5.1".to_string());
    }
    filters.extend(input.filters.iter().cloned());

    args.extend([
        "-c:a".to_string(),
        codec.ffmpeg_codec().to_string(),
        "-b:a".to_string(),
        bitrate(stream),
        "-f".to_string(),
        "mp4".to_string(),
        "-frag_duration".to_string(),
        pipeline.fragment_duration_us().to_string(),
        // Opus in MP4 is experimental.
        "-strict".to_string(),
        "experimental".to_string(),
    ]);

    if !filters.is_empty() {
        args.push("-af".to_string());
        args.push(filters.join(","));
    }
    args
}

fn encode_video(
    stream: &OutputStream,
    codec: VideoCodec,
    max_height: u32,
    input: &Input,
    pipeline: &PipelineConfig,
) -> Result<Vec<String>, ConfigError> {
    let frame_rate = input
        .frame_rate
        .ok_or_else(|| ConfigError::missing("Input", "frame_rate"))?;
    let mut args: Vec<String> = Vec::new();
    let mut filters: Vec<String> = Vec::new();

    if input.is_interlaced == Some(true) {
        filters.push("pp=fd".to_string());
        args.extend(["-r".to_string(), frame_rate.to_string()]);
    }
    filters.extend(input.filters.iter().cloned());

    // -2 keeps the aspect ratio with an even width.
    if codec.is_hardware_accelerated() && pipeline.hwaccel_api == "vaapi" {
        filters.push("format=nv12".to_string());
        filters.push("hwupload".to_string());
        filters.push(format!("scale_vaapi=-2:{max_height}"));
    } else {
        filters.push(format!("scale=-2:{max_height}"));
    }
    // Otherwise rounding leaves SAR values like 5120:5123 in the manifests.
    filters.push("setsar=1:1".to_string());

    if codec == VideoCodec::H264 {
        if pipeline.is_live() {
            args.extend(["-preset", "ultrafast"].map(String::from));
        } else {
            args.extend(["-preset", "slow", "-flags", "+loop"].map(String::from));
        }
    }

    match codec.base_codec() {
        VideoCodec::H264 => {
            let profile = if max_height >= 720 { "high" } else { "main" };
            args.extend(
                ["-pix_fmt", "yuv420p", "-flags", "+cgop", "-profile:v", profile]
                    .map(String::from),
            );
        }
        VideoCodec::Vp9 => args.extend(["-row-mt", "1"].map(String::from)),
        VideoCodec::Av1 => args.extend(
            [
                "-cpu-used",
                "8",
                "-row-mt",
                "1",
                "-tiles",
                "2x2",
                "-strict",
                "experimental",
            ]
            .map(String::from),
        ),
        VideoCodec::HardwareH264 | VideoCodec::HardwareVp9 => {}
    }

    let keyframe_interval = (pipeline.segment_size * frame_rate) as u64;
    args.extend([
        "-an".to_string(),
        "-c:v".to_string(),
        codec.ffmpeg_codec(&pipeline.hwaccel_api)?,
        "-b:v".to_string(),
        bitrate(stream),
        "-f".to_string(),
        "mp4".to_string(),
        "-movflags".to_string(),
        "+frag_keyframe".to_string(),
        "-frag_duration".to_string(),
        pipeline.fragment_duration_us().to_string(),
        "-keyint_min".to_string(),
        keyframe_interval.to_string(),
        "-g".to_string(),
        keyframe_interval.to_string(),
        "-vf".to_string(),
        filters.join(","),
    ]);
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BitrateConfig, MediaType, StreamingMode};
    use crate::stream::plan_outputs;

    fn build(
        inputs: &[Input],
        pipeline: &PipelineConfig,
    ) -> CommandSpec {
        let streams = plan_outputs(inputs, pipeline, &BitrateConfig::default()).unwrap();
        let entries: Vec<_> = inputs
            .iter()
            .map(|input| TranscoderInput {
                input,
                source: input.name.clone(),
            })
            .collect();
        let outputs: Vec<_> = streams
            .iter()
            .enumerate()
            .map(|(i, stream)| TranscoderOutput {
                stream,
                pipe: PathBuf::from(format!("/p/{i}")),
            })
            .collect();
        command(Path::new("ffmpeg"), 0, &entries, &outputs, pipeline, Path::new("/logs")).unwrap()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn time_range_precedes_input() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.resolutions = Some(vec!["144p".into()]);
        let input = Input::new(InputType::File, "in.mp4", MediaType::Video)
            .with_resolution("1080p")
            .with_frame_rate(25.0)
            .with_time_range(Some("00:00:02"), Some("00:00:05"));

        let spec = build(&[input], &pipeline);
        let line = spec.render();
        assert!(line.starts_with("ffmpeg -y -ss 00:00:02 -to 00:00:05 -i in.mp4 -map 0:v:0"));
        assert!(line.ends_with("/p/0"));
        assert!(!spec.args.contains(&"-thread_queue_size".to_string()));
    }

    #[test]
    fn vod_h264_settings() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.resolutions = Some(vec!["720p".into(), "480p".into()]);
        let input = Input::new(InputType::File, "in.mp4", MediaType::Video)
            .with_resolution("1080p")
            .with_frame_rate(30.0);

        let spec = build(&[input], &pipeline);
        assert_eq!(value_after(&spec.args, "-profile:v"), vec!["high", "main"]);
        assert_eq!(value_after(&spec.args, "-preset"), vec!["slow", "slow"]);
        assert_eq!(value_after(&spec.args, "-g"), vec!["120", "120"]);
        assert_eq!(value_after(&spec.args, "-frag_duration"), vec!["4000000", "4000000"]);
        assert_eq!(
            value_after(&spec.args, "-vf"),
            vec!["scale=-2:720,setsar=1:1", "scale=-2:480,setsar=1:1"]
        );
        assert!(spec.env.is_empty());
    }

    #[test]
    fn live_interlaced_input() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Live);
        pipeline.resolutions = Some(vec!["480p".into()]);
        let mut input = Input::new(InputType::Webcam, "/dev/video0", MediaType::Video)
            .with_resolution("480p")
            .with_frame_rate(29.97);
        input.is_interlaced = Some(true);
        input.filters = vec!["hflip".into()];

        let spec = build(&[input], &pipeline);
        assert_eq!(value_after(&spec.args, "-thread_queue_size"), vec!["200"]);
        assert_eq!(value_after(&spec.args, "-preset"), vec!["ultrafast"]);
        assert_eq!(value_after(&spec.args, "-r"), vec!["29.97"]);
        assert_eq!(
            value_after(&spec.args, "-vf"),
            vec!["pp=fd,hflip,scale=-2:480,setsar=1:1"]
        );
    }

    #[test]
    fn vaapi_hardware_encoding() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.hwaccel_api = "vaapi".into();
        pipeline.video_codecs = vec![VideoCodec::HardwareH264];
        pipeline.resolutions = Some(vec!["360p".into()]);
        let input = Input::new(InputType::File, "in.mp4", MediaType::Video)
            .with_resolution("360p")
            .with_frame_rate(24.0);

        let spec = build(&[input], &pipeline);
        assert_eq!(value_after(&spec.args, "-vaapi_device"), vec![VAAPI_DEVICE]);
        assert_eq!(value_after(&spec.args, "-c:v"), vec!["h264_vaapi"]);
        assert!(value_after(&spec.args, "-preset").is_empty());
        assert_eq!(
            value_after(&spec.args, "-vf"),
            vec!["format=nv12,hwupload,scale_vaapi=-2:360,setsar=1:1"]
        );
    }

    #[test]
    fn surround_audio_and_text_outputs() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.channel_layouts = Some(vec!["surround".into()]);
        pipeline.debug_logs = true;
        let audio = Input::new(InputType::File, "in.mkv", MediaType::Audio)
            .with_channel_layout("surround")
            .with_language("de");
        let mut text = Input::new(InputType::File, "in.mkv", MediaType::Text);
        text.track_num = 2;

        let spec = build(&[audio, text], &pipeline);
        assert_eq!(value_after(&spec.args, "-map"), vec!["0:a:0", "1:s:2"]);
        assert_eq!(value_after(&spec.args, "-ac"), vec!["6"]);
        assert_eq!(value_after(&spec.args, "-af"), vec!["channelmap=channel_layout=5.1"]);
        assert_eq!(value_after(&spec.args, "-c:a"), vec!["aac"]);
        assert!(spec.render().ends_with("-f webvtt /p/1"));
        assert_eq!(
            spec.env,
            vec![(
                "FFREPORT".to_string(),
                "file=/logs/TranscoderNode-0.log:level=32".to_string()
            )]
        );
    }
}
