//! Output planning: which elementary streams a period produces.

use std::path::PathBuf;

use crate::config::{
    AudioCodec, Bitrate, BitrateConfig, Input, MediaType, PipelineConfig, VideoCodec,
};
use crate::error::ConfigError;
use crate::pipe::PipeId;

#[derive(Debug, Clone, PartialEq)]
pub enum OutputKind {
    Audio {
        codec: AudioCodec,
        layout: String,
        channels: u32,
    },
    Video {
        codec: VideoCodec,
        resolution: String,
        max_height: u32,
    },
    Text,
}

/// Where the packager reads a stream from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// Written by the transcoder into a pipe.
    Pipe(PipeId),
    /// Handed over untouched from an input file.
    File(PathBuf),
}

/// One elementary stream the packager consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputStream {
    /// Index of the source input within its period.
    pub input_index: usize,
    pub kind: OutputKind,
    pub bitrate: Option<Bitrate>,
    pub language: String,
    pub drm_label: Option<String>,
    pub skip_encryption: u32,
    pub source: Option<StreamSource>,
}

impl OutputStream {
    pub fn media_type(&self) -> MediaType {
        match self.kind {
            OutputKind::Audio { .. } => MediaType::Audio,
            OutputKind::Video { .. } => MediaType::Video,
            OutputKind::Text => MediaType::Text,
        }
    }

    /// Text inputs the packager reads natively bypass the transcoder.
    pub fn skips_transcoding(&self) -> bool {
        matches!(self.source, Some(StreamSource::File(_)))
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        matches!(&self.kind, OutputKind::Video { codec, .. } if codec.is_hardware_accelerated())
    }

    pub fn output_format(&self) -> &'static str {
        match &self.kind {
            OutputKind::Audio { codec, .. } => codec.output_format(),
            OutputKind::Video { codec, .. } => codec.output_format(),
            OutputKind::Text => "mp4",
        }
    }

    /// WebM output can only be described by a DASH manifest.
    pub fn is_dash_only(&self) -> bool {
        self.output_format() == "webm"
    }

    fn bitrate_str(&self) -> &str {
        self.bitrate.as_ref().map(Bitrate::as_str).unwrap_or("")
    }

    /// Common part of every file name of this stream.
    pub fn file_stem(&self) -> String {
        match &self.kind {
            OutputKind::Audio {
                codec, channels, ..
            } => format!(
                "audio_{}_{}c_{}_{}",
                self.language,
                channels,
                self.bitrate_str(),
                codec.as_str()
            ),
            OutputKind::Video {
                codec, resolution, ..
            } => format!(
                "video_{}_{}_{}",
                resolution,
                self.bitrate_str(),
                codec.file_label()
            ),
            OutputKind::Text => format!("text_{}", self.language),
        }
    }

    pub fn init_segment_name(&self) -> String {
        format!("{}_init.{}", self.file_stem(), self.output_format())
    }

    /// Segment template with the packager's `$Number$` placeholder.
    pub fn media_segment_name(&self) -> String {
        format!("{}_$Number$.{}", self.file_stem(), self.output_format())
    }

    pub fn single_segment_name(&self) -> String {
        format!("{}.{}", self.file_stem(), self.output_format())
    }
}

fn language_of(input: &Input) -> String {
    input.language_or_und().to_string()
}

/// Every output stream for one period's inputs.
///
/// Resolutions and channel layouts above the input's are skipped, since
/// upscaling and upmixing add cost without adding quality.
pub fn plan_outputs(
    inputs: &[Input],
    pipeline: &PipelineConfig,
    bitrates: &BitrateConfig,
) -> Result<Vec<OutputStream>, ConfigError> {
    let resolution_names = pipeline.resolution_names(bitrates);
    let layout_names = pipeline.channel_layout_names(bitrates);
    let mut outputs = Vec::new();

    for (index, input) in inputs.iter().enumerate() {
        let base = OutputStream {
            input_index: index,
            kind: OutputKind::Text,
            bitrate: None,
            language: language_of(input),
            drm_label: input.drm_label.clone(),
            skip_encryption: input.skip_encryption,
            source: None,
        };

        match input.media_type {
            MediaType::Audio => {
                let input_layout = input
                    .channel_layout
                    .as_deref()
                    .and_then(|name| bitrates.channel_layout(name))
                    .ok_or_else(|| ConfigError::missing("Input", "channel_layout"))?;

                for codec in &pipeline.audio_codecs {
                    for name in &layout_names {
                        let layout = bitrates.channel_layout(name).ok_or_else(|| {
                            unknown_name("PipelineConfig", "channel_layouts", name)
                        })?;
                        if input_layout.max_channels < layout.max_channels {
                            continue;
                        }
                        let bitrate = layout.bitrate(*codec).cloned().ok_or_else(|| {
                            missing_bitrate("AudioChannelLayout", name, codec.as_str())
                        })?;
                        outputs.push(OutputStream {
                            kind: OutputKind::Audio {
                                codec: *codec,
                                layout: name.clone(),
                                channels: layout.max_channels,
                            },
                            bitrate: Some(bitrate),
                            ..base.clone()
                        });
                    }
                }
            }
            MediaType::Video => {
                let input_resolution = input
                    .resolution
                    .as_deref()
                    .and_then(|name| bitrates.resolution(name))
                    .ok_or_else(|| ConfigError::missing("Input", "resolution"))?;

                for codec in &pipeline.video_codecs {
                    for name in &resolution_names {
                        let resolution = bitrates
                            .resolution(name)
                            .ok_or_else(|| unknown_name("PipelineConfig", "resolutions", name))?;
                        if input_resolution.compare(resolution).is_lt() {
                            continue;
                        }
                        let bitrate = resolution.bitrate(*codec).cloned().ok_or_else(|| {
                            missing_bitrate("VideoResolution", name, codec.as_str())
                        })?;
                        outputs.push(OutputStream {
                            kind: OutputKind::Video {
                                codec: *codec,
                                resolution: name.clone(),
                                max_height: resolution.max_height,
                            },
                            bitrate: Some(bitrate),
                            ..base.clone()
                        });
                    }
                }
            }
            MediaType::Text => {
                let source = input
                    .is_packager_native_text()
                    .then(|| StreamSource::File(PathBuf::from(&input.name)));
                outputs.push(OutputStream { source, ..base });
            }
        }
    }

    Ok(outputs)
}

fn unknown_name(class: &'static str, field: &str, name: &str) -> ConfigError {
    ConfigError::malformed(class, field, format!("unknown name \"{name}\""))
}

fn missing_bitrate(class: &'static str, name: &str, codec: &str) -> ConfigError {
    ConfigError::malformed(class, name, format!("no bitrate defined for codec {codec}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InputType, StreamingMode};

    fn video_input(resolution: &str) -> Input {
        Input::new(InputType::File, "in.mp4", MediaType::Video)
            .with_resolution(resolution)
            .with_frame_rate(24.0)
    }

    #[test]
    fn resolutions_above_input_are_skipped() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.resolutions = Some(
            ["4k", "1440p", "1080p", "720p", "480p", "240p", "144p"]
                .map(String::from)
                .to_vec(),
        );
        let outputs =
            plan_outputs(&[video_input("1080p")], &pipeline, &BitrateConfig::default()).unwrap();
        let names: Vec<_> = outputs
            .iter()
            .map(|o| match &o.kind {
                OutputKind::Video { resolution, .. } => resolution.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["1080p", "720p", "480p", "240p", "144p"]);
    }

    #[test]
    fn channel_layouts_never_upmix() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.audio_codecs = vec![AudioCodec::Aac, AudioCodec::Opus];
        let input = Input::new(InputType::File, "in.mp4", MediaType::Audio)
            .with_channel_layout("stereo")
            .with_language("en");
        let outputs = plan_outputs(&[input], &pipeline, &BitrateConfig::default()).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].file_stem(), "audio_en_2c_128k_aac");
        assert_eq!(outputs[1].init_segment_name(), "audio_en_2c_64k_opus_init.webm");
        assert!(outputs[1].is_dash_only());
    }

    #[test]
    fn file_names_follow_segmenting_policy() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.video_codecs = vec![VideoCodec::HardwareH264];
        pipeline.resolutions = Some(vec!["720p".into()]);
        let outputs =
            plan_outputs(&[video_input("720p")], &pipeline, &BitrateConfig::default()).unwrap();
        let out = &outputs[0];
        assert!(out.is_hardware_accelerated());
        assert_eq!(out.media_segment_name(), "video_720p_2M_hw_h264_$Number$.mp4");
        assert_eq!(out.single_segment_name(), "video_720p_2M_hw_h264.mp4");
    }

    #[test]
    fn native_text_is_handed_over_as_file() {
        let pipeline = PipelineConfig::new(StreamingMode::Vod);
        let vtt = Input::new(InputType::File, "subs.vtt", MediaType::Text);
        let mkv = Input::new(InputType::File, "movie.mkv", MediaType::Text).with_language("fr");
        let outputs = plan_outputs(&[vtt, mkv], &pipeline, &BitrateConfig::default()).unwrap();
        assert!(outputs[0].skips_transcoding());
        assert_eq!(outputs[0].file_stem(), "text_und");
        assert!(!outputs[1].skips_transcoding());
        assert_eq!(outputs[1].single_segment_name(), "text_fr.mp4");
        assert_eq!(outputs[1].input_index, 1);
    }
}
