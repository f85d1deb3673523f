//! Codecs, bitrates and the named resolution / channel-layout tables.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::error::ConfigError;

static BITRATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d.]+[kM]?$").unwrap());

/// A bitrate in bits per second with an optional `k` or `M` suffix,
/// such as `500k` or `7.5M`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bitrate(String);

impl Bitrate {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Bitrate {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if BITRATE_REGEX.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(format!(
                "invalid value: {value:?} is not a bitrate string (e.g. 500k or 7.5M)"
            ))
        }
    }
}

impl TryFrom<&str> for Bitrate {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<Bitrate> for String {
    fn from(value: Bitrate) -> Self {
        value.0
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Ac3,
    Eac3,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Opus => "opus",
            Self::Ac3 => "ac3",
            Self::Eac3 => "eac3",
        }
    }

    /// Encoder name understood by FFmpeg.
    pub fn ffmpeg_codec(&self) -> &'static str {
        match self {
            // The native opus encoder is experimental.
            Self::Opus => "libopus",
            other => other.as_str(),
        }
    }

    /// Container used for this codec's elementary stream.
    pub fn output_format(&self) -> &'static str {
        match self {
            Self::Opus => "webm",
            Self::Aac | Self::Ac3 | Self::Eac3 => "mp4",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video codecs. The `hw:` variants select a hardware encoder through the
/// pipeline's `hwaccel_api`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VideoCodec {
    #[serde(rename = "h264")]
    H264,
    #[serde(rename = "hw:h264")]
    HardwareH264,
    #[serde(rename = "vp9")]
    Vp9,
    #[serde(rename = "hw:vp9")]
    HardwareVp9,
    #[serde(rename = "av1")]
    Av1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::HardwareH264 => "hw:h264",
            Self::Vp9 => "vp9",
            Self::HardwareVp9 => "hw:vp9",
            Self::Av1 => "av1",
        }
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        matches!(self, Self::HardwareH264 | Self::HardwareVp9)
    }

    /// The same codec without hardware acceleration.
    pub fn base_codec(&self) -> VideoCodec {
        match self {
            Self::HardwareH264 => Self::H264,
            Self::HardwareVp9 => Self::Vp9,
            other => *other,
        }
    }

    /// Encoder name understood by FFmpeg, e.g. `h264` or `h264_vaapi`.
    pub fn ffmpeg_codec(&self, hwaccel_api: &str) -> Result<String, ConfigError> {
        if !self.is_hardware_accelerated() {
            return Ok(self.as_str().to_string());
        }
        if hwaccel_api.is_empty() {
            return Err(ConfigError::malformed(
                "PipelineConfig",
                "hwaccel_api",
                format!("{} requires a hardware acceleration API on this platform", self),
            ));
        }
        Ok(format!("{}_{}", self.base_codec().as_str(), hwaccel_api))
    }

    /// Container used for this codec's elementary stream.
    pub fn output_format(&self) -> &'static str {
        match self.base_codec() {
            Self::Vp9 => "webm",
            _ => "mp4",
        }
    }

    /// Codec name used in output file names (`:` is not path friendly).
    pub fn file_label(&self) -> String {
        self.as_str().replace(':', "_")
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named audio channel layout, e.g. `stereo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioChannelLayout {
    pub max_channels: u32,
    pub bitrates: BTreeMap<AudioCodec, Bitrate>,
}

impl AudioChannelLayout {
    pub fn bitrate(&self, codec: AudioCodec) -> Option<&Bitrate> {
        self.bitrates.get(&codec)
    }
}

/// A named video resolution bucket, e.g. `1080p`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoResolution {
    pub max_width: u32,
    pub max_height: u32,
    /// Unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frame_rate: Option<f64>,
    pub bitrates: BTreeMap<VideoCodec, Bitrate>,
}

impl VideoResolution {
    pub fn frame_rate_limit(&self) -> f64 {
        self.max_frame_rate.unwrap_or(f64::INFINITY)
    }

    /// Orders by `(max_width, max_height, max_frame_rate)`.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.max_width
            .cmp(&other.max_width)
            .then(self.max_height.cmp(&other.max_height))
            .then(
                self.frame_rate_limit()
                    .partial_cmp(&other.frame_rate_limit())
                    .unwrap_or(Ordering::Equal),
            )
    }

    /// Hardware variants fall back to the software codec's bitrate.
    pub fn bitrate(&self, codec: VideoCodec) -> Option<&Bitrate> {
        self.bitrates
            .get(&codec)
            .or_else(|| self.bitrates.get(&codec.base_codec()))
    }
}

/// Named resolutions and channel layouts available to a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BitrateConfig {
    #[serde(default = "default_audio_channel_layouts")]
    pub audio_channel_layouts: BTreeMap<String, AudioChannelLayout>,
    #[serde(default = "default_video_resolutions")]
    pub video_resolutions: BTreeMap<String, VideoResolution>,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            audio_channel_layouts: default_audio_channel_layouts(),
            video_resolutions: default_video_resolutions(),
        }
    }
}

impl BitrateConfig {
    pub fn resolution(&self, name: &str) -> Option<&VideoResolution> {
        self.video_resolutions.get(name)
    }

    pub fn channel_layout(&self, name: &str) -> Option<&AudioChannelLayout> {
        self.audio_channel_layouts.get(name)
    }

    /// Resolution names from smallest to largest.
    pub fn sorted_resolutions(&self) -> Vec<(&str, &VideoResolution)> {
        let mut entries: Vec<_> = self
            .video_resolutions
            .iter()
            .map(|(name, res)| (name.as_str(), res))
            .collect();
        entries.sort_by(|a, b| a.1.compare(b.1));
        entries
    }

    /// Channel layout names from fewest to most channels.
    pub fn sorted_channel_layouts(&self) -> Vec<(&str, &AudioChannelLayout)> {
        let mut entries: Vec<_> = self
            .audio_channel_layouts
            .iter()
            .map(|(name, layout)| (name.as_str(), layout))
            .collect();
        entries.sort_by_key(|(_, layout)| layout.max_channels);
        entries
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, res) in &self.video_resolutions {
            if res.max_width == 0 || res.max_height == 0 {
                return Err(ConfigError::malformed(
                    "VideoResolution",
                    name.clone(),
                    "max_width and max_height must be positive",
                ));
            }
            if let Some(rate) = res.max_frame_rate
                && (rate.is_nan() || rate <= 0.0)
            {
                return Err(ConfigError::malformed(
                    "VideoResolution",
                    name.clone(),
                    "max_frame_rate must be positive",
                ));
            }
        }
        for (name, layout) in &self.audio_channel_layouts {
            if layout.max_channels == 0 {
                return Err(ConfigError::malformed(
                    "AudioChannelLayout",
                    name.clone(),
                    "max_channels must be positive",
                ));
            }
        }
        Ok(())
    }
}

fn audio_bitrates(table: [(AudioCodec, &str); 4]) -> BTreeMap<AudioCodec, Bitrate> {
    table
        .into_iter()
        .map(|(codec, rate)| (codec, Bitrate(rate.to_string())))
        .collect()
}

fn default_audio_channel_layouts() -> BTreeMap<String, AudioChannelLayout> {
    use AudioCodec::*;

    let mut layouts = BTreeMap::new();
    layouts.insert(
        "stereo".to_string(),
        AudioChannelLayout {
            max_channels: 2,
            bitrates: audio_bitrates([(Aac, "128k"), (Opus, "64k"), (Ac3, "192k"), (Eac3, "96k")]),
        },
    );
    layouts.insert(
        "surround".to_string(),
        AudioChannelLayout {
            max_channels: 6,
            bitrates: audio_bitrates([
                (Aac, "256k"),
                (Opus, "128k"),
                (Ac3, "384k"),
                (Eac3, "192k"),
            ]),
        },
    );
    layouts
}

/// name, width, height, frame rate cap, bitrates for h264 / vp9 / av1
type ResolutionRow = (&'static str, u32, u32, Option<f64>, [&'static str; 3]);

const DEFAULT_RESOLUTIONS: &[ResolutionRow] = &[
    ("144p", 256, 144, None, ["108k", "96k", "72k"]),
    ("240p", 426, 240, None, ["242k", "151k", "114k"]),
    ("360p", 640, 360, None, ["400k", "277k", "210k"]),
    ("480p", 854, 480, None, ["1M", "512k", "389k"]),
    ("576p", 1024, 576, None, ["1.5M", "768k", "450k"]),
    ("720p", 1280, 720, Some(30.0), ["2M", "1M", "512k"]),
    ("720p-hfr", 1280, 720, None, ["3M", "2M", "778k"]),
    ("1080p", 1920, 1080, Some(30.0), ["4M", "2M", "850k"]),
    ("1080p-hfr", 1920, 1080, None, ["5M", "3M", "1M"]),
    ("1440p", 2560, 1440, Some(30.0), ["9M", "6M", "3.5M"]),
    ("1440p-hfr", 2560, 1440, None, ["14M", "9M", "5M"]),
    ("4k", 4096, 2160, Some(30.0), ["17M", "12M", "6M"]),
    ("4k-hfr", 4096, 2160, None, ["25M", "18M", "9M"]),
    ("8k", 8192, 4320, Some(30.0), ["40M", "24M", "12M"]),
    ("8k-hfr", 8192, 4320, None, ["60M", "36M", "18M"]),
];

fn default_video_resolutions() -> BTreeMap<String, VideoResolution> {
    DEFAULT_RESOLUTIONS
        .iter()
        .map(|(name, width, height, frame_rate, [h264, vp9, av1])| {
            let bitrates = [
                (VideoCodec::H264, *h264),
                (VideoCodec::Vp9, *vp9),
                (VideoCodec::Av1, *av1),
            ]
            .into_iter()
            .map(|(codec, rate)| (codec, Bitrate(rate.to_string())))
            .collect();
            (
                name.to_string(),
                VideoResolution {
                    max_width: *width,
                    max_height: *height,
                    max_frame_rate: *frame_rate,
                    bitrates,
                },
            )
        })
        .collect()
}
