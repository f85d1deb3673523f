//! Input description: what to read and how to interpret it.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::bitrate::BitrateConfig;
use crate::error::ConfigError;

const INPUT: &str = "Input";
const INPUT_CONFIG: &str = "InputConfig";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// A track from a file.
    #[default]
    File,
    /// A file replayed forever in real time. Live only.
    LoopedFile,
    /// A webcam device, named by device path or platform device name.
    Webcam,
    /// A microphone device.
    Microphone,
    /// A shell command writing a stream to the path in
    /// `STREAMER_EXTERNAL_COMMAND_OUTPUT`.
    ExternalCommand,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::LoopedFile => "looped_file",
            Self::Webcam => "webcam",
            Self::Microphone => "microphone",
            Self::ExternalCommand => "external_command",
        }
    }

    /// Whether the input is a finite file on disk.
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File | Self::LoopedFile)
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Text,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single input track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Input {
    #[serde(default)]
    pub input_type: InputType,
    /// File path, device name, or shell command depending on `input_type`.
    pub name: String,
    /// Extra FFmpeg input arguments, split with shell quoting rules.
    #[serde(default)]
    pub extra_input_args: String,
    pub media_type: MediaType,
    #[serde(default)]
    pub frame_rate: Option<f64>,
    /// Name of a resolution in the bitrate config.
    #[serde(default)]
    pub resolution: Option<String>,
    /// Name of a channel layout in the bitrate config.
    #[serde(default)]
    pub channel_layout: Option<String>,
    /// Track number among tracks of the same media type.
    #[serde(default)]
    pub track_num: u32,
    #[serde(default)]
    pub is_interlaced: Option<bool>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub drm_label: Option<String>,
    #[serde(default)]
    pub skip_encryption: u32,
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Input {
    pub fn new(input_type: InputType, name: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            input_type,
            name: name.into(),
            extra_input_args: String::new(),
            media_type,
            frame_rate: None,
            resolution: None,
            channel_layout: None,
            track_num: 0,
            is_interlaced: None,
            language: None,
            start_time: None,
            end_time: None,
            drm_label: None,
            skip_encryption: 0,
            filters: Vec::new(),
        }
    }

    pub fn with_resolution(mut self, name: impl Into<String>) -> Self {
        self.resolution = Some(name.into());
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn with_channel_layout(mut self, name: impl Into<String>) -> Self {
        self.channel_layout = Some(name.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_time_range(
        mut self,
        start_time: Option<impl Into<String>>,
        end_time: Option<impl Into<String>>,
    ) -> Self {
        self.start_time = start_time.map(Into::into);
        self.end_time = end_time.map(Into::into);
        self
    }

    /// FFmpeg stream specifier within this input, e.g. `v:0` or `s:2`.
    pub fn stream_specifier(&self) -> String {
        let prefix = match self.media_type {
            MediaType::Video => "v",
            MediaType::Audio => "a",
            MediaType::Text => "s",
        };
        format!("{}:{}", prefix, self.track_num)
    }

    /// Language for descriptors and file names; `und` when unknown.
    pub fn language_or_und(&self) -> &str {
        self.language.as_deref().unwrap_or("und")
    }

    /// Text tracks in these formats are handed to the packager untouched.
    pub fn is_packager_native_text(&self) -> bool {
        self.media_type == MediaType::Text
            && (self.name.ends_with(".vtt") || self.name.ends_with(".ttml"))
    }

    /// Input arguments the device input types always need, per platform.
    /// Also understood by ffprobe.
    pub fn input_args(&self) -> Result<Vec<String>, ConfigError> {
        let args: Option<&[&str]> = match self.input_type {
            InputType::Webcam => {
                if cfg!(target_os = "linux") {
                    Some(&["-f", "video4linux2"])
                } else if cfg!(target_os = "macos") {
                    Some(&["-f", "avfoundation", "-framerate", "30"])
                } else if cfg!(windows) {
                    Some(&["-f", "dshow"])
                } else {
                    None
                }
            }
            InputType::Microphone => {
                if cfg!(target_os = "linux") {
                    Some(&["-f", "pulse"])
                } else if cfg!(target_os = "macos") {
                    Some(&["-f", "avfoundation"])
                } else if cfg!(windows) {
                    Some(&["-f", "dshow"])
                } else {
                    None
                }
            }
            _ => return Ok(Vec::new()),
        };

        match args {
            Some(args) => Ok(args.iter().map(|s| s.to_string()).collect()),
            None => Err(ConfigError::malformed(
                INPUT,
                "input_type",
                format!("{} is not supported on this platform", self.input_type),
            )),
        }
    }

    /// `extra_input_args` split into arguments.
    pub fn extra_args(&self) -> Result<Vec<String>, ConfigError> {
        process_utils::split_command_line(&self.extra_input_args)
            .map_err(|e| ConfigError::malformed(INPUT, "extra_input_args", e.to_string()))
    }

    /// Field-level checks that need no probing.
    pub fn validate(&self, bitrates: &BitrateConfig) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::malformed(INPUT, "name", "must not be empty"));
        }

        if self.media_type == MediaType::Text {
            if self.input_type != InputType::File {
                return Err(ConfigError::malformed(
                    INPUT,
                    "input_type",
                    format!(
                        "text streams are not supported in input_type \"{}\"",
                        self.input_type
                    ),
                ));
            }
            let reason = "not supported with media_type \"text\"";
            self.disallow("start_time", self.start_time.is_some(), reason)?;
            self.disallow("end_time", self.end_time.is_some(), reason)?;
            self.disallow("filters", !self.filters.is_empty(), reason)?;
        }

        if self.input_type != InputType::File {
            let reason = "only valid when input_type is \"file\"";
            self.disallow("start_time", self.start_time.is_some(), reason)?;
            self.disallow("end_time", self.end_time.is_some(), reason)?;
        }

        if let Some(rate) = self.frame_rate
            && (rate.is_nan() || rate <= 0.0)
        {
            return Err(ConfigError::malformed(INPUT, "frame_rate", "must be positive"));
        }

        if let Some(name) = &self.resolution
            && bitrates.resolution(name).is_none()
        {
            return Err(ConfigError::malformed(
                INPUT,
                "resolution",
                format!("unknown resolution name \"{name}\""),
            ));
        }

        if let Some(name) = &self.channel_layout
            && bitrates.channel_layout(name).is_none()
        {
            return Err(ConfigError::malformed(
                INPUT,
                "channel_layout",
                format!("unknown channel layout name \"{name}\""),
            ));
        }

        self.input_args()?;
        self.extra_args()?;
        Ok(())
    }

    /// Checks that everything the graph needs is known, after autodetection.
    pub fn require_resolved(&self) -> Result<(), ConfigError> {
        match self.media_type {
            MediaType::Video => {
                if self.frame_rate.is_none() {
                    return Err(ConfigError::missing(INPUT, "frame_rate"));
                }
                if self.resolution.is_none() {
                    return Err(ConfigError::missing(INPUT, "resolution"));
                }
            }
            MediaType::Audio => {
                if self.channel_layout.is_none() {
                    return Err(ConfigError::missing(INPUT, "channel_layout"));
                }
            }
            MediaType::Text => {}
        }
        Ok(())
    }

    fn disallow(&self, field: &str, present: bool, reason: &str) -> Result<(), ConfigError> {
        if present {
            Err(ConfigError::malformed(INPUT, field, reason))
        } else {
            Ok(())
        }
    }
}

/// One period of a multi-period presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinglePeriod {
    pub inputs: Vec<Input>,
}

/// The entire input description: either a flat list of inputs or a list of
/// periods, never both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<Input>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiperiod_inputs_list: Option<Vec<SinglePeriod>>,
}

impl InputConfig {
    pub fn single(inputs: Vec<Input>) -> Self {
        Self {
            inputs: Some(inputs),
            multiperiod_inputs_list: None,
        }
    }

    pub fn multiperiod(periods: Vec<Vec<Input>>) -> Self {
        Self {
            inputs: None,
            multiperiod_inputs_list: Some(
                periods
                    .into_iter()
                    .map(|inputs| SinglePeriod { inputs })
                    .collect(),
            ),
        }
    }

    /// Enforces that exactly one of `inputs` and `multiperiod_inputs_list`
    /// is given.
    pub fn check_exclusive(&self) -> Result<(), ConfigError> {
        let has_inputs = self.inputs.as_ref().is_some_and(|v| !v.is_empty());
        let has_periods = self
            .multiperiod_inputs_list
            .as_ref()
            .is_some_and(|v| !v.is_empty());

        if self.inputs.is_some() && self.multiperiod_inputs_list.is_some() {
            return Err(ConfigError::conflicting(
                INPUT_CONFIG,
                "inputs",
                "multiperiod_inputs_list",
            ));
        }
        if !has_inputs && !has_periods {
            return Err(ConfigError::missing_exclusive(
                INPUT_CONFIG,
                "inputs",
                "multiperiod_inputs_list",
            ));
        }
        Ok(())
    }

    pub fn is_multiperiod(&self) -> bool {
        self.multiperiod_inputs_list.is_some()
    }

    /// The input lists, one per period. A flat config is a single period.
    pub fn periods(&self) -> Vec<&[Input]> {
        match (&self.inputs, &self.multiperiod_inputs_list) {
            (Some(inputs), _) => vec![inputs.as_slice()],
            (None, Some(periods)) => periods.iter().map(|p| p.inputs.as_slice()).collect(),
            (None, None) => Vec::new(),
        }
    }

    pub fn periods_mut(&mut self) -> Vec<&mut Vec<Input>> {
        match (&mut self.inputs, &mut self.multiperiod_inputs_list) {
            (Some(inputs), _) => vec![inputs],
            (None, Some(periods)) => periods.iter_mut().map(|p| &mut p.inputs).collect(),
            (None, None) => Vec::new(),
        }
    }

    pub fn all_inputs(&self) -> impl Iterator<Item = &Input> {
        self.periods().into_iter().flat_map(|period| period.iter())
    }

    pub fn validate(&self, bitrates: &BitrateConfig) -> Result<(), ConfigError> {
        self.check_exclusive()?;
        for period in self.periods() {
            if period.is_empty() {
                return Err(ConfigError::malformed(
                    "SinglePeriod",
                    "inputs",
                    "a period needs at least one input",
                ));
            }
        }
        for input in self.all_inputs() {
            input.validate(bitrates)?;
        }
        Ok(())
    }
}
