//! Pipeline description: streaming mode, outputs, segmenting and encryption.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::bitrate::{AudioCodec, BitrateConfig, VideoCodec};
use crate::error::ConfigError;

const PIPELINE_CONFIG: &str = "PipelineConfig";
const ENCRYPTION_CONFIG: &str = "EncryptionConfig";

/// Widevine UAT key server.
pub const UAT_SERVER: &str = "https://license.uat.widevine.com/cenc/getcontentkey/widevine_test";
pub const WIDEVINE_TEST_ACCOUNT: &str = "widevine_test";
pub const WIDEVINE_TEST_SIGNING_KEY: &str =
    "1ae8ccd0e7985cc0b6203a55855a1034afc252980e970ca90e5202689f947ab9";
pub const WIDEVINE_TEST_SIGNING_IV: &str = "d58ce954203b7c9a9a9d467f59839249";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// No natural end; runs until stopped.
    Live,
    /// Finite; ends when the input is exhausted.
    Vod,
}

impl StreamingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Vod => "vod",
        }
    }
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    Dash,
    Hls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionScheme {
    /// AES-128-CTR.
    #[default]
    Cenc,
    /// AES-128-CBC with pattern encryption.
    Cbcs,
}

impl ProtectionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cenc => "cenc",
            Self::Cbcs => "cbcs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionSystem {
    Widevine,
    FairPlay,
    PlayReady,
    Marlin,
    #[serde(rename = "CommonSystem")]
    Common,
}

impl ProtectionSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Widevine => "Widevine",
            Self::FairPlay => "FairPlay",
            Self::PlayReady => "PlayReady",
            Self::Marlin => "Marlin",
            Self::Common => "CommonSystem",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Keys come from a Widevine key server.
    #[default]
    Widevine,
    /// Keys are given directly.
    Raw,
}

/// A DASH `UTCTiming` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UtcTimingPair {
    pub scheme_id_uri: String,
    pub value: String,
}

/// One raw encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawKey {
    /// A DRM label such as `AUDIO`, `SD`, `HD`; the default key when absent.
    #[serde(default)]
    pub label: Option<String>,
    pub key_id: String,
    pub key: String,
}

fn random_content_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().to_uppercase()
}

fn default_key_server_url() -> String {
    UAT_SERVER.to_string()
}

fn default_signer() -> String {
    WIDEVINE_TEST_ACCOUNT.to_string()
}

fn default_signing_key() -> String {
    WIDEVINE_TEST_SIGNING_KEY.to_string()
}

fn default_signing_iv() -> String {
    WIDEVINE_TEST_SIGNING_IV.to_string()
}

fn default_clear_lead() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionConfig {
    /// All other settings are ignored unless set.
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub encryption_mode: EncryptionMode,
    #[serde(default)]
    pub protection_systems: Vec<ProtectionSystem>,
    /// Concatenated PSSH boxes in hex. Raw mode only.
    #[serde(default)]
    pub pssh: Option<String>,
    /// Raw mode only.
    #[serde(default)]
    pub iv: Option<String>,
    /// Raw mode only.
    #[serde(default)]
    pub keys: Vec<RawKey>,
    #[serde(default = "random_content_id")]
    pub content_id: String,
    #[serde(default = "default_key_server_url")]
    pub key_server_url: String,
    #[serde(default = "default_signer")]
    pub signer: String,
    #[serde(default = "default_signing_key")]
    pub signing_key: String,
    #[serde(default = "default_signing_iv")]
    pub signing_iv: String,
    #[serde(default)]
    pub protection_scheme: ProtectionScheme,
    /// Seconds of clear media at the start of the stream.
    #[serde(default = "default_clear_lead")]
    pub clear_lead: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enable: false,
            encryption_mode: EncryptionMode::default(),
            protection_systems: Vec::new(),
            pssh: None,
            iv: None,
            keys: Vec::new(),
            content_id: random_content_id(),
            key_server_url: default_key_server_url(),
            signer: default_signer(),
            signing_key: default_signing_key(),
            signing_iv: default_signing_iv(),
            protection_scheme: ProtectionScheme::default(),
            clear_lead: default_clear_lead(),
        }
    }
}

fn check_hex(class: &'static str, field: &str, value: &str) -> Result<(), ConfigError> {
    hex::decode(value)
        .map(|_| ())
        .map_err(|e| ConfigError::malformed(class, field, format!("not a hex string: {e}")))
}

impl EncryptionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enable {
            return Ok(());
        }

        match self.encryption_mode {
            EncryptionMode::Widevine => {
                let reason = "cannot be set when encryption_mode is \"widevine\"";
                if !self.keys.is_empty() {
                    return Err(ConfigError::malformed(ENCRYPTION_CONFIG, "keys", reason));
                }
                if self.pssh.is_some() {
                    return Err(ConfigError::malformed(ENCRYPTION_CONFIG, "pssh", reason));
                }
                if self.iv.is_some() {
                    return Err(ConfigError::malformed(ENCRYPTION_CONFIG, "iv", reason));
                }
                check_hex(ENCRYPTION_CONFIG, "content_id", &self.content_id)?;
                check_hex(ENCRYPTION_CONFIG, "signing_key", &self.signing_key)?;
                check_hex(ENCRYPTION_CONFIG, "signing_iv", &self.signing_iv)?;
            }
            EncryptionMode::Raw => {
                if self.keys.is_empty() {
                    return Err(ConfigError::malformed(
                        ENCRYPTION_CONFIG,
                        "keys",
                        "at least one key must be specified",
                    ));
                }
                for key in &self.keys {
                    check_hex("RawKeyConfig", "key_id", &key.key_id)?;
                    check_hex("RawKeyConfig", "key", &key.key)?;
                }
                if let Some(pssh) = &self.pssh {
                    check_hex(ENCRYPTION_CONFIG, "pssh", pssh)?;
                }
                if let Some(iv) = &self.iv {
                    check_hex(ENCRYPTION_CONFIG, "iv", iv)?;
                }
            }
        }
        Ok(())
    }
}

fn default_hwaccel_api() -> String {
    if cfg!(target_os = "linux") {
        "vaapi".to_string()
    } else if cfg!(target_os = "macos") {
        "videotoolbox".to_string()
    } else {
        String::new()
    }
}

fn default_audio_codecs() -> Vec<AudioCodec> {
    vec![AudioCodec::Aac]
}

fn default_video_codecs() -> Vec<VideoCodec> {
    vec![VideoCodec::H264]
}

fn default_manifest_format() -> Vec<ManifestFormat> {
    vec![ManifestFormat::Dash, ManifestFormat::Hls]
}

fn default_dash_output() -> String {
    "dash.mpd".to_string()
}

fn default_hls_output() -> String {
    "hls.m3u8".to_string()
}

fn default_segment_size() -> f64 {
    4.0
}

fn default_true() -> bool {
    true
}

fn default_availability_window() -> u32 {
    300
}

fn default_presentation_delay() -> u32 {
    30
}

fn default_update_period() -> u32 {
    8
}

/// The entire pipeline description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub streaming_mode: StreamingMode,
    /// Only errors are printed by the external tools.
    #[serde(default)]
    pub quiet: bool,
    /// Each external tool writes a log file into the log directory.
    #[serde(default)]
    pub debug_logs: bool,
    #[serde(default = "default_hwaccel_api")]
    pub hwaccel_api: String,
    /// Resolution names to encode; all known resolutions when absent.
    /// Resolutions above the input's are skipped.
    #[serde(default)]
    pub resolutions: Option<Vec<String>>,
    /// Channel layout names to encode; all known layouts when absent.
    #[serde(default)]
    pub channel_layouts: Option<Vec<String>>,
    #[serde(default = "default_audio_codecs")]
    pub audio_codecs: Vec<AudioCodec>,
    #[serde(default = "default_video_codecs")]
    pub video_codecs: Vec<VideoCodec>,
    #[serde(default = "default_manifest_format")]
    pub manifest_format: Vec<ManifestFormat>,
    #[serde(default = "default_dash_output")]
    pub dash_output: String,
    #[serde(default = "default_hls_output")]
    pub hls_output: String,
    /// Sub-folder for segments, blank for none.
    #[serde(default)]
    pub segment_folder: String,
    /// Segment length in seconds.
    #[serde(default = "default_segment_size")]
    pub segment_size: f64,
    /// One file per segment. Required for live and for remote destinations.
    #[serde(default = "default_true")]
    pub segment_per_file: bool,
    /// Seconds a segment remains available in live mode.
    #[serde(default = "default_availability_window")]
    pub availability_window: u32,
    /// Seconds behind the live edge a player should stay.
    #[serde(default = "default_presentation_delay")]
    pub presentation_delay: u32,
    /// Seconds between live manifest updates.
    #[serde(default = "default_update_period")]
    pub update_period: u32,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub low_latency_dash_mode: bool,
    /// Required for low latency DASH.
    #[serde(default)]
    pub utc_timings: Vec<UtcTimingPair>,
}

impl PipelineConfig {
    pub fn new(streaming_mode: StreamingMode) -> Self {
        Self {
            streaming_mode,
            quiet: false,
            debug_logs: false,
            hwaccel_api: default_hwaccel_api(),
            resolutions: None,
            channel_layouts: None,
            audio_codecs: default_audio_codecs(),
            video_codecs: default_video_codecs(),
            manifest_format: default_manifest_format(),
            dash_output: default_dash_output(),
            hls_output: default_hls_output(),
            segment_folder: String::new(),
            segment_size: default_segment_size(),
            segment_per_file: true,
            availability_window: default_availability_window(),
            presentation_delay: default_presentation_delay(),
            update_period: default_update_period(),
            encryption: EncryptionConfig::default(),
            low_latency_dash_mode: false,
            utc_timings: Vec::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.streaming_mode == StreamingMode::Live
    }

    pub fn has_manifest(&self, format: ManifestFormat) -> bool {
        self.manifest_format.contains(&format)
    }

    /// Resolution names to encode, smallest first when defaulted.
    pub fn resolution_names(&self, bitrates: &BitrateConfig) -> Vec<String> {
        match &self.resolutions {
            Some(names) => names.clone(),
            None => bitrates
                .sorted_resolutions()
                .into_iter()
                .map(|(name, _)| name.to_string())
                .collect(),
        }
    }

    /// Channel layout names to encode, fewest channels first when defaulted.
    pub fn channel_layout_names(&self, bitrates: &BitrateConfig) -> Vec<String> {
        match &self.channel_layouts {
            Some(names) => names.clone(),
            None => bitrates
                .sorted_channel_layouts()
                .into_iter()
                .map(|(name, _)| name.to_string())
                .collect(),
        }
    }

    /// Fragment duration for FFmpeg, in microseconds.
    pub fn fragment_duration_us(&self) -> u64 {
        (self.segment_size * 1e6).round() as u64
    }

    pub fn validate(&self, bitrates: &BitrateConfig) -> Result<(), ConfigError> {
        if self.is_live() && !self.segment_per_file {
            return Err(ConfigError::malformed(
                PIPELINE_CONFIG,
                "segment_per_file",
                "must be true when streaming_mode is \"live\"",
            ));
        }

        if self.segment_size.is_nan() || self.segment_size <= 0.0 {
            return Err(ConfigError::malformed(
                PIPELINE_CONFIG,
                "segment_size",
                "must be positive",
            ));
        }

        if let Some(names) = &self.resolutions {
            for name in names {
                if bitrates.resolution(name).is_none() {
                    return Err(ConfigError::malformed(
                        PIPELINE_CONFIG,
                        "resolutions",
                        format!("unknown resolution name \"{name}\""),
                    ));
                }
            }
        }

        if let Some(names) = &self.channel_layouts {
            for name in names {
                if bitrates.channel_layout(name).is_none() {
                    return Err(ConfigError::malformed(
                        PIPELINE_CONFIG,
                        "channel_layouts",
                        format!("unknown channel layout name \"{name}\""),
                    ));
                }
            }
        }

        if self.manifest_format.is_empty() {
            return Err(ConfigError::malformed(
                PIPELINE_CONFIG,
                "manifest_format",
                "at least one manifest format is required",
            ));
        }

        for codec in &self.video_codecs {
            codec.ffmpeg_codec(&self.hwaccel_api)?;
        }

        self.encryption.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigErrorKind;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::new(StreamingMode::Vod);
        assert_eq!(config.segment_size, 4.0);
        assert_eq!(config.availability_window, 300);
        assert_eq!(config.presentation_delay, 30);
        assert_eq!(config.update_period, 8);
        assert_eq!(config.dash_output, "dash.mpd");
        assert_eq!(config.hls_output, "hls.m3u8");
        assert!(config.segment_per_file);
        assert_eq!(config.fragment_duration_us(), 4_000_000);
    }

    #[test]
    fn live_requires_segment_per_file() {
        let mut config = PipelineConfig::new(StreamingMode::Live);
        config.segment_per_file = false;
        let err = config.validate(&BitrateConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ConfigErrorKind::MalformedField);
        assert_eq!(err.field(), "segment_per_file");
    }

    #[test]
    fn unknown_resolution_names_are_rejected() {
        let mut config = PipelineConfig::new(StreamingMode::Vod);
        config.resolutions = Some(vec!["720p".into(), "12k".into()]);
        let err = config.validate(&BitrateConfig::default()).unwrap_err();
        assert_eq!(err.field(), "resolutions");
    }

    #[test]
    fn default_resolutions_are_sorted_smallest_first() {
        let config = PipelineConfig::new(StreamingMode::Vod);
        let names = config.resolution_names(&BitrateConfig::default());
        assert_eq!(names.first().map(String::as_str), Some("144p"));
        assert_eq!(names.len(), 15);
    }

    #[test]
    fn widevine_rejects_raw_fields() {
        let mut encryption = EncryptionConfig {
            enable: true,
            ..Default::default()
        };
        encryption.iv = Some("00".into());
        let err = encryption.validate().unwrap_err();
        assert_eq!(err.field(), "iv");
    }

    #[test]
    fn raw_mode_needs_keys() {
        let mut encryption = EncryptionConfig {
            enable: true,
            encryption_mode: EncryptionMode::Raw,
            ..Default::default()
        };
        assert_eq!(encryption.validate().unwrap_err().field(), "keys");

        encryption.keys.push(RawKey {
            label: None,
            key_id: "abba271e8bcf552bbd2e86a434a9a5d9".into(),
            key: "69eaa802a6763af979e8d1940fb88392".into(),
        });
        assert!(encryption.validate().is_ok());

        encryption.keys[0].key = "not-hex".into();
        assert_eq!(encryption.validate().unwrap_err().field(), "key");
    }

    #[test]
    fn random_content_id_is_hex() {
        let id = random_content_id();
        assert_eq!(id.len(), 32);
        assert!(hex::decode(&id).is_ok());
    }
}
