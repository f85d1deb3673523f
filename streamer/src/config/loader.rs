//! Loading configuration documents from TOML or JSON.
//!
//! Both formats are first parsed into a `serde_json::Value` and then decoded
//! object by object, so serde failures can be reported against the right
//! configuration class and field.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

use super::bitrate::{AudioChannelLayout, BitrateConfig, VideoResolution};
use super::input::{Input, InputConfig, SinglePeriod};
use super::pipeline::{EncryptionConfig, PipelineConfig};
use crate::error::{ConfigError, Error, Result};

/// Document syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Picks the format from a file extension; anything but `.json` is TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

fn parse_document(
    class: &'static str,
    text: &str,
    format: ConfigFormat,
) -> std::result::Result<Value, ConfigError> {
    match format {
        ConfigFormat::Toml => toml::from_str::<Value>(text)
            .map_err(|e| ConfigError::malformed(class, "<document>", e.to_string().trim())),
        ConfigFormat::Json => serde_json::from_str::<Value>(text)
            .map_err(|e| ConfigError::malformed(class, "<document>", e.to_string())),
    }
}

fn backticked<'a>(msg: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = msg.strip_prefix(prefix)?;
    let end = rest.find('`')?;
    Some(&rest[..end])
}

/// Finds the key whose removal makes a type/value error go away.
fn locate_culprit<T: DeserializeOwned>(map: &Map<String, Value>, original: &str) -> Option<String> {
    for key in map.keys() {
        let mut trimmed = map.clone();
        trimmed.remove(key);
        match T::deserialize(&Value::Object(trimmed)) {
            Ok(_) => return Some(key.clone()),
            Err(e) if e.to_string() != original => return Some(key.clone()),
            Err(_) => {}
        }
    }
    None
}

/// Decodes one configuration object, classifying serde failures.
fn decode<T: DeserializeOwned>(
    class: &'static str,
    context: &str,
    value: &Value,
) -> std::result::Result<T, ConfigError> {
    let Value::Object(map) = value else {
        return Err(ConfigError::wrong_type(class, context, "a table of fields"));
    };

    let err = match T::deserialize(value) {
        Ok(decoded) => return Ok(decoded),
        Err(e) => e.to_string(),
    };

    if let Some(field) = backticked(&err, "unknown field `") {
        return Err(ConfigError::unrecognized(class, field));
    }
    if let Some(field) = backticked(&err, "missing field `") {
        return Err(ConfigError::missing(class, field));
    }

    let field = locate_culprit::<T>(map, &err).unwrap_or_else(|| context.to_string());
    if err.starts_with("invalid type") {
        let expected = err
            .split_once(", expected ")
            .map(|(_, expected)| expected.to_string())
            .unwrap_or(err);
        Err(ConfigError::wrong_type(class, field, expected))
    } else {
        Err(ConfigError::malformed(class, field, err))
    }
}

fn decode_list<T: DeserializeOwned>(
    class: &'static str,
    parent: &'static str,
    field: &str,
    value: &Value,
) -> std::result::Result<Vec<T>, ConfigError> {
    let Value::Array(items) = value else {
        return Err(ConfigError::wrong_type(parent, field, "a list"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| decode::<T>(class, &format!("{field}[{i}]"), item))
        .collect()
}

fn as_object<'a>(
    class: &'static str,
    value: &'a Value,
) -> std::result::Result<&'a Map<String, Value>, ConfigError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::wrong_type(class, "<document>", "a table of fields")),
    }
}

/// Decodes an input config. The mutual exclusion of `inputs` and
/// `multiperiod_inputs_list` is checked before either list is decoded.
pub fn input_config_from_value(value: &Value) -> std::result::Result<InputConfig, ConfigError> {
    const CLASS: &str = "InputConfig";
    let map = as_object(CLASS, value)?;

    if let Some(key) = map
        .keys()
        .find(|k| *k != "inputs" && *k != "multiperiod_inputs_list")
    {
        return Err(ConfigError::unrecognized(CLASS, key.clone()));
    }

    let inputs = map.get("inputs").filter(|v| !v.is_null());
    let periods = map.get("multiperiod_inputs_list").filter(|v| !v.is_null());
    if inputs.is_some() && periods.is_some() {
        return Err(ConfigError::conflicting(
            CLASS,
            "inputs",
            "multiperiod_inputs_list",
        ));
    }

    let inputs = inputs
        .map(|v| decode_list::<Input>("Input", CLASS, "inputs", v))
        .transpose()?;

    let multiperiod_inputs_list = match periods {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .enumerate()
                .map(|(i, period)| {
                    let context = format!("multiperiod_inputs_list[{i}]");
                    let map = match period {
                        Value::Object(map) => map,
                        _ => {
                            return Err(ConfigError::wrong_type(
                                CLASS,
                                context,
                                "a table with an inputs list",
                            ));
                        }
                    };
                    if let Some(key) = map.keys().find(|k| *k != "inputs") {
                        return Err(ConfigError::unrecognized("SinglePeriod", key.clone()));
                    }
                    let inputs = map
                        .get("inputs")
                        .ok_or_else(|| ConfigError::missing("SinglePeriod", "inputs"))?;
                    Ok(SinglePeriod {
                        inputs: decode_list::<Input>("Input", "SinglePeriod", "inputs", inputs)?,
                    })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
        ),
        Some(_) => {
            return Err(ConfigError::wrong_type(
                CLASS,
                "multiperiod_inputs_list",
                "a list",
            ));
        }
        None => None,
    };

    let config = InputConfig {
        inputs,
        multiperiod_inputs_list,
    };
    config.check_exclusive()?;
    Ok(config)
}

/// Decodes a pipeline config; the `encryption` table is decoded on its own
/// so its errors name `EncryptionConfig`.
pub fn pipeline_config_from_value(
    value: &Value,
) -> std::result::Result<PipelineConfig, ConfigError> {
    const CLASS: &str = "PipelineConfig";
    let mut map = as_object(CLASS, value)?.clone();

    let encryption = map
        .remove("encryption")
        .map(|v| decode::<EncryptionConfig>("EncryptionConfig", "encryption", &v))
        .transpose()?;

    let mut config = decode::<PipelineConfig>(CLASS, CLASS, &Value::Object(map))?;
    if let Some(encryption) = encryption {
        config.encryption = encryption;
    }
    Ok(config)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BitrateTables {
    #[serde(default)]
    audio_channel_layouts: Option<Map<String, Value>>,
    #[serde(default)]
    video_resolutions: Option<Map<String, Value>>,
}

/// Decodes a bitrate config. Tables that are given replace the defaults.
pub fn bitrate_config_from_value(
    value: &Value,
) -> std::result::Result<BitrateConfig, ConfigError> {
    const CLASS: &str = "BitrateConfig";
    let tables = decode::<BitrateTables>(CLASS, CLASS, value)?;
    let mut config = BitrateConfig::default();

    if let Some(layouts) = tables.audio_channel_layouts {
        config.audio_channel_layouts = layouts
            .iter()
            .map(|(name, v)| {
                decode::<AudioChannelLayout>("AudioChannelLayout", name, v)
                    .map(|layout| (name.clone(), layout))
            })
            .collect::<std::result::Result<_, _>>()?;
    }
    if let Some(resolutions) = tables.video_resolutions {
        config.video_resolutions = resolutions
            .iter()
            .map(|(name, v)| {
                decode::<VideoResolution>("VideoResolution", name, v)
                    .map(|res| (name.clone(), res))
            })
            .collect::<std::result::Result<_, _>>()?;
    }
    Ok(config)
}

pub fn input_config_from_str(
    text: &str,
    format: ConfigFormat,
) -> std::result::Result<InputConfig, ConfigError> {
    input_config_from_value(&parse_document("InputConfig", text, format)?)
}

pub fn pipeline_config_from_str(
    text: &str,
    format: ConfigFormat,
) -> std::result::Result<PipelineConfig, ConfigError> {
    pipeline_config_from_value(&parse_document("PipelineConfig", text, format)?)
}

pub fn bitrate_config_from_str(
    text: &str,
    format: ConfigFormat,
) -> std::result::Result<BitrateConfig, ConfigError> {
    bitrate_config_from_value(&parse_document("BitrateConfig", text, format)?)
}

async fn read_document(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::resource("reading config", path, e))
}

pub async fn load_input_config(path: &Path) -> Result<InputConfig> {
    let text = read_document(path).await?;
    Ok(input_config_from_str(&text, ConfigFormat::from_path(path))?)
}

pub async fn load_pipeline_config(path: &Path) -> Result<PipelineConfig> {
    let text = read_document(path).await?;
    Ok(pipeline_config_from_str(&text, ConfigFormat::from_path(path))?)
}

pub async fn load_bitrate_config(path: &Path) -> Result<BitrateConfig> {
    let text = read_document(path).await?;
    Ok(bitrate_config_from_str(&text, ConfigFormat::from_path(path))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::bitrate::VideoCodec;
    use crate::config::input::{InputType, MediaType};
    use crate::config::pipeline::{EncryptionMode, StreamingMode};
    use crate::error::ConfigErrorKind;

    #[test]
    fn parses_toml_input_config() {
        let text = r#"
            [[inputs]]
            name = "in.mp4"
            media_type = "video"
            resolution = "1080p"
            frame_rate = 24.0

            [[inputs]]
            name = "gen --stereo"
            input_type = "external_command"
            media_type = "audio"
            channel_layout = "stereo"
        "#;
        let config = input_config_from_str(text, ConfigFormat::Toml).unwrap();
        let inputs = config.inputs.unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].media_type, MediaType::Video);
        assert_eq!(inputs[1].input_type, InputType::ExternalCommand);
    }

    #[test]
    fn conflicting_lists_are_detected_before_decoding() {
        let text = r#"{"inputs": [{"bogus": 1}], "multiperiod_inputs_list": []}"#;
        let err = input_config_from_str(text, ConfigFormat::Json).unwrap_err();
        assert_eq!(err.kind(), ConfigErrorKind::ConflictingFields);
    }

    #[test]
    fn unknown_input_field_names_class_and_field() {
        let text = r#"{"inputs": [{"name": "a.mp4", "media_type": "video", "colour": "red"}]}"#;
        let err = input_config_from_str(text, ConfigFormat::Json).unwrap_err();
        assert_eq!(err.kind(), ConfigErrorKind::UnrecognizedField);
        assert_eq!(err.class(), "Input");
        assert_eq!(err.field(), "colour");
    }

    #[test]
    fn missing_required_field() {
        let text = r#"{"inputs": [{"name": "a.mp4"}]}"#;
        let err = input_config_from_str(text, ConfigFormat::Json).unwrap_err();
        assert_eq!(err.kind(), ConfigErrorKind::MissingRequiredField);
        assert_eq!(err.field(), "media_type");
    }

    #[test]
    fn wrong_type_locates_field() {
        let text = r#"{"inputs": [{"name": "a.mp4", "media_type": "video", "frame_rate": "fast"}]}"#;
        let err = input_config_from_str(text, ConfigFormat::Json).unwrap_err();
        assert_eq!(err.kind(), ConfigErrorKind::WrongType);
        assert_eq!(err.field(), "frame_rate");
    }

    #[test]
    fn unknown_enum_value_is_malformed() {
        let err = pipeline_config_from_str("streaming_mode = \"sometimes\"", ConfigFormat::Toml)
            .unwrap_err();
        assert_eq!(err.kind(), ConfigErrorKind::MalformedField);
        assert_eq!(err.field(), "streaming_mode");
    }

    #[test]
    fn pipeline_config_with_encryption() {
        let text = r#"
            streaming_mode = "live"
            video_codecs = ["h264", "hw:vp9"]
            resolutions = ["720p", "480p"]

            [encryption]
            enable = true
            encryption_mode = "raw"

            [[encryption.keys]]
            key_id = "abba271e8bcf552bbd2e86a434a9a5d9"
            key = "69eaa802a6763af979e8d1940fb88392"
        "#;
        let config = pipeline_config_from_str(text, ConfigFormat::Toml).unwrap();
        assert_eq!(config.streaming_mode, StreamingMode::Live);
        assert_eq!(config.video_codecs, vec![VideoCodec::H264, VideoCodec::HardwareVp9]);
        assert_eq!(config.encryption.encryption_mode, EncryptionMode::Raw);
        assert_eq!(config.encryption.keys.len(), 1);
    }

    #[test]
    fn encryption_errors_name_encryption_config() {
        let text = r#"{"streaming_mode": "vod", "encryption": {"enable": true, "salt": "x"}}"#;
        let err = pipeline_config_from_str(text, ConfigFormat::Json).unwrap_err();
        assert_eq!(err.class(), "EncryptionConfig");
        assert_eq!(err.field(), "salt");
    }

    #[test]
    fn bitrate_override_replaces_table() {
        let text = r#"
            [video_resolutions.small]
            max_width = 320
            max_height = 180
            bitrates = { h264 = "150k" }
        "#;
        let config = bitrate_config_from_str(text, ConfigFormat::Toml).unwrap();
        assert_eq!(config.video_resolutions.len(), 1);
        assert_eq!(config.audio_channel_layouts.len(), 2);
    }

    #[test]
    fn bad_bitrate_string_is_malformed() {
        let text = r#"{"video_resolutions": {"tiny": {"max_width": 1, "max_height": 1, "bitrates": {"h264": "lots"}}}}"#;
        let err = bitrate_config_from_str(text, ConfigFormat::Json).unwrap_err();
        assert_eq!(err.kind(), ConfigErrorKind::MalformedField);
        assert_eq!(err.class(), "VideoResolution");
        assert_eq!(err.field(), "bitrates");
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), ConfigFormat::Toml);
    }

    #[tokio::test]
    async fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        tokio::fs::write(&path, r#"{"streaming_mode": "vod", "quiet": true}"#)
            .await
            .unwrap();
        let config = load_pipeline_config(&path).await.unwrap();
        assert!(config.quiet);

        let err = load_pipeline_config(&dir.path().join("missing.toml"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
    }
}
