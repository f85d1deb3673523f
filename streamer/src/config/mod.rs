//! Configuration model: inputs, pipeline settings and the bitrate tables.
//!
//! The controller treats these as already validated; [`validate_all`] is
//! what a front end runs right after loading them.

pub mod bitrate;
pub mod input;
pub mod loader;
pub mod pipeline;

pub use bitrate::{
    AudioChannelLayout, AudioCodec, Bitrate, BitrateConfig, VideoCodec, VideoResolution,
};
pub use input::{Input, InputConfig, InputType, MediaType, SinglePeriod};
pub use loader::{
    ConfigFormat, load_bitrate_config, load_input_config, load_pipeline_config,
};
pub use pipeline::{
    EncryptionConfig, EncryptionMode, ManifestFormat, PipelineConfig, ProtectionScheme,
    ProtectionSystem, RawKey, StreamingMode, UtcTimingPair,
};

use crate::error::ConfigError;

/// Field-level validation of all three documents, bitrate tables first
/// since the others refer to them by name.
pub fn validate_all(
    input: &InputConfig,
    pipeline: &PipelineConfig,
    bitrates: &BitrateConfig,
) -> Result<(), ConfigError> {
    bitrates.validate()?;
    input.validate(bitrates)?;
    pipeline.validate(bitrates)?;

    if !pipeline.is_live() {
        if let Some(input) = input
            .all_inputs()
            .find(|i| i.input_type == InputType::LoopedFile)
        {
            return Err(ConfigError::malformed(
                "Input",
                "input_type",
                format!(
                    "\"looped_file\" ({}) is only supported in live mode",
                    input.name
                ),
            ));
        }
    }
    Ok(())
}
