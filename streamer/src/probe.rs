//! Fills in input properties the configuration left out, using ffprobe.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{BitrateConfig, Input, InputConfig, InputType, MediaType};
use crate::error::{ConfigError, Error, Result};

/// Field orders that mean interlaced video; anything else is progressive.
const INTERLACED_FIELD_ORDERS: &[&str] = &["tt", "bb", "tb", "bt"];

/// Webcams misbehave when reopened quickly.
const WEBCAM_SETTLE: Duration = Duration::from_secs(1);

/// Parse an ffprobe frame rate such as `30000/1001` or `25`.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

pub fn is_interlaced_order(field_order: Option<&str>) -> bool {
    field_order.is_some_and(|order| INTERLACED_FIELD_ORDERS.contains(&order))
}

/// The smallest named resolution that fits the given size and frame rate.
pub fn bucket_resolution(
    bitrates: &BitrateConfig,
    width: u32,
    height: u32,
    frame_rate: f64,
) -> Option<String> {
    bitrates
        .sorted_resolutions()
        .into_iter()
        .find(|(_, res)| {
            width <= res.max_width
                && height <= res.max_height
                && frame_rate <= res.frame_rate_limit()
        })
        .map(|(name, _)| name.to_string())
}

/// The smallest named channel layout with at least `channels` channels.
pub fn bucket_channels(bitrates: &BitrateConfig, channels: u32) -> Option<String> {
    bitrates
        .sorted_channel_layouts()
        .into_iter()
        .find(|(_, layout)| channels <= layout.max_channels)
        .map(|(name, _)| name.to_string())
}

/// Runs ffprobe against inputs.
#[derive(Debug, Clone)]
pub struct Prober {
    ffprobe: PathBuf,
    webcam_settle: Duration,
}

impl Prober {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            webcam_settle: WEBCAM_SETTLE,
        }
    }

    pub fn with_webcam_settle(mut self, settle: Duration) -> Self {
        self.webcam_settle = settle;
        self
    }

    /// One `-show_entries` field of the input's selected stream. `None` when
    /// ffprobe prints nothing, fails, or the input type cannot be probed.
    pub async fn probe_field(&self, input: &Input, field: &str) -> Result<Option<String>> {
        if input.input_type == InputType::ExternalCommand {
            return Ok(None);
        }

        let mut args = vec![input.name.clone()];
        args.extend(input.input_args()?);
        args.extend([
            "-select_streams".to_string(),
            input.stream_specifier(),
            "-show_entries".to_string(),
            field.to_string(),
            "-of".to_string(),
            "compact=p=0:nk=1".to_string(),
        ]);

        let program = self.ffprobe.to_string_lossy();
        info!("+ {}", process_utils::render_command_line(&program, &args));

        let output = process_utils::tokio_command(&self.ffprobe)
            .args(&args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Probe {
                input: input.name.clone(),
                reason: format!("failed to run {}: {}", program, e),
            })?;

        if input.input_type == InputType::Webcam {
            tokio::time::sleep(self.webcam_settle).await;
        }

        if !output.status.success() {
            debug!(
                input = %input.name,
                field,
                status = %process_utils::describe_exit(&output.status),
                "ffprobe failed"
            );
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let value = text.lines().next().unwrap_or("").trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    /// Whether the selected track exists. Unprobeable inputs are assumed
    /// present.
    pub async fn is_present(&self, input: &Input) -> Result<bool> {
        if input.input_type == InputType::ExternalCommand {
            return Ok(true);
        }
        Ok(self.probe_field(input, "stream=index").await?.is_some())
    }

    /// Fills in everything the input left unset, then checks that what the
    /// graph needs is known.
    pub async fn resolve_input(&self, input: &mut Input, bitrates: &BitrateConfig) -> Result<()> {
        if !self.is_present(input).await? {
            return Err(ConfigError::malformed(
                "Input",
                "track_num",
                format!(
                    "{} track #{} was not found in \"{}\"",
                    input.media_type, input.track_num, input.name
                ),
            )
            .into());
        }

        match input.media_type {
            MediaType::Video => {
                if input.is_interlaced.is_none() {
                    let order = self.probe_field(input, "stream=field_order").await?;
                    input.is_interlaced = Some(is_interlaced_order(order.as_deref()));
                }

                if input.frame_rate.is_none() {
                    let rate = self.probe_field(input, "stream=r_frame_rate").await?;
                    let interlaced = input.is_interlaced == Some(true);
                    input.frame_rate = rate.as_deref().and_then(parse_frame_rate).map(|rate| {
                        // ffprobe reports the field rate for interlaced video.
                        if interlaced { rate / 2.0 } else { rate }
                    });
                }
                let Some(frame_rate) = input.frame_rate else {
                    return Err(ConfigError::missing("Input", "frame_rate").into());
                };

                if input.resolution.is_none() {
                    let size = self.probe_field(input, "stream=width,height").await?;
                    input.resolution = size
                        .as_deref()
                        .and_then(|s| s.split_once('|'))
                        .and_then(|(w, h)| Some((w.trim().parse::<u32>().ok()?, h.trim().parse::<u32>().ok()?)))
                        .and_then(|(w, h)| bucket_resolution(bitrates, w, h, frame_rate));
                }
            }
            MediaType::Audio => {
                if input.language.is_none() {
                    input.language = self.probe_field(input, "stream_tags=language").await?;
                }
                if input.channel_layout.is_none() {
                    let channels = self.probe_field(input, "stream=channels").await?;
                    input.channel_layout = channels
                        .as_deref()
                        .and_then(|c| c.trim().parse::<u32>().ok())
                        .and_then(|c| bucket_channels(bitrates, c));
                }
            }
            MediaType::Text => {
                if input.language.is_none() {
                    input.language = self.probe_field(input, "stream_tags=language").await?;
                }
            }
        }

        if input.media_type != MediaType::Video && input.language.is_none() {
            input.language = Some("und".to_string());
        }

        input.require_resolved()?;
        debug!(
            input = %input.name,
            resolution = ?input.resolution,
            frame_rate = ?input.frame_rate,
            channel_layout = ?input.channel_layout,
            language = ?input.language,
            "Resolved input"
        );
        Ok(())
    }

    pub async fn resolve_all(&self, config: &mut InputConfig, bitrates: &BitrateConfig) -> Result<()> {
        for period in config.periods_mut() {
            for input in period.iter_mut() {
                self.resolve_input(input, bitrates).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigErrorKind, ErrorKind};

    #[test]
    fn frame_rates_parse_as_fractions() {
        assert_eq!(parse_frame_rate("24/1"), Some(24.0));
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn interlaced_field_orders() {
        assert!(is_interlaced_order(Some("tt")));
        assert!(is_interlaced_order(Some("bt")));
        assert!(!is_interlaced_order(Some("progressive")));
        assert!(!is_interlaced_order(None));
    }

    #[test]
    fn resolution_buckets_pick_smallest_fit() {
        let bitrates = BitrateConfig::default();
        assert_eq!(bucket_resolution(&bitrates, 1920, 1080, 24.0).as_deref(), Some("1080p"));
        assert_eq!(bucket_resolution(&bitrates, 1920, 1080, 60.0).as_deref(), Some("1080p-hfr"));
        assert_eq!(bucket_resolution(&bitrates, 1280, 534, 24.0).as_deref(), Some("720p"));
        assert_eq!(bucket_resolution(&bitrates, 10000, 10000, 24.0), None);
    }

    #[test]
    fn channel_buckets_pick_smallest_fit() {
        let bitrates = BitrateConfig::default();
        assert_eq!(bucket_channels(&bitrates, 1).as_deref(), Some("stereo"));
        assert_eq!(bucket_channels(&bitrates, 6).as_deref(), Some("surround"));
        assert_eq!(bucket_channels(&bitrates, 8), None);
    }

    #[tokio::test]
    async fn external_commands_are_not_probed() {
        let prober = Prober::new("/nonexistent/ffprobe");
        let input = Input::new(InputType::ExternalCommand, "gen", MediaType::Video);
        assert_eq!(prober.probe_field(&input, "stream=index").await.unwrap(), None);
        assert!(prober.is_present(&input).await.unwrap());
    }

    #[tokio::test]
    async fn unresolvable_external_command_is_missing_fields() {
        let prober = Prober::new("/nonexistent/ffprobe");
        let mut input = Input::new(InputType::ExternalCommand, "gen", MediaType::Audio);
        let err = prober
            .resolve_input(&mut input, &BitrateConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::MissingRequiredField));
        assert_eq!(input.language.as_deref(), Some("und"));
    }

    #[tokio::test]
    async fn missing_ffprobe_is_a_probe_error() {
        let prober = Prober::new("/nonexistent/ffprobe");
        let input = Input::new(InputType::File, "a.mp4", MediaType::Video);
        let err = prober.probe_field(&input, "stream=index").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Probe);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolves_from_probe_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffprobe");
        std::fs::write(
            &script,
            r#"#!/bin/sh
case "$*" in
  *stream=index*) echo 0 ;;
  *stream=field_order*) echo progressive ;;
  *stream=r_frame_rate*) echo 30000/1001 ;;
  *stream=width,height*) echo '1920|1080' ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let prober = Prober::new(&script);
        let mut input = Input::new(InputType::File, "in.mp4", MediaType::Video);
        prober
            .resolve_input(&mut input, &BitrateConfig::default())
            .await
            .unwrap();
        assert_eq!(input.is_interlaced, Some(false));
        assert_eq!(input.resolution.as_deref(), Some("1080p"));
        assert!((input.frame_rate.unwrap() - 29.97).abs() < 0.01);
    }
}
