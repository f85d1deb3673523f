//! Packager command line: segments the transcoded streams and writes the
//! manifests.

use std::path::{Path, PathBuf};

use super::process::{CommandSpec, OutputSink};
use crate::config::{EncryptionConfig, EncryptionMode, ManifestFormat, PipelineConfig};
use crate::stream::OutputStream;

/// A stream and the path the packager reads it from.
#[derive(Debug, Clone)]
pub struct PackagerStream<'a> {
    pub stream: &'a OutputStream,
    pub source: PathBuf,
}

pub fn log_file_name(index: usize) -> String {
    format!("PackagerNode-{index}.log")
}

/// Where segments go: the output directory or its segment sub-folder.
pub fn segment_dir(output_dir: &Path, pipeline: &PipelineConfig) -> PathBuf {
    let folder = pipeline.segment_folder.trim_matches('/');
    if folder.is_empty() {
        output_dir.to_path_buf()
    } else {
        output_dir.join(folder)
    }
}

/// One `key=value,...` stream descriptor.
pub fn stream_descriptor(
    entry: &PackagerStream<'_>,
    pipeline: &PipelineConfig,
    segment_dir: &Path,
) -> String {
    let stream = entry.stream;
    let mut fields: Vec<(&str, String)> = vec![
        ("in", entry.source.to_string_lossy().into_owned()),
        ("stream", stream.media_type().as_str().to_string()),
    ];

    if stream.skip_encryption != 0 {
        fields.push(("skip_encryption", stream.skip_encryption.to_string()));
    }
    if let Some(label) = &stream.drm_label {
        fields.push(("drm_label", label.clone()));
    }
    if !stream.language.is_empty() && stream.language != "und" {
        fields.push(("language", stream.language.clone()));
    }

    let in_segment_dir = |name: String| segment_dir.join(name).to_string_lossy().into_owned();
    if pipeline.segment_per_file {
        fields.push(("init_segment", in_segment_dir(stream.init_segment_name())));
        fields.push(("segment_template", in_segment_dir(stream.media_segment_name())));
    } else {
        fields.push(("output", in_segment_dir(stream.single_segment_name())));
    }

    if stream.is_dash_only() {
        fields.push(("dash_only", "1".to_string()));
    } else if pipeline.has_manifest(ManifestFormat::Hls) {
        // Stable names let the playlists of separate periods be matched up.
        fields.push(("playlist_name", format!("{}.m3u8", stream.file_stem())));
    }

    fields
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn manifest_args(pipeline: &PipelineConfig, output_dir: &Path) -> Vec<String> {
    let mut args = Vec::new();

    if pipeline.has_manifest(ManifestFormat::Dash) {
        if !pipeline.utc_timings.is_empty() {
            args.push("--utc_timings".to_string());
            args.push(
                pipeline
                    .utc_timings
                    .iter()
                    .map(|t| format!("{}={}", t.scheme_id_uri, t.value))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        if pipeline.low_latency_dash_mode {
            args.push("--low_latency_dash_mode=true".to_string());
        }
        if !pipeline.is_live() {
            args.push("--generate_static_live_mpd".to_string());
        }
        args.push("--mpd_output".to_string());
        args.push(output_dir.join(&pipeline.dash_output).to_string_lossy().into_owned());
    }

    if pipeline.has_manifest(ManifestFormat::Hls) {
        let playlist_type = if pipeline.is_live() { "LIVE" } else { "VOD" };
        args.push("--hls_playlist_type".to_string());
        args.push(playlist_type.to_string());
        args.push("--hls_master_playlist_output".to_string());
        args.push(output_dir.join(&pipeline.hls_output).to_string_lossy().into_owned());
    }
    args
}

fn encryption_args(encryption: &EncryptionConfig) -> Vec<String> {
    let mut args: Vec<String> = match encryption.encryption_mode {
        EncryptionMode::Widevine => vec![
            "--enable_widevine_encryption".into(),
            "--key_server_url".into(),
            encryption.key_server_url.clone(),
            "--content_id".into(),
            encryption.content_id.clone(),
            "--signer".into(),
            encryption.signer.clone(),
            "--aes_signing_key".into(),
            encryption.signing_key.clone(),
            "--aes_signing_iv".into(),
            encryption.signing_iv.clone(),
        ],
        EncryptionMode::Raw => {
            let keys = encryption
                .keys
                .iter()
                .map(|key| {
                    let label = key
                        .label
                        .as_ref()
                        .map(|l| format!("label={l}:"))
                        .unwrap_or_default();
                    format!("{label}key_id={}:key={}", key.key_id, key.key)
                })
                .collect::<Vec<_>>()
                .join(",");
            let mut args = vec!["--enable_raw_key_encryption".into(), "--keys".into(), keys];
            if let Some(iv) = &encryption.iv {
                args.extend(["--iv".into(), iv.clone()]);
            }
            if let Some(pssh) = &encryption.pssh {
                args.extend(["--pssh".into(), pssh.clone()]);
            }
            args
        }
    };

    args.extend([
        "--protection_scheme".into(),
        encryption.protection_scheme.as_str().into(),
        "--clear_lead".into(),
        encryption.clear_lead.to_string(),
    ]);

    if !encryption.protection_systems.is_empty() {
        args.push("--protection_systems".into());
        args.push(
            encryption
                .protection_systems
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    args
}

/// Builds the packager invocation for one period. Manifests land in
/// `output_dir`, segments in its segment folder.
pub fn command(
    packager: &Path,
    index: usize,
    streams: &[PackagerStream<'_>],
    pipeline: &PipelineConfig,
    output_dir: &Path,
    log_dir: &Path,
) -> CommandSpec {
    let segments = segment_dir(output_dir, pipeline);
    let mut spec = CommandSpec::new(packager);

    spec.args(
        streams
            .iter()
            .map(|entry| stream_descriptor(entry, pipeline, &segments)),
    );

    if pipeline.quiet {
        spec.arg("--quiet");
    }
    spec.arg("--segment_duration")
        .arg(pipeline.segment_size.to_string());

    if pipeline.is_live() {
        spec.arg("--time_shift_buffer_depth")
            .arg(pipeline.availability_window.to_string())
            .args(["--preserved_segments_outside_live_window", "3"])
            .arg("--suggested_presentation_delay")
            .arg(pipeline.presentation_delay.to_string())
            .arg("--minimum_update_period")
            .arg(pipeline.update_period.to_string());
    }

    spec.args(manifest_args(pipeline, output_dir));

    if pipeline.encryption.enable {
        spec.args(encryption_args(&pipeline.encryption));
    }

    spec.output = if pipeline.debug_logs {
        OutputSink::File(log_dir.join(log_file_name(index)))
    } else {
        OutputSink::Log
    };
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AudioCodec, BitrateConfig, Input, InputType, MediaType, ProtectionSystem, RawKey,
        StreamingMode, UtcTimingPair,
    };
    use crate::stream::plan_outputs;

    fn streams(pipeline: &PipelineConfig, inputs: &[Input]) -> Vec<OutputStream> {
        plan_outputs(inputs, pipeline, &BitrateConfig::default()).unwrap()
    }

    fn build(pipeline: &PipelineConfig, outputs: &[OutputStream]) -> CommandSpec {
        let entries: Vec<_> = outputs
            .iter()
            .enumerate()
            .map(|(i, stream)| PackagerStream {
                stream,
                source: PathBuf::from(format!("/p/{i}")),
            })
            .collect();
        command(
            Path::new("packager"),
            1,
            &entries,
            pipeline,
            Path::new("/out"),
            Path::new("/logs"),
        )
    }

    fn audio(language: &str) -> Input {
        Input::new(InputType::File, "in.mp4", MediaType::Audio)
            .with_channel_layout("stereo")
            .with_language(language)
    }

    #[test]
    fn vod_descriptors_and_manifests() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.channel_layouts = Some(vec!["stereo".into()]);
        pipeline.segment_folder = "segments".into();
        let outputs = streams(&pipeline, &[audio("und")]);

        let spec = build(&pipeline, &outputs);
        assert_eq!(
            spec.args[0],
            "in=/p/0,stream=audio,\
             init_segment=/out/segments/audio_und_2c_128k_aac_init.mp4,\
             segment_template=/out/segments/audio_und_2c_128k_aac_$Number$.mp4,\
             playlist_name=audio_und_2c_128k_aac.m3u8"
        );
        let line = spec.args[1..].join(" ");
        assert_eq!(
            line,
            "--segment_duration 4 --generate_static_live_mpd --mpd_output /out/dash.mpd \
             --hls_playlist_type VOD --hls_master_playlist_output /out/hls.m3u8"
        );
        assert_eq!(spec.output, OutputSink::Log);
    }

    #[test]
    fn live_window_and_low_latency() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Live);
        pipeline.manifest_format = vec![ManifestFormat::Dash];
        pipeline.low_latency_dash_mode = true;
        pipeline.utc_timings = vec![UtcTimingPair {
            scheme_id_uri: "urn:mpeg:dash:utc:http-xsdate:2014".into(),
            value: "https://time.akamai.com/?iso".into(),
        }];
        pipeline.channel_layouts = Some(vec!["stereo".into()]);
        let outputs = streams(&pipeline, &[audio("en")]);

        let spec = build(&pipeline, &outputs);
        assert!(spec.args[0].contains(",language=en,"));
        let line = spec.args[1..].join(" ");
        assert!(line.contains(
            "--time_shift_buffer_depth 300 --preserved_segments_outside_live_window 3 \
             --suggested_presentation_delay 30 --minimum_update_period 8"
        ));
        assert!(line.contains(
            "--utc_timings urn:mpeg:dash:utc:http-xsdate:2014=https://time.akamai.com/?iso \
             --low_latency_dash_mode=true --mpd_output /out/dash.mpd"
        ));
        assert!(!line.contains("generate_static_live_mpd"));
        assert!(!line.contains("hls"));
    }

    #[test]
    fn single_file_output_and_dash_only() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.segment_per_file = false;
        pipeline.audio_codecs = vec![AudioCodec::Opus];
        pipeline.channel_layouts = Some(vec!["stereo".into()]);
        pipeline.debug_logs = true;
        let mut input = audio("fr");
        input.drm_label = Some("AUDIO".into());
        input.skip_encryption = 1;
        let outputs = streams(&pipeline, &[input]);

        let spec = build(&pipeline, &outputs);
        assert_eq!(
            spec.args[0],
            "in=/p/0,stream=audio,skip_encryption=1,drm_label=AUDIO,language=fr,\
             output=/out/audio_fr_2c_64k_opus.webm,dash_only=1"
        );
        assert_eq!(
            spec.output,
            OutputSink::File(PathBuf::from("/logs/PackagerNode-1.log"))
        );
    }

    #[test]
    fn raw_key_encryption() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.channel_layouts = Some(vec!["stereo".into()]);
        pipeline.encryption.enable = true;
        pipeline.encryption.encryption_mode = EncryptionMode::Raw;
        pipeline.encryption.protection_systems =
            vec![ProtectionSystem::Widevine, ProtectionSystem::FairPlay];
        pipeline.encryption.iv = Some("00112233445566778899aabbccddeeff".into());
        pipeline.encryption.keys = vec![
            RawKey {
                label: Some("AUDIO".into()),
                key_id: "aa".into(),
                key: "bb".into(),
            },
            RawKey {
                label: None,
                key_id: "cc".into(),
                key: "dd".into(),
            },
        ];
        let outputs = streams(&pipeline, &[audio("en")]);

        let line = build(&pipeline, &outputs).args.join(" ");
        assert!(line.ends_with(
            "--enable_raw_key_encryption --keys label=AUDIO:key_id=aa:key=bb,key_id=cc:key=dd \
             --iv 00112233445566778899aabbccddeeff --protection_scheme cenc --clear_lead 10 \
             --protection_systems Widevine,FairPlay"
        ));
    }

    #[test]
    fn widevine_encryption() {
        let mut pipeline = PipelineConfig::new(StreamingMode::Vod);
        pipeline.encryption.enable = true;
        pipeline.encryption.content_id = "ABCD".into();
        let args = encryption_args(&pipeline.encryption);
        assert_eq!(args[0], "--enable_widevine_encryption");
        assert_eq!(args[4], "ABCD");
        assert!(!args.contains(&"--protection_systems".to_string()));
    }
}
