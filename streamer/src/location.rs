//! Where a run's output ends up.

use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::ConfigError;

/// Object storage back ends reached through rclone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudScheme {
    Gcs,
    S3,
}

impl CloudScheme {
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::Gcs => "gs",
            Self::S3 => "s3",
        }
    }

    /// rclone backend name for an on-the-fly remote.
    pub fn rclone_backend(&self) -> &'static str {
        match self {
            Self::Gcs => "gcs",
            Self::S3 => "s3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLocation {
    /// A directory on local disk; removed and recreated at start.
    Local(PathBuf),
    /// An HTTP(S) endpoint accepting PUT and DELETE.
    Http(Url),
    /// A bucket and key prefix in object storage.
    Cloud {
        scheme: CloudScheme,
        bucket: String,
        prefix: String,
    },
}

impl OutputLocation {
    /// Parses a destination. Strings without a URL scheme are local paths.
    pub fn parse(location: &str) -> Result<Self, ConfigError> {
        let trimmed = location.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::malformed(
                "OutputLocation",
                "output_location",
                "must not be empty",
            ));
        }

        let Some((scheme, _)) = trimmed.split_once("://") else {
            return Ok(Self::Local(PathBuf::from(trimmed)));
        };

        match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" => {
                let url = Url::parse(trimmed.trim_end_matches('/')).map_err(|e| {
                    ConfigError::malformed("OutputLocation", "output_location", e.to_string())
                })?;
                Ok(Self::Http(url))
            }
            "gs" | "s3" => {
                let cloud = if scheme.eq_ignore_ascii_case("gs") {
                    CloudScheme::Gcs
                } else {
                    CloudScheme::S3
                };
                let rest = &trimmed[scheme.len() + 3..];
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(ConfigError::malformed(
                        "OutputLocation",
                        "output_location",
                        format!("missing bucket name in {trimmed}"),
                    ));
                }
                Ok(Self::Cloud {
                    scheme: cloud,
                    bucket: bucket.to_string(),
                    // Double slashes create empty-named folders in object storage.
                    prefix: prefix.trim_matches('/').to_string(),
                })
            }
            other => Err(ConfigError::malformed(
                "OutputLocation",
                "output_location",
                format!(
                    "unsupported URL scheme \"{other}\"; use a local path, http://, https://, gs:// or s3://"
                ),
            )),
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Local(_))
    }

    pub fn local_dir(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path),
            _ => None,
        }
    }

    /// Remote key or URL for a path relative to the output root.
    pub fn remote_target(&self, relative: &str) -> Option<String> {
        let relative = relative.trim_start_matches('/');
        match self {
            Self::Local(_) => None,
            Self::Http(url) => Some(format!("{}/{}", url.as_str().trim_end_matches('/'), relative)),
            Self::Cloud { prefix, .. } if prefix.is_empty() => Some(relative.to_string()),
            Self::Cloud { prefix, .. } => Some(format!("{prefix}/{relative}")),
        }
    }
}

impl fmt::Display for OutputLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Http(url) => write!(f, "{url}"),
            Self::Cloud {
                scheme,
                bucket,
                prefix,
            } => write!(f, "{}://{}/{}", scheme.url_scheme(), bucket, prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigErrorKind;

    #[test]
    fn plain_paths_are_local() {
        assert_eq!(
            OutputLocation::parse("output_files").unwrap(),
            OutputLocation::Local(PathBuf::from("output_files"))
        );
        assert_eq!(
            OutputLocation::parse(r"C:\media\out").unwrap(),
            OutputLocation::Local(PathBuf::from(r"C:\media\out"))
        );
    }

    #[test]
    fn http_targets_join_with_slash() {
        let location = OutputLocation::parse("https://cdn.example.com/live/").unwrap();
        assert!(location.is_remote());
        assert_eq!(
            location.remote_target("video_1080p_4M_h264_1.mp4").as_deref(),
            Some("https://cdn.example.com/live/video_1080p_4M_h264_1.mp4")
        );
    }

    #[test]
    fn cloud_prefix_is_normalized() {
        let location = OutputLocation::parse("gs://bucket/a/b/").unwrap();
        assert_eq!(
            location,
            OutputLocation::Cloud {
                scheme: CloudScheme::Gcs,
                bucket: "bucket".into(),
                prefix: "a/b".into(),
            }
        );
        assert_eq!(location.remote_target("dash.mpd").as_deref(), Some("a/b/dash.mpd"));

        let bare = OutputLocation::parse("s3://bucket").unwrap();
        assert_eq!(bare.remote_target("hls.m3u8").as_deref(), Some("hls.m3u8"));
    }

    #[test]
    fn unknown_schemes_are_malformed() {
        let err = OutputLocation::parse("ftp://host/dir").unwrap_err();
        assert_eq!(err.kind(), ConfigErrorKind::MalformedField);
        assert_eq!(err.field(), "output_location");
        assert!(OutputLocation::parse("gs:///x").is_err());
    }
}
