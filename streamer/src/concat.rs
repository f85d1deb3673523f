//! Joins the manifests of a multi-period run into one presentation.
//!
//! Each period is packaged into its own `period_<n>/` directory. Once all of
//! them are done the DASH manifests are merged into a single multi-period
//! MPD, and the HLS media playlists are chained with discontinuities. Both
//! land at the output root and point back into the period directories.

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::config::{ManifestFormat, PipelineConfig};
use crate::error::{Error, Result};

static URI_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"URI="([^"]*)""#).unwrap());
static BANDWIDTH_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([:,])BANDWIDTH=(\d+)").unwrap());

/// Tags a joined media playlist carries once, taken from the first period.
const HLS_HEADER_TAGS: &[&str] = &[
    "#EXTM3U",
    "#EXT-X-VERSION",
    "#EXT-X-PLAYLIST-TYPE",
    "#EXT-X-MEDIA-SEQUENCE",
    "#EXT-X-INDEPENDENT-SEGMENTS",
];

/// A packaged period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodDir {
    pub path: PathBuf,
    /// `path` relative to the output root, `/`-separated.
    pub relative: String,
}

/// File names of the manifests to join; `None` for formats not produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestNames {
    pub dash: Option<String>,
    pub hls: Option<String>,
}

impl ManifestNames {
    pub fn for_pipeline(pipeline: &PipelineConfig) -> Self {
        Self {
            dash: pipeline
                .has_manifest(ManifestFormat::Dash)
                .then(|| pipeline.dash_output.clone()),
            hls: pipeline
                .has_manifest(ManifestFormat::Hls)
                .then(|| pipeline.hls_output.clone()),
        }
    }
}

/// Writes the joined manifests into `output_dir`.
pub fn concat_periods(names: &ManifestNames, output_dir: &Path, periods: &[PeriodDir]) -> Result<()> {
    if periods.is_empty() {
        return Ok(());
    }
    if let Some(name) = &names.dash {
        concat_dash(name, output_dir, periods)?;
    }
    if let Some(name) = &names.hls {
        concat_hls(name, output_dir, periods)?;
    }
    info!(
        periods = periods.len(),
        output = %output_dir.display(),
        "Joined period manifests"
    );
    Ok(())
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::resource("reading", path, e))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::resource("creating", parent, e))?;
    }
    std::fs::write(path, contents).map_err(|e| Error::resource("writing", path, e))
}

/// The parts of a single-period MPD that get rearranged, as byte ranges
/// into its text.
struct Mpd<'a> {
    text: &'a str,
    root: BytesStart<'a>,
    root_span: Range<usize>,
    period: BytesStart<'a>,
    /// The whole `Period` element.
    period_span: Range<usize>,
    /// Where the `Period` start tag ends.
    period_body: usize,
}

impl<'a> Mpd<'a> {
    fn parse(text: &'a str, path: &Path) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        let mut depth = 0usize;
        let mut root = None;
        let mut period: Option<(BytesStart<'a>, usize, usize)> = None;
        let mut period_end = None;

        loop {
            let begin = reader.buffer_position() as usize;
            let event = reader.read_event().map_err(|e| Error::manifest(path, e))?;
            let end = reader.buffer_position() as usize;
            match event {
                Event::Start(tag) => {
                    depth += 1;
                    let name = tag.local_name();
                    if depth == 1 && name.as_ref() == b"MPD" {
                        root = Some((tag, begin..end));
                    } else if depth == 2 && period.is_none() && name.as_ref() == b"Period" {
                        period = Some((tag, begin, end));
                    }
                }
                Event::End(_) => {
                    if depth == 2 && period_end.is_none() {
                        period_end = period.as_ref().map(|(_, start, _)| *start..end);
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let (root, root_span) = root.ok_or_else(|| Error::manifest(path, "no MPD element"))?;
        let (period, _, period_body) =
            period.ok_or_else(|| Error::manifest(path, "no Period element"))?;
        let period_span = period_end.ok_or_else(|| Error::manifest(path, "unterminated Period"))?;
        Ok(Self {
            text,
            root,
            root_span,
            period,
            period_span,
            period_body,
        })
    }
}

fn attribute(tag: &BytesStart<'_>, key: &[u8], path: &Path) -> Result<Option<String>> {
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| Error::manifest(path, e))?;
        if attr.key.as_ref() == key {
            let value = attr.unescape_value().map_err(|e| Error::manifest(path, e))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// `tag` as a start tag again, without the `drop` attribute and with
/// `extra` appended.
fn rewrite_tag(
    tag: &BytesStart<'_>,
    drop: &[u8],
    extra: Option<(&str, &str)>,
    path: &Path,
) -> Result<String> {
    let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| Error::manifest(path, e))?;
        if attr.key.as_ref() != drop {
            out.push_attribute(attr);
        }
    }
    if let Some(extra) = extra {
        out.push_attribute(extra);
    }

    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Start(out))
        .map_err(|e| Error::manifest(path, e))?;
    String::from_utf8(writer.into_inner()).map_err(|e| Error::manifest(path, e))
}

/// The first period's document with every period's `Period` in place of
/// its own. Each period gets its duration and a `BaseURL` into its
/// directory; the document-wide duration is dropped.
fn concat_dash(name: &str, output_dir: &Path, periods: &[PeriodDir]) -> Result<()> {
    let paths: Vec<PathBuf> = periods.iter().map(|p| p.path.join(name)).collect();
    let texts = paths
        .iter()
        .map(|path| read_file(path))
        .collect::<Result<Vec<_>>>()?;
    let mpds = texts
        .iter()
        .zip(&paths)
        .map(|(text, path)| Mpd::parse(text, path))
        .collect::<Result<Vec<_>>>()?;
    let (Some(first), Some(first_path)) = (mpds.first(), paths.first()) else {
        return Ok(());
    };

    let mut out = String::with_capacity(texts.iter().map(String::len).sum());
    out.push_str(&first.text[..first.root_span.start]);
    out.push_str(&rewrite_tag(
        &first.root,
        b"mediaPresentationDuration",
        None,
        first_path,
    )?);
    out.push_str(&first.text[first.root_span.end..first.period_span.start]);

    for (i, ((mpd, path), period)) in mpds.iter().zip(&paths).zip(periods).enumerate() {
        let duration = attribute(&mpd.root, b"mediaPresentationDuration", path)?
            .ok_or_else(|| Error::manifest(path, "no mediaPresentationDuration"))?;
        if i > 0 {
            out.push_str("\n  ");
        }
        out.push_str(&rewrite_tag(
            &mpd.period,
            b"duration",
            Some(("duration", &duration)),
            path,
        )?);
        let base_url = format!("{}/", period.relative);
        out.push_str("<BaseURL>");
        out.push_str(&quick_xml::escape::escape(base_url.as_str()));
        out.push_str("</BaseURL>");
        out.push_str(&mpd.text[mpd.period_body..mpd.period_span.end]);
    }
    out.push_str(&first.text[first.period_span.end..]);

    let target = output_dir.join(name);
    write_file(&target, &out)?;
    debug!(path = %target.display(), periods = periods.len(), "Wrote multi-period MPD");
    Ok(())
}

/// A media playlist named by a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlaylistRef {
    uri: String,
    bandwidth: Option<u64>,
}

fn uri_attr(line: &str) -> Option<String> {
    URI_ATTR.captures(line).map(|caps| caps[1].to_string())
}

fn bandwidth_attr(line: &str) -> Option<u64> {
    BANDWIDTH_ATTR
        .captures(line)
        .and_then(|caps| caps[2].parse().ok())
}

fn is_rendition(line: &str) -> bool {
    line.starts_with("#EXT-X-MEDIA:") || line.starts_with("#EXT-X-I-FRAME-STREAM-INF:")
}

fn playlist_refs(master: &str) -> Vec<PlaylistRef> {
    let mut refs = Vec::new();
    let mut lines = master.lines().map(str::trim);
    while let Some(line) = lines.next() {
        if line.starts_with("#EXT-X-STREAM-INF:") {
            if let Some(uri) = lines.next() {
                refs.push(PlaylistRef {
                    uri: uri.to_string(),
                    bandwidth: bandwidth_attr(line),
                });
            }
        } else if is_rendition(line) {
            if let Some(uri) = uri_attr(line) {
                refs.push(PlaylistRef {
                    uri,
                    bandwidth: None,
                });
            }
        }
    }
    refs
}

/// `uri` as seen from the output root.
fn rebase(uri: &str, prefix: &str) -> String {
    if uri.contains("://") || uri.starts_with('/') {
        uri.to_string()
    } else {
        format!("{prefix}/{uri}")
    }
}

fn join_media_playlists(sources: &[(PathBuf, &str)]) -> Result<String> {
    let mut header: Vec<String> = Vec::new();
    let mut body = String::new();
    let mut target_duration = 0u64;

    for (i, (path, prefix)) in sources.iter().enumerate() {
        let text = read_file(path)?;
        if i > 0 {
            body.push_str("#EXT-X-DISCONTINUITY\n");
        }
        for line in text.lines().map(str::trim_end) {
            if line.is_empty() || line == "#EXT-X-ENDLIST" {
                continue;
            }
            if HLS_HEADER_TAGS.iter().any(|tag| line.starts_with(tag)) {
                if i == 0 {
                    header.push(line.to_string());
                }
            } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                let value: u64 = value.trim().parse().map_err(|e| Error::manifest(path, e))?;
                target_duration = target_duration.max(value);
            } else if line.starts_with("#EXT-X-MAP:") {
                let line = URI_ATTR.replace(line, |caps: &Captures<'_>| {
                    format!("URI=\"{}\"", rebase(&caps[1], prefix))
                });
                body.push_str(&line);
                body.push('\n');
            } else if line.starts_with('#') {
                body.push_str(line);
                body.push('\n');
            } else {
                body.push_str(&rebase(line, prefix));
                body.push('\n');
            }
        }
    }

    let mut out = header.join("\n");
    out.push('\n');
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
    out.push_str(&body);
    out.push_str("#EXT-X-ENDLIST\n");
    Ok(out)
}

/// Chains each media playlist listed by every period, and writes the first
/// period's master playlist restricted to those, with the peak bandwidth
/// over all periods.
fn concat_hls(name: &str, output_dir: &Path, periods: &[PeriodDir]) -> Result<()> {
    let masters = periods
        .iter()
        .map(|p| read_file(&p.path.join(name)))
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<Vec<PlaylistRef>> = masters.iter().map(|m| playlist_refs(m)).collect();
    let Some((first_master, first_refs)) = masters.first().zip(refs.first()) else {
        return Ok(());
    };

    let mut kept = BTreeSet::new();
    let mut peak: BTreeMap<&str, u64> = BTreeMap::new();
    for playlist in first_refs {
        let everywhere = refs[1..]
            .iter()
            .all(|period| period.iter().any(|r| r.uri == playlist.uri));
        if !everywhere {
            warn!(playlist = %playlist.uri, "Playlist missing from some periods, dropped");
            continue;
        }
        kept.insert(playlist.uri.as_str());
        for r in refs.iter().flatten().filter(|r| r.uri == playlist.uri) {
            if let Some(bandwidth) = r.bandwidth {
                let entry = peak.entry(playlist.uri.as_str()).or_default();
                *entry = (*entry).max(bandwidth);
            }
        }
    }

    for uri in &kept {
        let sources: Vec<(PathBuf, &str)> = periods
            .iter()
            .map(|p| (p.path.join(uri), p.relative.as_str()))
            .collect();
        let joined = join_media_playlists(&sources)?;
        write_file(&output_dir.join(uri), &joined)?;
    }

    let mut out = String::with_capacity(first_master.len());
    let mut lines = first_master.lines().map(str::trim_end);
    while let Some(line) = lines.next() {
        if line.starts_with("#EXT-X-STREAM-INF:") {
            let Some(uri) = lines.next() else {
                break;
            };
            let uri = uri.trim();
            if !kept.contains(uri) {
                continue;
            }
            match peak.get(uri) {
                Some(bandwidth) => out.push_str(
                    &BANDWIDTH_ATTR.replace(line, format!("${{1}}BANDWIDTH={bandwidth}")),
                ),
                None => out.push_str(line),
            }
            out.push('\n');
            out.push_str(uri);
        } else if is_rendition(line) && uri_attr(line).is_some_and(|uri| !kept.contains(uri.as_str())) {
            continue;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    let target = output_dir.join(name);
    write_file(&target, &out)?;
    debug!(path = %target.display(), playlists = kept.len(), "Wrote multi-period HLS");
    Ok(())
}
