use async_trait::async_trait;
use serde::Deserialize;
use std::{path::PathBuf, process::Stdio, time::Duration};
use tokio::{process::Command, time::timeout};
use tracing::{debug, info};

use super::{detect_source_from_url, looks_like_url, ResolveError, TrackResolver};
use crate::model::{Track, TrackSource};

pub const DEFAULT_SEARCH_LIMIT: usize = 6;
pub const MAX_SEARCH_LIMIT: usize = 10;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const UNKNOWN_TITLE: &str = "Unknown Title";

/// Resolver that runs `yt-dlp` once per call and parses its JSON output.
#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    binary: String,
    tmp_dir: Option<PathBuf>,
    timeout: Duration,
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpResolver {
    pub fn new() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            tmp_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Scratch directory passed as `--paths` and exported as `TMPDIR`.
    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `yt-dlp --version`, used by the health check.
    pub async fn version(&self) -> Result<String, ResolveError> {
        let stdout = self.run(vec!["--version".to_string()]).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec!["--no-warnings".to_string()];
        if let Some(dir) = &self.tmp_dir {
            args.push("--paths".to_string());
            args.push(dir.display().to_string());
        }
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<Vec<u8>, ResolveError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(dir) = &self.tmp_dir {
            cmd.env("TMPDIR", dir).env("TEMP", dir).env("TMP", dir);
        }

        debug!(binary = %self.binary, ?args, "running extractor");
        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ResolveError::Launch {
                    binary: self.binary.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ResolveError::Timeout {
                    binary: self.binary.clone(),
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(ResolveError::Failed {
                binary: self.binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, input: &str, source_hint: TrackSource) -> Result<Track, ResolveError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ResolveError::EmptyInput);
        }

        let mut args = self.common_args();
        args.extend(
            ["--dump-single-json", "--skip-download", "--no-playlist"].map(String::from),
        );
        args.push(search_target(input, source_hint, 1));

        let stdout = self.run(args).await?;
        let root: YtDlpItem = serde_json::from_slice(&stdout)?;
        let track = pick_item(root)?
            .into_track(source_hint)
            .ok_or(ResolveError::NoUsableEntries)?;

        info!(title = %track.title, source = %track.source, "🔍 resolved track");
        Ok(track)
    }

    async fn resolve_search(
        &self,
        input: &str,
        source_hint: TrackSource,
        limit: usize,
    ) -> Result<Vec<Track>, ResolveError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ResolveError::EmptyInput);
        }

        let limit = clamp_search_limit(limit);
        if looks_like_url(input) {
            return Ok(vec![self.resolve(input, source_hint).await?]);
        }

        let mut args = self.common_args();
        args.extend(
            [
                "--dump-single-json",
                "--skip-download",
                "--no-playlist",
                "--flat-playlist",
            ]
            .map(String::from),
        );
        args.push(search_target(input, source_hint, limit));

        let stdout = self.run(args).await?;
        let root: YtDlpItem = serde_json::from_slice(&stdout)?;
        let tracks: Vec<Track> = pick_items(root, limit)
            .into_iter()
            .filter_map(|item| item.into_track(source_hint))
            .collect();

        if tracks.is_empty() {
            return Err(ResolveError::NoUsableEntries);
        }

        info!(query = %input, results = tracks.len(), "🔍 search finished");
        Ok(tracks)
    }

    async fn resolve_stream_url(
        &self,
        input: &str,
        source_hint: TrackSource,
    ) -> Result<String, ResolveError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ResolveError::EmptyInput);
        }

        let mut args = self.common_args();
        args.extend(["-f", "bestaudio", "-g", "--no-playlist"].map(String::from));
        args.push(search_target(input, source_hint, 1));

        let stdout = self.run(args).await?;
        first_line(&String::from_utf8_lossy(&stdout)).ok_or(ResolveError::EmptyStreamUrl)
    }
}

/// URLs pass through untouched, anything else becomes a source-specific
/// search expression.
fn search_target(input: &str, source_hint: TrackSource, count: usize) -> String {
    if looks_like_url(input) {
        return input.to_string();
    }
    let prefix = match source_hint {
        TrackSource::SoundCloud => "scsearch",
        _ => "ytsearch",
    };
    format!("{prefix}{count}:{input}")
}

fn clamp_search_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_SEARCH_LIMIT,
        n => n.min(MAX_SEARCH_LIMIT),
    }
}

fn first_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YtDlpItem {
    id: Option<String>,
    title: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    entries: Vec<YtDlpItem>,
}

impl YtDlpItem {
    fn link(&self) -> Option<&str> {
        [&self.webpage_url, &self.url]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }

    fn is_usable(&self) -> bool {
        self.link().is_some() || self.title.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    fn into_track(self, source_hint: TrackSource) -> Option<Track> {
        let link = self.link()?.to_string();

        let title = self
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(UNKNOWN_TITLE)
            .to_string();

        let source = match source_hint {
            TrackSource::Unknown => detect_source_from_url(&link),
            hint => hint,
        };

        let duration = self
            .duration
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_default();

        Some(Track {
            id: self.id.unwrap_or_default(),
            title,
            url: link,
            source,
            duration,
            thumbnail: self.thumbnail.unwrap_or_default(),
            requested_by: String::new(),
        })
    }
}

fn pick_item(root: YtDlpItem) -> Result<YtDlpItem, ResolveError> {
    if root.entries.is_empty() {
        return Ok(root);
    }
    root.entries
        .into_iter()
        .find(YtDlpItem::is_usable)
        .ok_or(ResolveError::NoUsableEntries)
}

fn pick_items(root: YtDlpItem, limit: usize) -> Vec<YtDlpItem> {
    if root.entries.is_empty() {
        return if root.is_usable() { vec![root] } else { Vec::new() };
    }
    root.entries
        .into_iter()
        .filter(YtDlpItem::is_usable)
        .take(limit.max(1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("lofi beats", TrackSource::Unknown, 1, "ytsearch1:lofi beats")]
    #[case("lofi beats", TrackSource::SoundCloud, 1, "scsearch1:lofi beats")]
    #[case("lofi beats", TrackSource::YouTube, 5, "ytsearch5:lofi beats")]
    #[case("https://youtu.be/abc", TrackSource::SoundCloud, 5, "https://youtu.be/abc")]
    fn builds_search_targets(
        #[case] input: &str,
        #[case] hint: TrackSource,
        #[case] count: usize,
        #[case] expected: &str,
    ) {
        assert_eq!(search_target(input, hint, count), expected);
    }

    #[rstest]
    #[case(0, DEFAULT_SEARCH_LIMIT)]
    #[case(3, 3)]
    #[case(50, MAX_SEARCH_LIMIT)]
    fn caps_search_limit(#[case] requested: usize, #[case] expected: usize) {
        assert_eq!(clamp_search_limit(requested), expected);
    }

    #[test]
    fn search_output_skips_unusable_entries() {
        let json = r#"{
            "entries": [
                {"id": "", "title": "", "url": ""},
                {"id": "a", "title": "First", "url": "https://www.youtube.com/watch?v=a", "duration": 61.5},
                {"id": "b", "title": "  ", "webpage_url": "https://www.youtube.com/watch?v=b", "duration": null},
                {"id": "c", "title": "Third", "url": "https://www.youtube.com/watch?v=c"}
            ]
        }"#;
        let root: YtDlpItem = serde_json::from_str(json).unwrap();
        let tracks: Vec<Track> = pick_items(root, 2)
            .into_iter()
            .filter_map(|item| item.into_track(TrackSource::Unknown))
            .collect();

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].title, "First");
        assert_eq!(tracks[0].source, TrackSource::YouTube);
        assert_eq!(tracks[0].duration, Duration::from_millis(61_500));
        assert_eq!(tracks[1].title, UNKNOWN_TITLE);
        assert_eq!(tracks[1].duration, Duration::ZERO);
    }

    #[test]
    fn single_item_prefers_webpage_url_and_keeps_hint() {
        let json = r#"{"id": "x", "title": "Song", "webpage_url": "https://soundcloud.com/a/song",
                       "url": "https://cdn.example/x.mp3", "thumbnail": "https://img/x.jpg"}"#;
        let root: YtDlpItem = serde_json::from_str(json).unwrap();
        let track = pick_item(root)
            .unwrap()
            .into_track(TrackSource::SoundCloud)
            .unwrap();

        assert_eq!(track.url, "https://soundcloud.com/a/song");
        assert_eq!(track.source, TrackSource::SoundCloud);
        assert_eq!(track.thumbnail, "https://img/x.jpg");
        assert!(track.requested_by.is_empty());
    }

    #[test]
    fn empty_entry_lists_are_resolution_failures() {
        let root: YtDlpItem =
            serde_json::from_str(r#"{"entries": [{"title": ""}, {}]}"#).unwrap();
        assert!(matches!(pick_item(root), Err(ResolveError::NoUsableEntries)));

        let root: YtDlpItem = serde_json::from_str(r#"{"entries": []}"#).unwrap();
        assert!(pick_items(root, 5).is_empty());
    }

    #[test]
    fn stream_url_is_first_non_empty_line() {
        assert_eq!(
            first_line("\n  https://cdn.example/audio?sig=1  \nhttps://other\n"),
            Some("https://cdn.example/audio?sig=1".to_string())
        );
        assert_eq!(first_line("  \n"), None);
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let resolver = YtDlpResolver::new().with_binary("/nonexistent/yt-dlp-for-tests");
        let err = resolver
            .resolve("https://youtu.be/abc", TrackSource::YouTube)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Launch { .. }));
    }

    #[tokio::test]
    async fn blank_input_is_rejected_before_spawning() {
        let resolver = YtDlpResolver::new().with_binary("/nonexistent/yt-dlp-for-tests");
        let err = resolver
            .resolve_stream_url("   ", TrackSource::Unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::EmptyInput));
    }
}
