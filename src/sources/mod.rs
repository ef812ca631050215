//! # Sources Module
//!
//! Turns user input into [`Track`] metadata and, at play time, into a direct
//! media URL.
//!
//! - [`ytdlp`] - [`YtDlpResolver`], shells out to `yt-dlp` for metadata,
//!   search results and streamable URLs
//! - [`spotify`] - [`SpotifyClient`], catalog metadata only (never playable
//!   audio); its results are bridged through the resolver by the service

pub mod spotify;
pub mod ytdlp;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::model::{Track, TrackSource};

pub use spotify::{CatalogError, SpotifyClient};
pub use ytdlp::YtDlpResolver;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("empty input")]
    EmptyInput,

    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} timed out after {timeout:?}")]
    Timeout { binary: String, timeout: Duration },

    #[error("{binary} exited with {status}: {stderr}")]
    Failed {
        binary: String,
        status: String,
        stderr: String,
    },

    #[error("invalid extractor output: {0}")]
    InvalidOutput(#[from] serde_json::Error),

    #[error("no usable entries")]
    NoUsableEntries,

    #[error("empty stream url")]
    EmptyStreamUrl,
}

/// Something that can find playable tracks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Resolves a URL or free-text query to a single track.
    async fn resolve(&self, input: &str, source_hint: TrackSource) -> Result<Track, ResolveError>;

    /// Up to `limit` candidates for a query.
    async fn resolve_search(
        &self,
        input: &str,
        source_hint: TrackSource,
        limit: usize,
    ) -> Result<Vec<Track>, ResolveError>;

    /// A direct, possibly short-lived media URL. Call it again for every
    /// playback attempt.
    async fn resolve_stream_url(
        &self,
        input: &str,
        source_hint: TrackSource,
    ) -> Result<String, ResolveError>;
}

/// A metadata catalog whose tracks must be bridged to a [`TrackResolver`]
/// before they can be played.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Accepts only the catalog's own track links/URIs.
    async fn resolve_track(&self, input: &str) -> Result<Track, CatalogError>;

    async fn search_tracks(&self, query: &str, limit: usize) -> Result<Vec<Track>, CatalogError>;

    async fn search_track(&self, query: &str) -> Result<Track, CatalogError> {
        self.search_tracks(query, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(CatalogError::NoResults)
    }
}

/// True for catalog links (`open.spotify.com/...`, `spotify:track:...`).
pub fn is_catalog_link(input: &str) -> bool {
    let lower = input.trim().to_lowercase();
    lower.contains("spotify.com") || lower.starts_with("spotify:track:")
}

/// Whether input should go through the catalog before the resolver.
pub fn is_catalog_input(input: &str, source_hint: TrackSource) -> bool {
    source_hint == TrackSource::Spotify || is_catalog_link(input)
}

pub fn looks_like_url(value: &str) -> bool {
    if value.starts_with("http://") || value.starts_with("https://") {
        return true;
    }
    Url::parse(value).is_ok_and(|url| url.has_host() && !url.scheme().is_empty())
}

pub fn detect_source_from_url(raw: &str) -> TrackSource {
    let Ok(url) = Url::parse(raw) else {
        return TrackSource::Unknown;
    };
    let host = url.host_str().unwrap_or_default().to_lowercase();

    if host.contains("youtube.com") || host.contains("youtu.be") {
        TrackSource::YouTube
    } else if host.contains("soundcloud.com") {
        TrackSource::SoundCloud
    } else if host.contains("spotify.com") {
        TrackSource::Spotify
    } else {
        TrackSource::Unknown
    }
}
