use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use regex::Regex;
use reqwest::{header::AUTHORIZATION, Client};
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    sync::LazyLock,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::CatalogProvider;
use crate::model::{Track, TrackSource};

pub const MAX_CATALOG_SEARCH_LIMIT: usize = 10;

const API_BASE: &str = "https://api.spotify.com/v1";
const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
const TRACK_URL_BASE: &str = "https://open.spotify.com/track";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

static TRACK_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"open\.spotify\.com/(?:intl-[A-Za-z-]+/)?track/([A-Za-z0-9]+)")
        .expect("track link pattern is valid")
});

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not a spotify track link: {0}")]
    UnsupportedInput(String),

    #[error("empty query")]
    EmptyQuery,

    #[error("spotify client credentials are missing")]
    MissingCredentials,

    #[error("spotify request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("spotify api returned status {status}")]
    Status { status: u16 },

    #[error("spotify returned an empty access token")]
    EmptyToken,

    #[error("no catalog results")]
    NoResults,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Spotify Web API client using the client-credentials flow.
///
/// The token is cached and refreshed `TOKEN_REFRESH_MARGIN` before it
/// expires. Refresh happens under the token lock, so concurrent callers
/// wait for one request instead of racing.
pub struct SpotifyClient {
    client_id: String,
    client_secret: String,
    http: Client,
    api_base: String,
    accounts_base: String,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyClient {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            http,
            api_base: API_BASE.to_string(),
            accounts_base: ACCOUNTS_BASE.to_string(),
            token: Mutex::new(None),
        }
    }

    /// Points the client at other hosts (a proxy or a local mock).
    pub fn with_endpoints(
        mut self,
        api_base: impl Into<String>,
        accounts_base: impl Into<String>,
    ) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.accounts_base = accounts_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Track id from an `open.spotify.com/track/<id>` link or a
    /// `spotify:track:<id>` URI.
    pub fn extract_track_id(input: &str) -> Option<String> {
        let input = input.trim();
        if let Some(id) = input.strip_prefix("spotify:track:") {
            return (!id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()))
                .then(|| id.to_string());
        }
        TRACK_LINK
            .captures(input)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    async fn access_token(&self) -> Result<String, CatalogError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(CatalogError::MissingCredentials);
        }

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        debug!("requesting spotify access token");
        let credentials = BASE64_STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
        let response = self
            .http
            .post(format!("{}/api/token", self.accounts_base))
            .header(AUTHORIZATION, format!("Basic {credentials}"))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let token: TokenResponse = read_json(response).await?;
        if token.access_token.is_empty() {
            return Err(CatalogError::EmptyToken);
        }

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CatalogError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}{path}", self.api_base))
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        read_json(response).await
    }
}

#[async_trait]
impl CatalogProvider for SpotifyClient {
    async fn resolve_track(&self, input: &str) -> Result<Track, CatalogError> {
        let id = Self::extract_track_id(input)
            .ok_or_else(|| CatalogError::UnsupportedInput(input.trim().to_string()))?;

        let track: SpotifyTrack = self.get(&format!("/tracks/{id}"), &[]).await?;
        let track = track.into_track();
        info!(title = %track.title, "🎧 resolved spotify track");
        Ok(track)
    }

    async fn search_tracks(&self, query: &str, limit: usize) -> Result<Vec<Track>, CatalogError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CatalogError::EmptyQuery);
        }
        let limit = limit.clamp(1, MAX_CATALOG_SEARCH_LIMIT).to_string();

        let page: SearchResponse = self
            .get("/search", &[("type", "track"), ("limit", &limit), ("q", query)])
            .await?;

        let tracks: Vec<Track> = page
            .tracks
            .items
            .into_iter()
            .map(SpotifyTrack::into_track)
            .collect();
        if tracks.is_empty() {
            return Err(CatalogError::NoResults);
        }
        Ok(tracks)
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CatalogError> {
    let status = response.status();
    if !status.is_success() {
        return Err(CatalogError::Status {
            status: status.as_u16(),
        });
    }
    Ok(response.json().await?)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: SearchPage,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    id: String,
    name: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
    #[serde(default)]
    album: Option<SpotifyAlbum>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    #[serde(default)]
    images: Vec<SpotifyImage>,
}

#[derive(Debug, Deserialize)]
struct SpotifyImage {
    url: String,
}

impl SpotifyTrack {
    fn into_track(self) -> Track {
        let artists = self
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        let title = if artists.is_empty() {
            self.name
        } else {
            format!("{} - {artists}", self.name)
        };
        let thumbnail = self
            .album
            .and_then(|album| album.images.into_iter().next())
            .map(|image| image.url)
            .unwrap_or_default();

        Track {
            url: format!("{TRACK_URL_BASE}/{}", self.id),
            id: self.id,
            title,
            source: TrackSource::Spotify,
            duration: Duration::from_millis(self.duration_ms),
            thumbnail,
            requested_by: String::new(),
        }
    }
}
