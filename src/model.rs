//! # Model
//!
//! Data types shared by the queue store, the resolvers and the player.
//!
//! The JSON shapes here are the wire format of the durable queue, so field
//! names are fixed (`requested_by`, `enqueued_at`, ...) and durations are
//! encoded as integer nanoseconds to stay readable by every shard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Default playback volume, in percent.
pub const DEFAULT_VOLUME: i32 = 100;

/// Where a track came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    YouTube,
    Spotify,
    SoundCloud,
    #[default]
    #[serde(other)]
    Unknown,
}

impl TrackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackSource::YouTube => "youtube",
            TrackSource::Spotify => "spotify",
            TrackSource::SoundCloud => "soundcloud",
            TrackSource::Unknown => "unknown",
        }
    }

    /// Classifies raw user input by the shape of its link.
    pub fn detect(input: &str) -> Self {
        let lower = input.trim().to_lowercase();
        if lower.contains("spotify.com") || lower.starts_with("spotify:track:") {
            TrackSource::Spotify
        } else if lower.contains("soundcloud.com") {
            TrackSource::SoundCloud
        } else if lower.contains("youtube.com") || lower.contains("youtu.be") {
            TrackSource::YouTube
        } else {
            TrackSource::Unknown
        }
    }

    /// Parses a provider hint as typed by a user (`yt`, `spotify`, `auto`...).
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim().to_lowercase().as_str() {
            "youtube" | "yt" => TrackSource::YouTube,
            "spotify" | "sp" => TrackSource::Spotify,
            "soundcloud" | "sc" => TrackSource::SoundCloud,
            _ => TrackSource::Unknown,
        }
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved track. `url` is re-resolvable, not the final media URL.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub url: String,
    pub source: TrackSource,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub thumbnail: String,
    pub requested_by: String,
}

/// A track waiting in a guild queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub track: Track,
    #[serde(default)]
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(track: Track, priority: i32) -> Self {
        Self {
            track,
            priority,
            enqueued_at: Utc::now(),
        }
    }

    /// Same track and priority, stamped now. Used when a played item goes
    /// back to the end of the queue.
    pub fn fresh_copy(&self) -> Self {
        Self::new(self.track.clone(), self.priority)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    None,
    Track,
    Queue,
}

impl RepeatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatMode::None => "none",
            RepeatMode::Track => "track",
            RepeatMode::Queue => "queue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "none" => Some(RepeatMode::None),
            "track" => Some(RepeatMode::Track),
            "queue" => Some(RepeatMode::Queue),
            _ => None,
        }
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-guild playback settings. Always written as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub repeat_mode: RepeatMode,
    pub shuffle: bool,
    pub volume: i32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            repeat_mode: RepeatMode::None,
            shuffle: false,
            volume: DEFAULT_VOLUME,
        }
    }
}

/// Snapshot of what a player is doing right now. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackState {
    pub track: Option<Track>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_nanos")]
    pub position: Duration,
    pub volume: i32,
    pub is_playing: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            track: None,
            started_at: None,
            paused_at: None,
            position: Duration::ZERO,
            volume: DEFAULT_VOLUME,
            is_playing: false,
        }
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}
