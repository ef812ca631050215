//! # tunebot
//!
//! Per-guild music playback engine for Discord bots.
//!
//! - [`queue`] - durable priority queue and per-guild settings (Redis)
//! - [`sources`] - yt-dlp resolver and Spotify catalog client
//! - [`service`] - [`PlaybackService`], the orchestration layer
//! - [`audio`] - per-guild [`Player`] and the [`PlayerManager`] registry
//!
//! The embedding bot supplies a [`VoiceGateway`]; everything else is built
//! from [`Config`].
//!
//! [`Player`]: audio::Player
//! [`PlayerManager`]: audio::PlayerManager
//! [`VoiceGateway`]: audio::VoiceGateway

pub mod audio;
pub mod cache;
pub mod config;
pub mod model;
pub mod queue;
pub mod service;
pub mod sources;

pub use config::Config;
pub use model::{PlaybackState, QueueItem, QueueSettings, RepeatMode, Track, TrackSource};
pub use service::{PlaybackService, ServiceError};
