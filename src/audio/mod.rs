//! # Audio Module
//!
//! Per-guild playback: everything between a dequeued [`QueueItem`] and Opus
//! frames leaving for the voice connection.
//!
//! ## Architecture
//!
//! ### [`player`] - Player
//! - One background worker per guild pulls items from the durable queue
//! - Skip / stop / pause / restart are asynchronous signals, never blocking
//! - Frames are paced at one per [`FRAME_DURATION`]
//!
//! ### [`manager`] - Player Manager
//! - At most one [`Player`] per guild, created on first use
//! - Tears down idle players
//!
//! ### Pipeline pieces
//! - [`transcoder`] - ffmpeg subprocess producing Ogg/Opus
//! - [`ogg`] - splits the Ogg stream into Opus packets
//! - [`voice`] - the voice sink/gateway capabilities the player drives
//! - [`signal`] - coalescing one-slot control signal
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz
//! - **Channels**: Stereo
//! - **Encoding**: Opus, 20 ms frames, 96kbps VBR by default
//!
//! [`QueueItem`]: crate::model::QueueItem

pub mod manager;
pub mod ogg;
pub mod player;
pub mod signal;
pub mod transcoder;
pub mod voice;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

pub use manager::PlayerManager;
pub use player::{Player, PlayerConfig, PlayerError, StreamOutcome};
pub use transcoder::{FfmpegTranscoder, TranscodeRequest, TranscodeStream, Transcoder};
pub use voice::{ChannelVoiceSink, VoiceError, VoiceGateway, VoiceSink};

/// Playback time covered by one Opus frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Highest accepted volume, in percent.
pub const MAX_VOLUME: i32 = 200;

/// Playback position after `frames` frames.
pub fn position_for(frames: u64) -> Duration {
    let millis = FRAME_DURATION.as_millis() as u64;
    Duration::from_millis(frames.saturating_mul(millis))
}
