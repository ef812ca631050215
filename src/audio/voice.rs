//! Voice capabilities the player needs from the gateway layer.
//!
//! The player only ever pushes ready-made 20 ms Opus frames and toggles the
//! speaking flag; joining channels and encrypting RTP belong to whoever
//! implements these traits.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("user is not in a voice channel")]
    NoVoiceChannel,

    #[error("voice connection not established")]
    NotConnected,

    #[error("failed to join voice channel: {0}")]
    Join(String),

    #[error("voice connection closed")]
    Closed,
}

/// An established voice connection.
#[async_trait]
pub trait VoiceSink: Send + Sync {
    /// Sends one encoded Opus frame. May wait for the connection to accept
    /// it; callers apply their own timeout.
    async fn send_frame(&self, frame: Bytes) -> Result<(), VoiceError>;

    async fn set_speaking(&self, speaking: bool);

    async fn disconnect(&self);
}

#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// The voice channel a user currently sits in, if any.
    async fn user_voice_channel(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<Option<ChannelId>, VoiceError>;

    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceSink>, VoiceError>;
}

/// Sink that forwards frames into a bounded channel, for gateways that run
/// their own transmit loop.
#[derive(Debug)]
pub struct ChannelVoiceSink {
    channel_id: ChannelId,
    frames: Mutex<Option<flume::Sender<Bytes>>>,
    speaking: AtomicBool,
}

impl ChannelVoiceSink {
    pub fn new(channel_id: ChannelId, frames: flume::Sender<Bytes>) -> Self {
        Self {
            channel_id,
            frames: Mutex::new(Some(frames)),
            speaking: AtomicBool::new(false),
        }
    }

    /// A sink plus the receiving end of its frame channel.
    pub fn bounded(channel_id: ChannelId, capacity: usize) -> (Self, flume::Receiver<Bytes>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self::new(channel_id, tx), rx)
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.frames.lock().is_some()
    }
}

#[async_trait]
impl VoiceSink for ChannelVoiceSink {
    async fn send_frame(&self, frame: Bytes) -> Result<(), VoiceError> {
        let frames = self.frames.lock().clone().ok_or(VoiceError::Closed)?;
        frames.send_async(frame).await.map_err(|_| VoiceError::Closed)
    }

    async fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::Release);
    }

    async fn disconnect(&self) {
        self.speaking.store(false, Ordering::Release);
        if self.frames.lock().take().is_some() {
            debug!(channel_id = %self.channel_id, "voice sink disconnected");
        }
    }
}
