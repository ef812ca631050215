//! # Queue Module
//!
//! Durable, priority-ordered, multi-guild work queue plus the small per-guild
//! settings record (repeat mode, shuffle, volume).
//!
//! ## Ordering
//!
//! Every item is stored with a single integer score that packs a two-part key:
//!
//! ```text
//!  63      52 51        42 41                         0
//! +----------+------------+----------------------------+
//! |  unused  |  priority  |   enqueued_at (epoch ms)   |
//! |          |    band    |                            |
//! +----------+------------+----------------------------+
//! ```
//!
//! The band is `MAX_PRIORITY - priority`, so a higher priority always sorts
//! first regardless of timestamps, and within a priority the earliest item
//! wins (FIFO). The whole key fits in 52 bits, which a Redis sorted-set
//! score (an IEEE double) represents exactly.
//!
//! Redis breaks score ties by member bytes, so each member is the item's
//! JSON behind a zero-padded per-guild sequence number
//! (`0000000000000042|{...}`). Equal scores then stay FIFO and identical
//! payloads never collapse into one member.
//!
//! ## Backends
//!
//! - [`RedisQueueStore`] - shared between processes/shards, every mutation is
//!   a single atomic server-side command or script
//! - [`MemoryQueueStore`] - process-local, used by tests and single-node runs

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::model::id::GuildId;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{QueueItem, QueueSettings, RepeatMode};

pub use memory::MemoryQueueStore;
pub use redis_store::RedisQueueStore;

pub const MIN_PRIORITY: i32 = -512;
pub const MAX_PRIORITY: i32 = 511;

const TIMESTAMP_BITS: u32 = 42;
const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,

    #[error("queue backend error: {0}")]
    Backend(#[from] ::redis::RedisError),

    #[error("corrupt queue payload: {0}")]
    Codec(#[from] serde_json::Error),
}

impl QueueError {
    pub fn is_empty(&self) -> bool {
        matches!(self, QueueError::Empty)
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Storage operations the playback service needs. Implementations must make
/// `dequeue` and `dequeue_random` atomic so two workers never claim the same
/// item.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, guild_id: GuildId, item: &QueueItem) -> QueueResult<()>;

    /// Pops the first item in priority/FIFO order.
    async fn dequeue(&self, guild_id: GuildId) -> QueueResult<QueueItem>;

    /// Pops one uniformly random item.
    async fn dequeue_random(&self, guild_id: GuildId) -> QueueResult<QueueItem>;

    async fn peek(&self, guild_id: GuildId) -> QueueResult<QueueItem>;

    /// Items in dequeue order. `limit == 0` lists everything.
    async fn list(&self, guild_id: GuildId, limit: usize) -> QueueResult<Vec<QueueItem>>;

    async fn queue_size(&self, guild_id: GuildId) -> QueueResult<usize>;

    async fn clear(&self, guild_id: GuildId) -> QueueResult<()>;

    /// Settings for the guild, or the defaults if none were ever stored.
    async fn get_settings(&self, guild_id: GuildId) -> QueueResult<QueueSettings>;

    async fn set_settings(&self, guild_id: GuildId, settings: QueueSettings) -> QueueResult<()>;
}

pub fn queue_key(guild_id: GuildId) -> String {
    format!("queue:{guild_id}")
}

pub fn settings_key(guild_id: GuildId) -> String {
    format!("settings:{guild_id}")
}

/// Counter feeding the member sequence prefix.
pub fn sequence_key(guild_id: GuildId) -> String {
    format!("queue_seq:{guild_id}")
}

/// Sort key for an item: lower scores dequeue first.
pub fn queue_score(priority: i32, enqueued_at: DateTime<Utc>) -> u64 {
    let band = (MAX_PRIORITY - priority.clamp(MIN_PRIORITY, MAX_PRIORITY)) as u64;
    let millis = (enqueued_at.timestamp_millis().max(0) as u64).min(TIMESTAMP_MASK);
    (band << TIMESTAMP_BITS) | millis
}

pub fn encode_item(item: &QueueItem) -> QueueResult<String> {
    Ok(serde_json::to_string(item)?)
}

pub fn decode_item(raw: &str) -> QueueResult<QueueItem> {
    Ok(serde_json::from_str(raw)?)
}

pub const MEMBER_SEPARATOR: char = '|';

/// Decodes a sorted-set member. Bare JSON members without a sequence prefix
/// are accepted too.
pub fn decode_member(member: &str) -> QueueResult<QueueItem> {
    let payload = match member.split_once(MEMBER_SEPARATOR) {
        Some((seq, payload)) if !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit()) => {
            payload
        }
        _ => member,
    };
    decode_item(payload)
}

/// Hash fields for the settings record, all stored as strings.
pub fn settings_to_fields(settings: &QueueSettings) -> [(&'static str, String); 3] {
    [
        ("repeat_mode", settings.repeat_mode.as_str().to_string()),
        ("shuffle", settings.shuffle.to_string()),
        ("volume", settings.volume.to_string()),
    ]
}

/// Missing or unparsable fields fall back to their defaults.
pub fn settings_from_fields(fields: &HashMap<String, String>) -> QueueSettings {
    let mut settings = QueueSettings::default();

    if let Some(mode) = fields.get("repeat_mode").and_then(|v| RepeatMode::parse(v)) {
        settings.repeat_mode = mode;
    }
    if let Some(shuffle) = fields.get("shuffle").filter(|v| !v.is_empty()) {
        settings.shuffle = shuffle == "true";
    }
    if let Some(volume) = fields.get("volume").and_then(|v| v.trim().parse().ok()) {
        settings.volume = volume;
    }

    settings
}
