use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serenity::model::id::GuildId;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use super::{queue_score, QueueError, QueueResult, QueueStore};
use crate::model::{QueueItem, QueueSettings};

/// Process-local queue store. Each guild's queue is ordered by
/// `(score, insertion sequence)`; every operation runs under the guild's
/// map shard lock, so pops are atomic.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    queues: DashMap<GuildId, BTreeMap<(u64, u64), QueueItem>>,
    settings: DashMap<GuildId, QueueSettings>,
    sequence: AtomicU64,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, guild_id: GuildId, item: &QueueItem) -> QueueResult<()> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let score = queue_score(item.priority, item.enqueued_at);
        self.queues
            .entry(guild_id)
            .or_default()
            .insert((score, seq), item.clone());
        Ok(())
    }

    async fn dequeue(&self, guild_id: GuildId) -> QueueResult<QueueItem> {
        let mut queue = self.queues.get_mut(&guild_id).ok_or(QueueError::Empty)?;
        queue
            .pop_first()
            .map(|(_, item)| item)
            .ok_or(QueueError::Empty)
    }

    async fn dequeue_random(&self, guild_id: GuildId) -> QueueResult<QueueItem> {
        let mut queue = self.queues.get_mut(&guild_id).ok_or(QueueError::Empty)?;
        if queue.is_empty() {
            return Err(QueueError::Empty);
        }

        let index = rand::thread_rng().gen_range(0..queue.len());
        let key = *queue.keys().nth(index).ok_or(QueueError::Empty)?;
        queue.remove(&key).ok_or(QueueError::Empty)
    }

    async fn peek(&self, guild_id: GuildId) -> QueueResult<QueueItem> {
        let queue = self.queues.get(&guild_id).ok_or(QueueError::Empty)?;
        queue
            .first_key_value()
            .map(|(_, item)| item.clone())
            .ok_or(QueueError::Empty)
    }

    async fn list(&self, guild_id: GuildId, limit: usize) -> QueueResult<Vec<QueueItem>> {
        let Some(queue) = self.queues.get(&guild_id) else {
            return Ok(Vec::new());
        };
        let take = if limit == 0 { usize::MAX } else { limit };
        Ok(queue.values().take(take).cloned().collect())
    }

    async fn queue_size(&self, guild_id: GuildId) -> QueueResult<usize> {
        Ok(self.queues.get(&guild_id).map_or(0, |q| q.len()))
    }

    async fn clear(&self, guild_id: GuildId) -> QueueResult<()> {
        self.queues.remove(&guild_id);
        Ok(())
    }

    async fn get_settings(&self, guild_id: GuildId) -> QueueResult<QueueSettings> {
        Ok(self
            .settings
            .get(&guild_id)
            .map(|s| *s)
            .unwrap_or_default())
    }

    async fn set_settings(&self, guild_id: GuildId, settings: QueueSettings) -> QueueResult<()> {
        self.settings.insert(guild_id, settings);
        Ok(())
    }
}
