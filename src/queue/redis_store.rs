use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use serenity::model::id::GuildId;
use std::{collections::HashMap, sync::LazyLock};
use tracing::{debug, info};

use super::{
    decode_member, encode_item, queue_key, queue_score, sequence_key, settings_from_fields,
    settings_key, settings_to_fields, QueueError, QueueResult, QueueStore,
};
use crate::model::{QueueItem, QueueSettings};

/// Adds `<seq>|<payload>` with a fresh per-guild sequence number.
static PUSH: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local seq = redis.call('INCR', KEYS[2])
        redis.call('ZADD', KEYS[1], ARGV[1], string.format('%016d', seq) .. '|' .. ARGV[2])
        return seq
        ",
    )
});

/// Picks and removes one member in a single server-side step, seeded by the
/// caller so the choice does not depend on the server's script RNG state.
static RANDOM_POP: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local key = KEYS[1]
        local len = redis.call('ZCARD', key)
        if len == 0 then
            return nil
        end
        math.randomseed(tonumber(ARGV[1]))
        local idx = math.random(0, len - 1)
        local member = redis.call('ZRANGE', key, idx, idx)[1]
        if member then
            redis.call('ZREM', key, member)
        end
        return member
        ",
    )
});

/// Queue store backed by a Redis sorted set per guild (`queue:<id>`) and a
/// hash per guild (`settings:<id>`).
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
}

impl RedisQueueStore {
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("📦 Queue store connected to redis");
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn decode_first(members: Vec<String>) -> QueueResult<QueueItem> {
        let raw = members.into_iter().next().ok_or(QueueError::Empty)?;
        decode_member(&raw)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, guild_id: GuildId, item: &QueueItem) -> QueueResult<()> {
        let payload = encode_item(item)?;
        let score = queue_score(item.priority, item.enqueued_at);

        let mut conn = self.conn.clone();
        let seq: u64 = PUSH
            .key(queue_key(guild_id))
            .key(sequence_key(guild_id))
            .arg(score)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;

        debug!(%guild_id, title = %item.track.title, score, seq, "enqueued");
        Ok(())
    }

    async fn dequeue(&self, guild_id: GuildId) -> QueueResult<QueueItem> {
        let mut conn = self.conn.clone();
        // ZPOPMIN replies with [member, score]
        let popped: Vec<String> = redis::cmd("ZPOPMIN")
            .arg(queue_key(guild_id))
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Self::decode_first(popped)
    }

    async fn dequeue_random(&self, guild_id: GuildId) -> QueueResult<QueueItem> {
        let seed: u32 = rand::random();

        let mut conn = self.conn.clone();
        let popped: Option<String> = RANDOM_POP
            .key(queue_key(guild_id))
            .arg(seed)
            .invoke_async(&mut conn)
            .await?;

        match popped {
            Some(raw) => decode_member(&raw),
            None => Err(QueueError::Empty),
        }
    }

    async fn peek(&self, guild_id: GuildId) -> QueueResult<QueueItem> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(queue_key(guild_id))
            .arg(0)
            .arg(0)
            .query_async(&mut conn)
            .await?;

        Self::decode_first(members)
    }

    async fn list(&self, guild_id: GuildId, limit: usize) -> QueueResult<Vec<QueueItem>> {
        let stop: i64 = if limit > 0 { limit as i64 - 1 } else { -1 };

        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(queue_key(guild_id))
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await?;

        members.iter().map(|raw| decode_member(raw)).collect()
    }

    async fn queue_size(&self, guild_id: GuildId) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let size: usize = redis::cmd("ZCARD")
            .arg(queue_key(guild_id))
            .query_async(&mut conn)
            .await?;
        Ok(size)
    }

    async fn clear(&self, guild_id: GuildId) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(queue_key(guild_id))
            .arg(sequence_key(guild_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_settings(&self, guild_id: GuildId) -> QueueResult<QueueSettings> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(settings_key(guild_id))
            .query_async(&mut conn)
            .await?;

        Ok(settings_from_fields(&fields))
    }

    async fn set_settings(&self, guild_id: GuildId, settings: QueueSettings) -> QueueResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(settings_key(guild_id));
        for (field, value) in settings_to_fields(&settings) {
            cmd.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Run against a real server when `REDIS_URL` is set; skipped otherwise.

    use super::*;
    use crate::model::{RepeatMode, Track};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    async fn store() -> Option<RedisQueueStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        match RedisQueueStore::connect(&url).await {
            Ok(store) => Some(store),
            Err(err) => {
                eprintln!("skipping redis test, cannot connect: {err}");
                None
            }
        }
    }

    fn scratch_guild() -> GuildId {
        GuildId::new(rand::random::<u64>() >> 1 | 1)
    }

    fn item(title: &str, priority: i32, millis: i64) -> QueueItem {
        QueueItem {
            track: Track {
                id: title.to_string(),
                title: title.to_string(),
                url: format!("https://youtu.be/{title}"),
                ..Track::default()
            },
            priority,
            enqueued_at: Utc.timestamp_millis_opt(millis).unwrap(),
        }
    }

    #[tokio::test]
    async fn same_millisecond_items_stay_fifo() {
        let Some(store) = store().await else { return };
        let guild = scratch_guild();

        for title in ["zulu", "alpha", "mike"] {
            store.enqueue(guild, &item(title, 0, 1_760_000_000_000)).await.unwrap();
        }
        store.enqueue(guild, &item("urgent", 5, 1_760_000_000_001)).await.unwrap();

        let order: Vec<String> = store
            .list(guild, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.track.title)
            .collect();
        assert_eq!(order, vec!["urgent", "zulu", "alpha", "mike"]);

        assert_eq!(store.dequeue(guild).await.unwrap().track.title, "urgent");
        assert_eq!(store.peek(guild).await.unwrap().track.title, "zulu");
        store.clear(guild).await.unwrap();
        assert!(store.dequeue(guild).await.unwrap_err().is_empty());
    }

    #[tokio::test]
    async fn identical_requests_are_kept_apart() {
        let Some(store) = store().await else { return };
        let guild = scratch_guild();
        let twice = item("same", 0, 1_760_000_000_000);

        store.enqueue(guild, &twice).await.unwrap();
        store.enqueue(guild, &twice).await.unwrap();

        assert_eq!(store.queue_size(guild).await.unwrap(), 2);
        assert_eq!(store.dequeue(guild).await.unwrap(), twice);
        assert_eq!(store.dequeue(guild).await.unwrap(), twice);
        store.clear(guild).await.unwrap();
    }

    #[tokio::test]
    async fn random_pop_drains_every_item_once() {
        let Some(store) = store().await else { return };
        let guild = scratch_guild();
        for n in 0..6 {
            store.enqueue(guild, &item(&format!("t{n}"), 0, 1_000 + n)).await.unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..6 {
            let popped = store.dequeue_random(guild).await.unwrap();
            assert!(seen.insert(popped.track.title));
        }
        assert_eq!(seen.len(), 6);
        assert!(store.dequeue_random(guild).await.unwrap_err().is_empty());
        store.clear(guild).await.unwrap();
    }

    #[tokio::test]
    async fn settings_default_then_overwrite() {
        let Some(store) = store().await else { return };
        let guild = scratch_guild();
        assert_eq!(store.get_settings(guild).await.unwrap(), QueueSettings::default());

        let settings = QueueSettings {
            repeat_mode: RepeatMode::Track,
            shuffle: true,
            volume: 42,
        };
        store.set_settings(guild, settings).await.unwrap();
        assert_eq!(store.get_settings(guild).await.unwrap(), settings);

        let mut conn = store.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(settings_key(guild))
            .query_async(&mut conn)
            .await
            .unwrap();
    }
}
