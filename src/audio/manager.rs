use dashmap::DashMap;
use futures::future::join_all;
use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    player::{Player, PlayerConfig, PlayerError},
    transcoder::{FfmpegTranscoder, Transcoder},
    voice::VoiceGateway,
};
use crate::{config::Config, service::PlaybackService};

/// Registry holding at most one [`Player`] per guild.
pub struct PlayerManager {
    players: DashMap<GuildId, Arc<Player>>,
    service: Arc<PlaybackService>,
    gateway: Arc<dyn VoiceGateway>,
    transcoder: Arc<dyn Transcoder>,
    config: PlayerConfig,
}

impl PlayerManager {
    pub fn new(
        service: Arc<PlaybackService>,
        gateway: Arc<dyn VoiceGateway>,
        transcoder: Arc<dyn Transcoder>,
        config: PlayerConfig,
    ) -> Self {
        Self {
            players: DashMap::new(),
            service,
            gateway,
            transcoder,
            config,
        }
    }

    /// ffmpeg transcoder and player timings taken from `config`.
    pub fn from_config(
        service: Arc<PlaybackService>,
        gateway: Arc<dyn VoiceGateway>,
        config: &Config,
    ) -> Self {
        let transcoder = FfmpegTranscoder::new()
            .with_binary(&config.ffmpeg_binary)
            .with_bitrate(config.opus_bitrate);
        Self::new(service, gateway, Arc::new(transcoder), config.player_config())
    }

    /// The guild's player, created on first use. Concurrent callers for the
    /// same guild always get the same instance.
    pub fn get(&self, guild_id: GuildId) -> Arc<Player> {
        self.players
            .entry(guild_id)
            .or_insert_with(|| {
                debug!(%guild_id, "creating player");
                Player::new(
                    guild_id,
                    Arc::clone(&self.service),
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.transcoder),
                    self.config.clone(),
                )
            })
            .clone()
    }

    /// The guild's player if one exists; never creates.
    pub fn existing(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|p| Arc::clone(p.value()))
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Everyone left the bot's voice channel: stop and clear the queue.
    pub async fn handle_voice_channel_empty(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        let Some(player) = self.existing(guild_id) else {
            return Ok(());
        };
        info!(%guild_id, "👋 voice channel empty, leaving");
        player.stop(true).await
    }

    /// Stops and forgets players idle for at least `max_idle`. Returns how
    /// many were removed.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<(GuildId, Arc<Player>)> = self
            .players
            .iter()
            .filter(|entry| entry.value().idle_for().is_some_and(|idle| idle >= max_idle))
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut removed = 0;
        for (guild_id, player) in idle {
            if self.reap_if_idle(guild_id, &player, max_idle).await {
                removed += 1;
            }
        }
        removed
    }

    /// Stops and removes `player` if it is still idle. The snapshot that
    /// picked it may be stale by now.
    async fn reap_if_idle(&self, guild_id: GuildId, player: &Arc<Player>, max_idle: Duration) -> bool {
        if !player.idle_for().is_some_and(|idle| idle >= max_idle) {
            debug!(%guild_id, "player became active, not reaping");
            return false;
        }
        if let Err(err) = player.stop(false).await {
            warn!(%guild_id, error = %err, "failed to stop idle player");
        }
        let gone = self
            .players
            .remove_if(&guild_id, |_, current| {
                Arc::ptr_eq(current, player) && current.idle_for().is_some()
            })
            .is_some();
        if gone {
            info!(%guild_id, "💤 idle player removed");
        }
        gone
    }

    /// Periodically reaps idle players until `shutdown` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        every: Duration,
        max_idle: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.reap_idle(max_idle).await;
                    }
                }
            }
            debug!("idle reaper stopped");
        })
    }

    /// Reaper for the configured auto-leave timeout, checked ten times per
    /// timeout period.
    pub fn spawn_auto_leave(self: &Arc<Self>, config: &Config, shutdown: CancellationToken) -> JoinHandle<()> {
        let every = (config.auto_leave_timeout / 10).max(Duration::from_secs(1));
        self.spawn_reaper(every, config.auto_leave_timeout, shutdown)
    }

    /// Stops every player without touching the queues.
    pub async fn shutdown(&self) {
        let players: Vec<Arc<Player>> = self.players.iter().map(|p| Arc::clone(p.value())).collect();
        let results = join_all(players.iter().map(|player| player.stop(false))).await;
        for (player, result) in players.iter().zip(results) {
            if let Err(err) = result {
                warn!(guild_id = %player.guild_id(), error = %err, "failed to stop player");
            }
        }
        self.players.clear();
        info!("🛑 all players stopped");
    }
}
