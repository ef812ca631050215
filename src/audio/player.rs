use chrono::Utc;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::AsyncRead,
    sync::watch,
    task::JoinHandle,
    time::{interval, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ogg::OggPacketReader,
    position_for,
    signal::ControlSignal,
    transcoder::{TranscodeError, TranscodeRequest, Transcoder},
    voice::{VoiceError, VoiceGateway, VoiceSink},
    FRAME_DURATION, MAX_VOLUME,
};
use crate::{
    model::{PlaybackState, QueueItem, QueueSettings, RepeatMode, TrackSource},
    service::{PlaybackService, ServiceError},
};

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("audio stream failed: {0}")]
    Stream(#[from] std::io::Error),
}

/// How one streaming attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Finished,
    Skipped,
    Stopped,
    Restarted,
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Longest a single frame may wait on the voice connection before it
    /// is dropped.
    pub send_timeout: Duration,
    /// Back-off after a failed dequeue.
    pub retry_delay: Duration,
    /// How long `stop` waits for the worker before aborting it.
    pub stop_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

struct WorkerHandle {
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct PlayerState {
    sink: Option<Arc<dyn VoiceSink>>,
    playback: PlaybackState,
    paused: bool,
    frames_sent: u64,
    worker: Option<WorkerHandle>,
    play_token: Option<CancellationToken>,
    last_active: Instant,
}

impl PlayerState {
    fn reset_playback(&mut self) {
        self.playback = PlaybackState {
            volume: self.playback.volume,
            ..PlaybackState::default()
        };
        self.paused = false;
        self.frames_sent = 0;
        self.play_token = None;
        self.last_active = Instant::now();
    }
}

/// Playback engine for one guild.
///
/// A single background worker drains the guild's queue. Public operations
/// only flip state or raise signals; none of them wait for the audio
/// pipeline, except [`Player::stop`] which waits (bounded) for the worker
/// to exit.
pub struct Player {
    guild_id: GuildId,
    service: Arc<PlaybackService>,
    gateway: Arc<dyn VoiceGateway>,
    transcoder: Arc<dyn Transcoder>,
    config: PlayerConfig,
    state: Mutex<PlayerState>,
    wake: ControlSignal,
    skip: ControlSignal,
    restart: ControlSignal,
    paused_tx: watch::Sender<bool>,
    generation: AtomicU64,
}

impl Player {
    pub fn new(
        guild_id: GuildId,
        service: Arc<PlaybackService>,
        gateway: Arc<dyn VoiceGateway>,
        transcoder: Arc<dyn Transcoder>,
        config: PlayerConfig,
    ) -> Arc<Self> {
        let (paused_tx, _) = watch::channel(false);
        Arc::new(Self {
            guild_id,
            service,
            gateway,
            transcoder,
            config,
            state: Mutex::new(PlayerState {
                sink: None,
                playback: PlaybackState::default(),
                paused: false,
                frames_sent: 0,
                worker: None,
                play_token: None,
                last_active: Instant::now(),
            }),
            wake: ControlSignal::new(),
            skip: ControlSignal::new(),
            restart: ControlSignal::new(),
            paused_tx,
            generation: AtomicU64::new(0),
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn has_voice_connection(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn state(&self) -> PlaybackState {
        self.state.lock().playback.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_worker_running(&self) -> bool {
        self.state
            .lock()
            .worker
            .as_ref()
            .is_some_and(|w| !w.task.is_finished())
    }

    /// How long the player has had no active track, or `None` while one is
    /// playing.
    pub fn idle_for(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .playback
            .track
            .is_none()
            .then(|| state.last_active.elapsed())
    }

    /// Connects to `channel_id`, replacing any previous connection.
    pub async fn join_voice(&self, channel_id: ChannelId) -> Result<(), PlayerError> {
        let sink = self.gateway.join(self.guild_id, channel_id).await?;
        let previous = self.state.lock().sink.replace(Arc::clone(&sink));

        if let Some(previous) = previous.filter(|old| !Arc::ptr_eq(old, &sink)) {
            previous.disconnect().await;
        }
        info!(guild_id = %self.guild_id, %channel_id, "🔊 joined voice channel");
        Ok(())
    }

    async fn ensure_voice_connection(&self, requester: UserId) -> Result<(), PlayerError> {
        if self.has_voice_connection() {
            return Ok(());
        }
        let channel_id = self
            .gateway
            .user_voice_channel(self.guild_id, requester)
            .await?
            .ok_or(VoiceError::NoVoiceChannel)?;
        self.join_voice(channel_id).await
    }

    /// Resolves and queues `input`, joins the requester's channel if needed
    /// and makes sure the worker is running.
    pub async fn enqueue_and_play(
        self: &Arc<Self>,
        requester: UserId,
        input: &str,
        source_hint: TrackSource,
        priority: i32,
    ) -> Result<QueueItem, PlayerError> {
        let item = self
            .service
            .resolve_and_enqueue(
                self.guild_id,
                input,
                source_hint,
                &requester.to_string(),
                priority,
            )
            .await?;

        self.ensure_voice_connection(requester).await?;
        self.ensure_worker();
        self.wake.raise();
        Ok(item)
    }

    /// Starts the worker unless one is already running.
    pub fn ensure_worker(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.worker.as_ref().is_some_and(|w| !w.task.is_finished()) {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).run_worker(generation, token.clone()));
        state.worker = Some(WorkerHandle {
            generation,
            token,
            task,
        });
        state.last_active = Instant::now();
    }

    /// Ends the current item early. Returns false when nothing is playing.
    pub fn skip(&self) -> bool {
        if self.state.lock().playback.track.is_none() {
            return false;
        }
        self.skip.raise();
        true
    }

    /// Rebuilds the audio pipeline at the current position.
    pub fn restart(&self) -> bool {
        if self.state.lock().playback.track.is_none() {
            return false;
        }
        self.restart.raise();
        true
    }

    /// Flips pause and returns the new paused flag.
    ///
    /// Pause belongs to the current item: every item starts unpaused, so a
    /// pause toggled while idle does not carry into the next track.
    pub fn toggle_pause(&self) -> bool {
        let mut state = self.state.lock();
        state.paused = !state.paused;
        state.playback.paused_at = state.paused.then(Utc::now);
        self.paused_tx.send_replace(state.paused);

        info!(guild_id = %self.guild_id, paused = state.paused, "⏯️ pause toggled");
        state.paused
    }

    /// Stores the clamped volume and applies it to the current track.
    pub async fn set_volume(&self, volume: i32) -> Result<i32, PlayerError> {
        let volume = volume.clamp(0, MAX_VOLUME);
        let settings = self.service.get_settings(self.guild_id).await?;
        self.service
            .set_settings(self.guild_id, QueueSettings { volume, ..settings })
            .await?;

        let playing = {
            let mut state = self.state.lock();
            state.playback.volume = volume;
            state.playback.track.is_some()
        };
        if playing {
            self.restart.raise();
        }

        info!(guild_id = %self.guild_id, volume, "🔊 volume set");
        Ok(volume)
    }

    /// Stops the worker, leaves voice and optionally clears the queue. Safe
    /// to call on an idle player.
    pub async fn stop(&self, clear_queue: bool) -> Result<(), PlayerError> {
        let (worker, sink, play_token) = {
            let mut state = self.state.lock();
            let play_token = state.play_token.take();
            state.reset_playback();
            (state.worker.take(), state.sink.take(), play_token)
        };
        self.paused_tx.send_replace(false);

        if let Some(token) = play_token {
            token.cancel();
        }
        if let Some(worker) = worker {
            worker.token.cancel();
            let mut task = worker.task;
            if timeout(self.config.stop_timeout, &mut task).await.is_err() {
                warn!(guild_id = %self.guild_id, "worker did not stop in time, aborting");
                task.abort();
            }
        }

        if let Some(sink) = sink {
            sink.set_speaking(false).await;
            sink.disconnect().await;
        }
        self.skip.clear();
        self.restart.clear();

        if clear_queue {
            self.service.clear(self.guild_id).await?;
        }
        info!(guild_id = %self.guild_id, clear_queue, "⏹️ player stopped");
        Ok(())
    }

    async fn run_worker(self: Arc<Self>, generation: u64, token: CancellationToken) {
        info!(guild_id = %self.guild_id, generation, "worker started");

        while !token.is_cancelled() {
            // not raced against cancellation: an in-flight pop must not be lost
            let next = self.service.dequeue_next(self.guild_id).await;

            match next {
                Ok(item) if token.is_cancelled() => {
                    if let Err(err) = self.service.restore(self.guild_id, &item).await {
                        error!(guild_id = %self.guild_id, error = %err, "failed to return item to queue");
                    }
                    break;
                }
                Ok(item) => {
                    if self.play_queue_item(item, &token).await.is_break() {
                        break;
                    }
                }
                Err(err) if err.is_queue_empty() => {
                    debug!(guild_id = %self.guild_id, "queue empty, waiting");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.wake.wait() => {}
                    }
                }
                Err(err) => {
                    warn!(guild_id = %self.guild_id, error = %err, "failed to fetch next item");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.wake.wait() => {}
                        _ = sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }

        let mut state = self.state.lock();
        if state.worker.as_ref().is_some_and(|w| w.generation == generation) {
            state.worker = None;
        }
        info!(guild_id = %self.guild_id, generation, "worker stopped");
    }

    /// Plays one dequeued item, including track repeats and the queue-mode
    /// requeue. Breaks when the worker should exit.
    async fn play_queue_item(&self, item: QueueItem, token: &CancellationToken) -> ControlFlow<()> {
        loop {
            let sink = self.state.lock().sink.clone();
            let result = match &sink {
                Some(sink) => self.play_item(&item, sink, token).await,
                None => Err(VoiceError::NotConnected.into()),
            };

            match result {
                Ok(StreamOutcome::Stopped) => return ControlFlow::Break(()),
                // skipped items never go back to the queue
                Ok(StreamOutcome::Skipped) => return ControlFlow::Continue(()),
                Ok(_) => {}
                Err(PlayerError::Voice(err @ (VoiceError::NotConnected | VoiceError::Closed))) => {
                    if self.drop_failed_sink(sink.as_ref()).await {
                        info!(guild_id = %self.guild_id, title = %item.track.title, "voice connection replaced, replaying item");
                        continue;
                    }
                    warn!(guild_id = %self.guild_id, error = %err, "voice connection lost, parking worker");
                    if let Err(err) = self.service.restore(self.guild_id, &item).await {
                        error!(guild_id = %self.guild_id, error = %err, "failed to return item to queue");
                    }
                    return ControlFlow::Break(());
                }
                Err(err) => {
                    error!(guild_id = %self.guild_id, title = %item.track.title, error = %err, "playback failed");
                    return ControlFlow::Continue(());
                }
            }

            if token.is_cancelled() {
                return ControlFlow::Break(());
            }
            if self.settings().await.repeat_mode != RepeatMode::Track {
                break;
            }
            debug!(guild_id = %self.guild_id, title = %item.track.title, "🔁 repeating track");
        }

        if token.is_cancelled() {
            return ControlFlow::Break(());
        }
        if self.settings().await.repeat_mode == RepeatMode::Queue {
            match self.service.requeue(self.guild_id, &item).await {
                Ok(_) => debug!(guild_id = %self.guild_id, title = %item.track.title, "requeued"),
                Err(err) => warn!(guild_id = %self.guild_id, error = %err, "failed to requeue"),
            }
        }
        ControlFlow::Continue(())
    }

    /// Forgets `failed` if it is still the installed sink. Returns true when
    /// a different connection has been installed since, so the item can be
    /// replayed on it.
    async fn drop_failed_sink(&self, failed: Option<&Arc<dyn VoiceSink>>) -> bool {
        let dropped = {
            let mut state = self.state.lock();
            let Some(current) = state.sink.as_ref() else {
                return false;
            };
            if !failed.is_some_and(|failed| Arc::ptr_eq(current, failed)) {
                return true;
            }
            state.sink.take()
        };
        if let Some(sink) = dropped {
            sink.disconnect().await;
        }
        false
    }

    async fn settings(&self) -> QueueSettings {
        match self.service.get_settings(self.guild_id).await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(guild_id = %self.guild_id, error = %err, "failed to read settings, using defaults");
                QueueSettings::default()
            }
        }
    }

    async fn play_item(
        &self,
        item: &QueueItem,
        sink: &Arc<dyn VoiceSink>,
        token: &CancellationToken,
    ) -> Result<StreamOutcome, PlayerError> {
        let volume = self.settings().await.volume;
        {
            let mut state = self.state.lock();
            state.reset_playback();
            state.playback.track = Some(item.track.clone());
            state.playback.started_at = Some(Utc::now());
            state.playback.volume = volume;
            state.playback.is_playing = true;
        }
        self.paused_tx.send_replace(false);

        info!(guild_id = %self.guild_id, title = %item.track.title, "▶️ now playing");
        let outcome = self.play_resolved(item, sink, token).await;

        {
            let mut state = self.state.lock();
            let frames = state.frames_sent;
            state.reset_playback();
            debug!(guild_id = %self.guild_id, frames, ?outcome, "item finished");
        }
        self.paused_tx.send_replace(false);
        self.skip.clear();
        self.restart.clear();
        outcome
    }

    async fn play_resolved(
        &self,
        item: &QueueItem,
        sink: &Arc<dyn VoiceSink>,
        token: &CancellationToken,
    ) -> Result<StreamOutcome, PlayerError> {
        // fresh every attempt: media URLs expire
        let stream_url = tokio::select! {
            _ = token.cancelled() => return Ok(StreamOutcome::Stopped),
            _ = self.skip.wait() => return Ok(StreamOutcome::Skipped),
            url = self.service.resolve_stream_url(&item.track) => url?,
        };

        let play_token = token.child_token();
        self.state.lock().play_token = Some(play_token.clone());

        let mut start_at = Duration::ZERO;
        loop {
            let outcome = self.stream_audio(&stream_url, start_at, sink, &play_token).await?;
            if outcome != StreamOutcome::Restarted {
                return Ok(outcome);
            }
            start_at = self.state().position;
            info!(guild_id = %self.guild_id, position = ?start_at, "🔄 restarting stream");
        }
    }

    async fn stream_audio(
        &self,
        url: &str,
        start_at: Duration,
        sink: &Arc<dyn VoiceSink>,
        token: &CancellationToken,
    ) -> Result<StreamOutcome, PlayerError> {
        let volume = self.state.lock().playback.volume;
        let request = TranscodeRequest {
            url: url.to_string(),
            volume,
            start_at,
        };
        let mut stream = self.transcoder.spawn(&request).await?;

        sink.set_speaking(true).await;
        let outcome = self.pump(stream.reader(), sink, token).await;
        sink.set_speaking(false).await;
        stream.shutdown().await;
        outcome
    }

    /// Reads packets and sends one per frame tick until the stream ends or
    /// a signal interrupts it.
    async fn pump(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        sink: &Arc<dyn VoiceSink>,
        token: &CancellationToken,
    ) -> Result<StreamOutcome, PlayerError> {
        let mut packets = OggPacketReader::new(reader);
        let mut ticker = interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut paused_rx = self.paused_tx.subscribe();

        loop {
            let packet = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(StreamOutcome::Stopped),
                _ = self.skip.wait() => return Ok(StreamOutcome::Skipped),
                _ = self.restart.wait() => return Ok(StreamOutcome::Restarted),
                packet = packets.next_packet() => packet?,
            };
            let Some(packet) = packet else {
                return Ok(StreamOutcome::Finished);
            };

            let paused = *paused_rx.borrow_and_update();
            if paused {
                sink.set_speaking(false).await;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(StreamOutcome::Stopped),
                    _ = self.skip.wait() => return Ok(StreamOutcome::Skipped),
                    _ = self.restart.wait() => return Ok(StreamOutcome::Restarted),
                    resumed = async { paused_rx.wait_for(|paused| !*paused).await.is_ok() } => {
                        if !resumed {
                            return Ok(StreamOutcome::Stopped);
                        }
                    }
                }
                sink.set_speaking(true).await;
                ticker.reset();
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(StreamOutcome::Stopped),
                _ = self.skip.wait() => return Ok(StreamOutcome::Skipped),
                _ = self.restart.wait() => return Ok(StreamOutcome::Restarted),
                _ = ticker.tick() => {}
            }

            let sent = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(StreamOutcome::Stopped),
                sent = timeout(self.config.send_timeout, sink.send_frame(packet)) => sent,
            };
            match sent {
                Ok(Ok(())) => self.record_frame(),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => warn!(guild_id = %self.guild_id, "frame send timed out, dropping frame"),
            }
        }
    }

    fn record_frame(&self) {
        let mut state = self.state.lock();
        state.frames_sent += 1;
        state.playback.position = position_for(state.frames_sent);
    }
}
