//! In-process stand-ins for ffmpeg, yt-dlp and the voice connection.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use super::{
    manager::PlayerManager,
    player::{Player, PlayerConfig},
    transcoder::{TranscodeError, TranscodeRequest, TranscodeStream, Transcoder},
    voice::{VoiceError, VoiceGateway, VoiceSink},
};
use crate::{
    model::{Track, TrackSource},
    queue::MemoryQueueStore,
    service::PlaybackService,
    sources::{ResolveError, TrackResolver},
};

pub const GUILD: GuildId = GuildId::new(100);
pub const USER: UserId = UserId::new(200);
pub const CHANNEL: ChannelId = ChannelId::new(300);

/// One Ogg page with the given flags, lacing values and body.
pub fn ogg_page(header_type: u8, lacing: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(27 + lacing.len() + body.len());
    out.extend_from_slice(b"OggS");
    out.push(0);
    out.push(header_type);
    out.extend_from_slice(&0u64.to_le_bytes()); // granule
    out.extend_from_slice(&1u32.to_le_bytes()); // serial
    out.extend_from_slice(&0u32.to_le_bytes()); // sequence
    out.extend_from_slice(&0u32.to_le_bytes()); // crc
    out.push(lacing.len() as u8);
    out.extend_from_slice(lacing);
    out.extend_from_slice(body);
    out
}

/// Opus header pages followed by `packets` three-byte audio packets.
pub fn opus_stream(packets: usize) -> Vec<u8> {
    let head = b"OpusHead\x01\x02\x38\x01\x80\xbb\x00\x00\x00\x00\x00";
    let tags = b"OpusTags\x04\x00\x00\x00test\x00\x00\x00\x00";
    let mut out = ogg_page(0x02, &[head.len() as u8], head);
    out.extend(ogg_page(0, &[tags.len() as u8], tags));
    for n in 0..packets {
        out.extend(ogg_page(0, &[3], &[b'F', (n >> 8) as u8, n as u8]));
    }
    out
}

#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Bytes>>,
    speaking: AtomicBool,
    disconnected: AtomicBool,
}

impl RecordingSink {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceSink for RecordingSink {
    async fn send_frame(&self, frame: Bytes) -> Result<(), VoiceError> {
        if self.is_disconnected() {
            return Err(VoiceError::Closed);
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::SeqCst);
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Puts every user in `channel` and hands out a fresh sink per join.
pub struct FakeGateway {
    channel: Option<ChannelId>,
    sinks: Mutex<Vec<Arc<RecordingSink>>>,
}

impl FakeGateway {
    pub fn new(channel: Option<ChannelId>) -> Self {
        Self {
            channel,
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn last_sink(&self) -> Option<Arc<RecordingSink>> {
        self.sinks.lock().last().cloned()
    }

    pub fn joins(&self) -> usize {
        self.sinks.lock().len()
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn user_voice_channel(
        &self,
        _guild_id: GuildId,
        _user_id: UserId,
    ) -> Result<Option<ChannelId>, VoiceError> {
        Ok(self.channel)
    }

    async fn join(
        &self,
        _guild_id: GuildId,
        _channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceSink>, VoiceError> {
        let sink = Arc::new(RecordingSink::default());
        self.sinks.lock().push(Arc::clone(&sink));
        Ok(sink)
    }
}

/// Resolves any input to a YouTube-looking track named after it. Stream
/// URLs for inputs starting with `broken` fail.
#[derive(Default)]
pub struct FakeResolver {
    stream_calls: AtomicUsize,
}

impl FakeResolver {
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackResolver for FakeResolver {
    async fn resolve(&self, input: &str, _source_hint: TrackSource) -> Result<Track, ResolveError> {
        Ok(Track {
            id: input.to_string(),
            title: input.to_string(),
            url: format!("https://www.youtube.com/watch?v={input}"),
            source: TrackSource::YouTube,
            duration: Duration::from_secs(1),
            ..Track::default()
        })
    }

    async fn resolve_search(
        &self,
        input: &str,
        source_hint: TrackSource,
        _limit: usize,
    ) -> Result<Vec<Track>, ResolveError> {
        Ok(vec![self.resolve(input, source_hint).await?])
    }

    async fn resolve_stream_url(
        &self,
        input: &str,
        _source_hint: TrackSource,
    ) -> Result<String, ResolveError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if input.contains("v=broken") {
            return Err(ResolveError::EmptyStreamUrl);
        }
        Ok(format!("https://cdn.test/{input}"))
    }
}

/// Serves the same in-memory Ogg stream for every request.
pub struct FakeTranscoder {
    stream: Vec<u8>,
    requests: Mutex<Vec<TranscodeRequest>>,
}

impl FakeTranscoder {
    pub fn new(packets: usize) -> Self {
        Self {
            stream: opus_stream(packets),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<TranscodeRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn spawn(&self, request: &TranscodeRequest) -> Result<TranscodeStream, TranscodeError> {
        self.requests.lock().push(request.clone());
        Ok(TranscodeStream::from_reader(Cursor::new(self.stream.clone())))
    }
}

pub struct Harness {
    pub service: Arc<PlaybackService>,
    pub gateway: Arc<FakeGateway>,
    pub resolver: Arc<FakeResolver>,
    pub transcoder: Arc<FakeTranscoder>,
}

impl Harness {
    /// Every track streams `packets` frames.
    pub fn new(packets: usize) -> Self {
        Self::with_gateway(packets, FakeGateway::new(Some(CHANNEL)))
    }

    pub fn with_gateway(packets: usize, gateway: FakeGateway) -> Self {
        let resolver = Arc::new(FakeResolver::default());
        let service = PlaybackService::new()
            .with_queue(Arc::new(MemoryQueueStore::new()))
            .with_resolver(Arc::clone(&resolver) as Arc<dyn TrackResolver>);
        Self {
            service: Arc::new(service),
            gateway: Arc::new(gateway),
            resolver,
            transcoder: Arc::new(FakeTranscoder::new(packets)),
        }
    }

    pub fn player(&self) -> Arc<Player> {
        Player::new(
            GUILD,
            Arc::clone(&self.service),
            Arc::clone(&self.gateway) as Arc<dyn VoiceGateway>,
            Arc::clone(&self.transcoder) as Arc<dyn Transcoder>,
            PlayerConfig::default(),
        )
    }

    pub fn manager(&self) -> PlayerManager {
        PlayerManager::new(
            Arc::clone(&self.service),
            Arc::clone(&self.gateway) as Arc<dyn VoiceGateway>,
            Arc::clone(&self.transcoder) as Arc<dyn Transcoder>,
            PlayerConfig::default(),
        )
    }

    pub fn frames(&self) -> usize {
        self.gateway.last_sink().map_or(0, |sink| sink.frame_count())
    }
}

/// Polls `condition` on the (usually paused) clock, panicking after a
/// minute of simulated time.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..6_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
