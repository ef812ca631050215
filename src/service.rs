//! # Playback Service
//!
//! Ties the queue store, the track resolver and the catalog client together.
//! Every collaborator is optional; calling an operation that needs a missing
//! one returns [`ServiceError::NotConfigured`] instead of panicking, so a
//! partially configured deployment (no Spotify credentials, for example)
//! still serves everything else.

use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    cache::{SearchCache, DEFAULT_SEARCH_CACHE_TTL},
    config::Config,
    model::{QueueItem, QueueSettings, Track, TrackSource},
    queue::{QueueError, QueueStore, RedisQueueStore},
    sources::{
        is_catalog_input, is_catalog_link, CatalogError, CatalogProvider, ResolveError,
        SpotifyClient, TrackResolver, YtDlpResolver,
    },
};

pub const DEFAULT_SEARCH_LIMIT: usize = 4;
pub const MAX_SEARCH_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("input is required")]
    MissingInput,

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("queue is full ({limit} tracks)")]
    QueueFull { limit: usize },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl ServiceError {
    pub fn is_queue_empty(&self) -> bool {
        matches!(self, ServiceError::Queue(err) if err.is_empty())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ServiceError::NotConfigured(_))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

const QUEUE_STORE: &str = "queue store";
const RESOLVER: &str = "track resolver";
const CATALOG: &str = "catalog client";

pub struct PlaybackService {
    queue: Option<Arc<dyn QueueStore>>,
    resolver: Option<Arc<dyn TrackResolver>>,
    catalog: Option<Arc<dyn CatalogProvider>>,
    search_cache: SearchCache,
    max_queue_size: usize,
}

impl Default for PlaybackService {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackService {
    /// A service with nothing configured. Use the `with_*` builders.
    pub fn new() -> Self {
        Self {
            queue: None,
            resolver: None,
            catalog: None,
            search_cache: SearchCache::new(DEFAULT_SEARCH_CACHE_TTL),
            max_queue_size: 0,
        }
    }

    /// Redis queue, yt-dlp resolver, and the Spotify client when both
    /// credentials are present.
    pub async fn from_config(config: &Config) -> ServiceResult<Self> {
        let queue = RedisQueueStore::connect(&config.redis_url).await?;

        let mut resolver = YtDlpResolver::new()
            .with_binary(&config.ytdlp_binary)
            .with_timeout(config.resolve_timeout);
        if let Some(dir) = &config.ytdlp_tmp_dir {
            resolver = resolver.with_tmp_dir(dir);
        }

        let mut service = Self::new()
            .with_queue(Arc::new(queue))
            .with_resolver(Arc::new(resolver))
            .with_search_cache_ttl(config.search_cache_ttl)
            .with_max_queue_size(config.max_queue_size);

        if let Some((id, secret)) = config.spotify_credentials() {
            service = service.with_catalog(Arc::new(SpotifyClient::new(id, secret)));
        }

        info!("🎛️ Playback service ready ({})", service.describe());
        Ok(service)
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueStore>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TrackResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogProvider>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_search_cache_ttl(mut self, ttl: Duration) -> Self {
        self.search_cache = SearchCache::new(ttl);
        self
    }

    /// `0` disables the limit.
    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = max;
        self
    }

    fn queue(&self) -> ServiceResult<&dyn QueueStore> {
        self.queue.as_deref().ok_or(ServiceError::NotConfigured(QUEUE_STORE))
    }

    fn resolver(&self) -> ServiceResult<&dyn TrackResolver> {
        self.resolver.as_deref().ok_or(ServiceError::NotConfigured(RESOLVER))
    }

    fn catalog(&self) -> ServiceResult<&dyn CatalogProvider> {
        self.catalog.as_deref().ok_or(ServiceError::NotConfigured(CATALOG))
    }

    /// Resolves user input into a playable track stamped with the requester.
    ///
    /// Catalog input is looked up in the catalog first, then the
    /// `"title - artists"` string is resolved to something playable. The
    /// catalog title and artwork win over the playable match's.
    pub async fn resolve_input(
        &self,
        input: &str,
        source_hint: TrackSource,
        requested_by: &str,
    ) -> ServiceResult<Track> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ServiceError::MissingInput);
        }
        let resolver = self.resolver()?;

        if is_catalog_input(input, source_hint) {
            let catalog_track = self.catalog()?.resolve_track(input).await?;
            return self.bridge_catalog_track(catalog_track, requested_by).await;
        }

        let mut track = resolver.resolve(input, source_hint).await?;
        track.requested_by = requested_by.to_string();
        Ok(track)
    }

    /// Free-text catalog search, bridged to a playable track.
    pub async fn resolve_catalog_search(&self, query: &str, requested_by: &str) -> ServiceResult<Track> {
        let catalog = self.catalog()?;
        self.resolver()?;

        let catalog_track = catalog.search_track(query).await?;
        self.bridge_catalog_track(catalog_track, requested_by).await
    }

    async fn bridge_catalog_track(&self, catalog_track: Track, requested_by: &str) -> ServiceResult<Track> {
        let mut playable = self
            .resolver()?
            .resolve(&catalog_track.title, TrackSource::YouTube)
            .await?;

        debug!(catalog = %catalog_track.title, playable = %playable.url, "bridged catalog track");
        playable.title = catalog_track.title;
        if !catalog_track.thumbnail.is_empty() {
            playable.thumbnail = catalog_track.thumbnail;
        }
        playable.requested_by = requested_by.to_string();
        Ok(playable)
    }

    pub async fn resolve_and_enqueue(
        &self,
        guild_id: GuildId,
        input: &str,
        source_hint: TrackSource,
        requested_by: &str,
        priority: i32,
    ) -> ServiceResult<QueueItem> {
        let queue = self.queue()?;
        if self.max_queue_size > 0 && queue.queue_size(guild_id).await? >= self.max_queue_size {
            return Err(ServiceError::QueueFull {
                limit: self.max_queue_size,
            });
        }

        let track = self.resolve_input(input, source_hint, requested_by).await?;
        let item = QueueItem::new(track, priority);
        queue.enqueue(guild_id, &item).await?;

        info!(%guild_id, title = %item.track.title, priority, "➕ enqueued");
        Ok(item)
    }

    /// Appends a freshly stamped copy of a played item.
    pub async fn requeue(&self, guild_id: GuildId, item: &QueueItem) -> ServiceResult<QueueItem> {
        let copy = item.fresh_copy();
        self.queue()?.enqueue(guild_id, &copy).await?;
        Ok(copy)
    }

    /// Puts an item back exactly as it was, keeping its original position.
    pub async fn restore(&self, guild_id: GuildId, item: &QueueItem) -> ServiceResult<()> {
        self.queue()?.enqueue(guild_id, item).await?;
        Ok(())
    }

    /// Candidate tracks for a query, cached per hint and normalised query.
    pub async fn search(
        &self,
        query: &str,
        source_hint: TrackSource,
        limit: usize,
    ) -> ServiceResult<Vec<Track>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::MissingInput);
        }
        let limit = match limit {
            0 => DEFAULT_SEARCH_LIMIT,
            n => n.min(MAX_SEARCH_LIMIT),
        };

        if let Some(cached) = self.search_cache.get(query, source_hint) {
            debug!(%query, "search cache hit");
            return Ok(cached);
        }

        let results = if is_catalog_input(query, source_hint) {
            let catalog = self.catalog()?;
            if is_catalog_link(query) {
                vec![catalog.resolve_track(query).await?]
            } else {
                catalog.search_tracks(query, limit).await?
            }
        } else {
            self.resolver()?.resolve_search(query, source_hint, limit).await?
        };

        self.search_cache.insert(query, source_hint, results.clone());
        Ok(results)
    }

    /// A fresh media URL for a queued track.
    pub async fn resolve_stream_url(&self, track: &Track) -> ServiceResult<String> {
        Ok(self
            .resolver()?
            .resolve_stream_url(&track.url, track.source)
            .await?)
    }

    pub async fn dequeue(&self, guild_id: GuildId) -> ServiceResult<QueueItem> {
        Ok(self.queue()?.dequeue(guild_id).await?)
    }

    /// Next item honouring the guild's shuffle setting.
    pub async fn dequeue_next(&self, guild_id: GuildId) -> ServiceResult<QueueItem> {
        let queue = self.queue()?;
        let settings = queue.get_settings(guild_id).await?;
        let item = if settings.shuffle {
            queue.dequeue_random(guild_id).await?
        } else {
            queue.dequeue(guild_id).await?
        };
        Ok(item)
    }

    pub async fn peek(&self, guild_id: GuildId) -> ServiceResult<QueueItem> {
        Ok(self.queue()?.peek(guild_id).await?)
    }

    pub async fn list(&self, guild_id: GuildId, limit: usize) -> ServiceResult<Vec<QueueItem>> {
        Ok(self.queue()?.list(guild_id, limit).await?)
    }

    pub async fn queue_size(&self, guild_id: GuildId) -> ServiceResult<usize> {
        Ok(self.queue()?.queue_size(guild_id).await?)
    }

    pub async fn clear(&self, guild_id: GuildId) -> ServiceResult<()> {
        self.queue()?.clear(guild_id).await?;
        info!(%guild_id, "🗑️ queue cleared");
        Ok(())
    }

    pub async fn get_settings(&self, guild_id: GuildId) -> ServiceResult<QueueSettings> {
        Ok(self.queue()?.get_settings(guild_id).await?)
    }

    pub async fn set_settings(&self, guild_id: GuildId, settings: QueueSettings) -> ServiceResult<()> {
        Ok(self.queue()?.set_settings(guild_id, settings).await?)
    }

    /// Fails if the service cannot play anything at all.
    pub fn validate(&self) -> ServiceResult<()> {
        self.queue()?;
        self.resolver()?;
        Ok(())
    }

    pub fn describe(&self) -> String {
        format!(
            "queue={} resolver={} catalog={}",
            self.queue.is_some(),
            self.resolver.is_some(),
            self.catalog.is_some()
        )
    }
}
