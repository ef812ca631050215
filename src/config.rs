use anyhow::{Context, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::audio::PlayerConfig;

#[derive(Clone)]
pub struct Config {
    // Queue store
    pub redis_url: String,

    // External tools
    pub ytdlp_binary: String,
    pub ytdlp_tmp_dir: Option<PathBuf>,
    pub ffmpeg_binary: String,

    // Catalog (optional)
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,

    // Audio
    pub opus_bitrate: u32,

    // Limits
    pub max_queue_size: usize, // 0 = unlimited

    // Timing
    pub resolve_timeout: Duration,
    pub search_cache_ttl: Duration,
    pub frame_send_timeout: Duration,
    pub worker_retry_delay: Duration,
    pub auto_leave_timeout: Duration,
}

impl Config {
    /// Reads `.env` (if present) and the process environment, then
    /// validates the result.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or blank keys take their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let redis_url = match get("REDIS_URL") {
            Some(url) => url,
            None => redis_url_from_parts(
                get("REDIS_HOST").as_deref().unwrap_or("127.0.0.1"),
                parse_or(get("REDIS_PORT"), "REDIS_PORT", 6379u16)?,
                get("REDIS_PASSWORD").as_deref(),
                parse_or(get("REDIS_DB"), "REDIS_DB", 0u32)?,
            )?,
        };

        let config = Self {
            redis_url,

            ytdlp_binary: get("YTDLP_BINARY").unwrap_or(defaults.ytdlp_binary),
            ytdlp_tmp_dir: get("YTDLP_TMP_DIR").map(PathBuf::from),
            ffmpeg_binary: get("FFMPEG_BINARY").unwrap_or(defaults.ffmpeg_binary),

            spotify_client_id: get("SPOTIFY_CLIENT_ID"),
            spotify_client_secret: get("SPOTIFY_CLIENT_SECRET"),

            opus_bitrate: parse_or(get("OPUS_BITRATE"), "OPUS_BITRATE", defaults.opus_bitrate)?,
            max_queue_size: parse_or(get("MAX_QUEUE_SIZE"), "MAX_QUEUE_SIZE", defaults.max_queue_size)?,

            resolve_timeout: duration_or(get("RESOLVE_TIMEOUT"), "RESOLVE_TIMEOUT", defaults.resolve_timeout)?,
            search_cache_ttl: duration_or(get("SEARCH_CACHE_TTL"), "SEARCH_CACHE_TTL", defaults.search_cache_ttl)?,
            frame_send_timeout: duration_or(
                get("FRAME_SEND_TIMEOUT"),
                "FRAME_SEND_TIMEOUT",
                defaults.frame_send_timeout,
            )?,
            worker_retry_delay: duration_or(
                get("WORKER_RETRY_DELAY"),
                "WORKER_RETRY_DELAY",
                defaults.worker_retry_delay,
            )?,
            auto_leave_timeout: duration_or(
                get("AUTO_LEAVE_TIMEOUT"),
                "AUTO_LEAVE_TIMEOUT",
                defaults.auto_leave_timeout,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            anyhow::bail!("REDIS_URL must use redis:// or rediss://, got: {}", self.redis_url);
        }

        if self.opus_bitrate > 510_000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }
        if self.opus_bitrate < 8_000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }

        if self.resolve_timeout.is_zero() {
            anyhow::bail!("Resolve timeout must be greater than 0");
        }
        if self.frame_send_timeout.is_zero() {
            anyhow::bail!("Frame send timeout must be greater than 0");
        }

        if self.spotify_client_id.is_some() != self.spotify_client_secret.is_some() {
            anyhow::bail!("SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET must be set together");
        }

        Ok(())
    }

    pub fn spotify_credentials(&self) -> Option<(&str, &str)> {
        match (&self.spotify_client_id, &self.spotify_client_secret) {
            (Some(id), Some(secret)) => Some((id.as_str(), secret.as_str())),
            _ => None,
        }
    }

    pub fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            send_timeout: self.frame_send_timeout,
            retry_delay: self.worker_retry_delay,
            ..PlayerConfig::default()
        }
    }

    /// One-line summary for logs. Never includes secrets.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary: redis={} | yt-dlp={} ffmpeg={} | spotify={} | {}kbps | queue max {} | resolve timeout {} | search cache {} | auto-leave {}",
            redact_url(&self.redis_url),
            self.ytdlp_binary,
            self.ffmpeg_binary,
            if self.spotify_credentials().is_some() { "on" } else { "off" },
            self.opus_bitrate / 1000,
            if self.max_queue_size == 0 { "unlimited".to_string() } else { self.max_queue_size.to_string() },
            humantime::format_duration(self.resolve_timeout),
            humantime::format_duration(self.search_cache_ttl),
            humantime::format_duration(self.auto_leave_timeout),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),

            ytdlp_binary: "yt-dlp".to_string(),
            ytdlp_tmp_dir: None,
            ffmpeg_binary: "ffmpeg".to_string(),

            spotify_client_id: None,
            spotify_client_secret: None,

            opus_bitrate: 96_000, // 96kbps (Discord default)

            max_queue_size: 500,

            resolve_timeout: Duration::from_secs(30),
            search_cache_ttl: Duration::from_secs(5 * 60),
            frame_send_timeout: Duration::from_secs(1),
            worker_retry_delay: Duration::from_secs(1),
            auto_leave_timeout: Duration::from_secs(300),
        }
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid {key}: {value:?}")),
        None => Ok(default),
    }
}

fn duration_or(raw: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match raw {
        Some(value) => humantime::parse_duration(&value)
            .with_context(|| format!("invalid {key}: {value:?} (expected e.g. 30s, 5m)")),
        None => Ok(default),
    }
}

/// The password is percent-encoded into the userinfo.
fn redis_url_from_parts(host: &str, port: u16, password: Option<&str>, db: u32) -> Result<String> {
    let mut url = url::Url::parse(&format!("redis://{host}:{port}/{db}"))
        .with_context(|| format!("Invalid REDIS_HOST: {host}"))?;
    if let Some(password) = password {
        url.set_password(Some(password))
            .map_err(|()| anyhow::anyhow!("REDIS_PASSWORD cannot be used with host {host}"))?;
    }
    Ok(url.to_string())
}

fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<invalid>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379/0");
        assert_eq!(config.opus_bitrate, 96_000);
        assert_eq!(config.max_queue_size, 500);
        assert_eq!(config.search_cache_ttl, Duration::from_secs(300));
        assert!(config.spotify_credentials().is_none());
    }

    #[test]
    fn redis_url_is_composed_from_parts() {
        let config = load(&[
            ("REDIS_HOST", "cache.internal"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "hunter2"),
            ("REDIS_DB", "3"),
        ])
        .unwrap();
        assert_eq!(config.redis_url, "redis://:hunter2@cache.internal:6380/3");
        assert!(!config.summary().contains("hunter2"));
    }

    #[test]
    fn redis_password_is_percent_encoded() {
        let config = load(&[
            ("REDIS_HOST", "cache.internal"),
            ("REDIS_PASSWORD", "p@ss/w:rd"),
        ])
        .unwrap();

        let parsed = url::Url::parse(&config.redis_url).unwrap();
        assert_eq!(parsed.host_str(), Some("cache.internal"));
        assert_eq!(parsed.port(), Some(6379));
        assert_eq!(parsed.path(), "/0");
        assert_eq!(parsed.password(), Some("p%40ss%2Fw%3Ard"));
        assert!(!config.summary().contains("p%40ss"));
    }

    #[test]
    fn explicit_redis_url_wins() {
        let config = load(&[("REDIS_URL", "redis://r:1/2"), ("REDIS_HOST", "ignored")]).unwrap();
        assert_eq!(config.redis_url, "redis://r:1/2");
    }

    #[test]
    fn durations_use_humantime() {
        let config = load(&[("RESOLVE_TIMEOUT", "45s"), ("AUTO_LEAVE_TIMEOUT", "10m")]).unwrap();
        assert_eq!(config.resolve_timeout, Duration::from_secs(45));
        assert_eq!(config.auto_leave_timeout, Duration::from_secs(600));
        assert_eq!(config.player_config().send_timeout, Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(load(&[("OPUS_BITRATE", "600000")]).is_err());
        assert!(load(&[("OPUS_BITRATE", "fast")]).is_err());
        assert!(load(&[("RESOLVE_TIMEOUT", "soon")]).is_err());
        assert!(load(&[("SPOTIFY_CLIENT_ID", "id")]).is_err());
    }

    #[test]
    fn spotify_needs_both_credentials() {
        let config = load(&[("SPOTIFY_CLIENT_ID", "id"), ("SPOTIFY_CLIENT_SECRET", "secret")]).unwrap();
        assert_eq!(config.spotify_credentials(), Some(("id", "secret")));
        assert!(!config.summary().contains("secret"));
    }
}
