use anyhow::{Context, Result};
use serenity::model::id::GuildId;
use tracing::{error, info};

use tunebot::{
    audio::FfmpegTranscoder,
    sources::{TrackResolver, YtDlpResolver},
    Config, PlaybackService, TrackSource,
};

const USAGE: &str = "\
Usage:
  tunebot --health-check           verify yt-dlp and ffmpeg are installed
  tunebot --resolve <query|url>    resolve input and print tracks as JSON
  tunebot --queue <guild_id>       print a guild's queue and settings";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tunebot=debug".parse()?)
                .add_directive("redis=info".parse()?),
        )
        .init();

    info!("🎵 Starting tunebot v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("--health-check") => health_check(&config).await,
        Some("--resolve") => resolve(&config, &args[1..].join(" ")).await,
        Some("--queue") => show_queue(&config, args.get(1)).await,
        _ => {
            println!("{USAGE}");
            Ok(())
        }
    }
}

async fn health_check(config: &Config) -> Result<()> {
    let yt_dlp = YtDlpResolver::new()
        .with_binary(&config.ytdlp_binary)
        .with_timeout(config.resolve_timeout)
        .version()
        .await;
    let ffmpeg = FfmpegTranscoder::new()
        .with_binary(&config.ffmpeg_binary)
        .version()
        .await;

    match (&yt_dlp, &ffmpeg) {
        (Ok(yt_dlp), Ok(ffmpeg)) => {
            info!(%yt_dlp, %ffmpeg, "✅ dependencies found");
            println!("OK");
            Ok(())
        }
        _ => {
            if let Err(err) = &yt_dlp {
                error!(error = %err, "❌ yt-dlp unavailable");
            }
            if let Err(err) = &ffmpeg {
                error!(error = %err, "❌ ffmpeg unavailable");
            }
            anyhow::bail!("Missing dependencies");
        }
    }
}

async fn resolve(config: &Config, query: &str) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("--resolve needs a query or URL");
    }

    let resolver = YtDlpResolver::new()
        .with_binary(&config.ytdlp_binary)
        .with_timeout(config.resolve_timeout);
    let hint = TrackSource::detect(query);
    let tracks = resolver
        .resolve_search(query, hint, 0)
        .await
        .with_context(|| format!("failed to resolve {query:?}"))?;

    println!("{}", serde_json::to_string_pretty(&tracks)?);
    Ok(())
}

async fn show_queue(config: &Config, guild: Option<&String>) -> Result<()> {
    let guild_id: u64 = guild
        .context("--queue needs a guild id")?
        .parse()
        .context("guild id must be a number")?;
    if guild_id == 0 {
        anyhow::bail!("guild id must be non-zero");
    }
    let guild_id = GuildId::new(guild_id);

    let service = PlaybackService::from_config(config).await?;
    let settings = service.get_settings(guild_id).await?;
    let items = service.list(guild_id, 0).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "guild_id": guild_id.to_string(),
            "settings": settings,
            "size": items.len(),
            "items": items,
        }))?
    );
    Ok(())
}
