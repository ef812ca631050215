use async_trait::async_trait;
use std::{process::Stdio, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use super::FRAME_DURATION;

pub const DEFAULT_BITRATE: u32 = 96_000;
const EXIT_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder stdout is not available")]
    MissingStdout,

    #[error("{binary} -version failed: {reason}")]
    Version { binary: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub url: String,
    /// Percent; 100 leaves the gain untouched.
    pub volume: i32,
    /// Seek offset for resumed streams.
    pub start_at: Duration,
}

/// Ogg/Opus byte stream plus the process producing it.
pub struct TranscodeStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
    stderr_task: Option<JoinHandle<()>>,
}

impl TranscodeStream {
    /// A stream with no process behind it.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            child: None,
            stderr_task: None,
        }
    }

    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        self.reader.as_mut()
    }

    /// Kills the process and reaps it, waiting at most a couple of seconds.
    pub async fn shutdown(self) {
        let TranscodeStream {
            reader,
            child,
            stderr_task,
        } = self;
        drop(reader);

        if let Some(mut child) = child {
            if let Err(err) = child.start_kill() {
                debug!(error = %err, "transcoder already gone");
            }
            match timeout(EXIT_WAIT, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "transcoder exited"),
                Ok(Err(err)) => warn!(error = %err, "failed to reap transcoder"),
                Err(_) => warn!("transcoder did not exit in time"),
            }
        }

        if let Some(task) = stderr_task {
            task.abort();
        }
    }
}

/// Produces an Ogg/Opus stream (48 kHz, stereo, 20 ms frames) from a media URL.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn spawn(&self, request: &TranscodeRequest) -> Result<TranscodeStream, TranscodeError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: String,
    bitrate: u32,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            bitrate: DEFAULT_BITRATE,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn args(&self, request: &TranscodeRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "-reconnect",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_delay_max",
            "5",
        ]
        .map(String::from)
        .to_vec();

        if !request.start_at.is_zero() {
            args.push("-ss".to_string());
            args.push(format!("{:.3}", request.start_at.as_secs_f64()));
        }

        args.push("-i".to_string());
        args.push(request.url.clone());
        args.push("-af".to_string());
        args.push(format!("volume={:.2}", f64::from(request.volume) / 100.0));

        args.extend(
            [
                "-c:a".to_string(),
                "libopus".to_string(),
                "-ar".to_string(),
                "48000".to_string(),
                "-ac".to_string(),
                "2".to_string(),
                "-b:a".to_string(),
                self.bitrate.to_string(),
                "-vbr".to_string(),
                "on".to_string(),
                "-frame_duration".to_string(),
                FRAME_DURATION.as_millis().to_string(),
                "-application".to_string(),
                "audio".to_string(),
                "-f".to_string(),
                "ogg".to_string(),
                "-loglevel".to_string(),
                "warning".to_string(),
                "pipe:1".to_string(),
            ],
        );
        args
    }

    /// First line of `ffmpeg -version`, used by the health check.
    pub async fn version(&self) -> Result<String, TranscodeError> {
        let output = Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TranscodeError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TranscodeError::Version {
                binary: self.binary.clone(),
                reason: output.status.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, request: &TranscodeRequest) -> Result<TranscodeStream, TranscodeError> {
        let mut child = Command::new(&self.binary)
            .args(self.args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(TranscodeError::MissingStdout)?;
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!(target: "tunebot::ffmpeg", "{line}");
                    }
                }
            })
        });

        debug!(volume = request.volume, start_at = ?request.start_at, "🎚️ transcoder started");
        Ok(TranscodeStream {
            reader: Box::new(stdout),
            child: Some(child),
            stderr_task,
        })
    }
}
