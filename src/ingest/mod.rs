//! Frame sources.
//!
//! A `FrameSource` wraps exactly one running producer for a camera URL:
//! - `rtsp://` / `rtsps://`: an external transcoder process writing MJPEG to stdout
//! - `stub://`: a synthetic in-process stream (tests, demos)
//!
//! Both backends produce a raw byte stream that is cut into JPEG frames by
//! `mjpeg::JpegSplitter`. Sequence numbers restart at 1 for every started source.
//!
//! Sources are started, read and stopped only by the registry's supervisor.

mod ffmpeg;
pub mod mjpeg;
pub mod synthetic;

use std::time::Duration;

use crate::error::SourceError;
use crate::frame::Frame;
use ffmpeg::TranscoderProcess;
use mjpeg::JpegSplitter;
use synthetic::SyntheticStream;

pub use ffmpeg::redact_url;

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// How sources are spawned and supervised.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// Transcoder executable (looked up on `PATH`).
    pub transcoder: String,
    /// Output frame rate requested from the transcoder.
    pub target_fps: u32,
    /// JPEG quality scale passed as `-q:v` (2 = best, 31 = worst).
    pub quality: u32,
    /// `tcp` or `udp`.
    pub rtsp_transport: String,
    /// A process that exits inside this window counts as a failed start.
    pub start_grace: Duration,
    /// How long `stop()` waits after SIGINT before killing.
    pub stop_grace: Duration,
    /// No frame for this long while running counts as a failure.
    pub stall_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures before the source is declared degraded for good.
    pub max_consecutive_failures: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            transcoder: "ffmpeg".to_string(),
            target_fps: 5,
            quality: 5,
            rtsp_transport: "tcp".to_string(),
            start_grace: Duration::from_millis(500),
            stop_grace: Duration::from_secs(2),
            stall_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_consecutive_failures: 5,
        }
    }
}

impl SourceSettings {
    /// Delay before restart attempt number `failures` (1-based): doubles from
    /// `initial_backoff` and saturates at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }
}

enum SourceBackend {
    Process(TranscoderProcess),
    Synthetic(SyntheticStream),
}

/// One running frame producer.
pub struct FrameSource {
    url: String,
    backend: SourceBackend,
    splitter: JpegSplitter,
    chunk: Vec<u8>,
    next_seq: u64,
    stop_grace: Duration,
    ended: bool,
}

impl FrameSource {
    /// Start a producer for `url`.
    pub async fn start(url: &str, settings: &SourceSettings) -> Result<Self, SourceError> {
        let backend = if url.starts_with("stub://") {
            SourceBackend::Synthetic(SyntheticStream::start(url, settings.target_fps)?)
        } else if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            SourceBackend::Process(TranscoderProcess::spawn(url, settings).await?)
        } else {
            return Err(SourceError::UnsupportedUrl(redact_url(url)));
        };

        Ok(Self {
            url: url.to_string(),
            backend,
            splitter: JpegSplitter::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES],
            next_seq: 1,
            stop_grace: settings.stop_grace,
            ended: false,
        })
    }

    /// Next frame from the stream; `None` once the producer has exited.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(jpeg) = self.splitter.next_jpeg() {
                let frame = Frame::new(jpeg, self.next_seq);
                self.next_seq += 1;
                return Some(frame);
            }
            if self.ended {
                return None;
            }

            let read = match &mut self.backend {
                SourceBackend::Process(process) => process.read_chunk(&mut self.chunk).await,
                SourceBackend::Synthetic(stream) => stream.read_chunk(&mut self.chunk).await,
            };
            match read {
                Ok(0) => {
                    log::info!("frame source {} closed its output", redact_url(&self.url));
                    self.ended = true;
                }
                Ok(n) => self.splitter.push(&self.chunk[..n]),
                Err(err) => {
                    log::warn!("frame source {} read failed: {}", redact_url(&self.url), err);
                    self.ended = true;
                }
            }
        }
    }

    /// Terminate the producer and release its resources. Idempotent.
    pub async fn stop(&mut self) {
        self.ended = true;
        match &mut self.backend {
            SourceBackend::Process(process) => process.stop(self.stop_grace).await,
            SourceBackend::Synthetic(stream) => stream.stop(),
        }
    }

    /// OS process id, when backed by a live transcoder.
    pub fn pid(&self) -> Option<u32> {
        match &self.backend {
            SourceBackend::Process(process) => process.id(),
            SourceBackend::Synthetic(_) => None,
        }
    }

    /// Frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
