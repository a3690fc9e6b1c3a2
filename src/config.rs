use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::gateway::GatewaySettings;
use crate::ingest::SourceSettings;
use crate::registry::Camera;

const DEFAULT_CAMERA_ID: &str = "default";
const DEFAULT_CAMERA_URL: &str = "stub://default";
const DEFAULT_FEED_ADDR: &str = "0.0.0.0:3002";
const DEFAULT_RECOGNITION_ADDR: &str = "0.0.0.0:5001";
const DEFAULT_RECOGNIZER_URL: &str = "http://127.0.0.1:8001";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
const MAX_TARGET_FPS: u32 = 60;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    cameras: Option<Vec<CameraConfigFile>>,
    source: Option<SourceConfigFile>,
    feed: Option<FeedConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    session: Option<SessionConfigFile>,
    log: Option<LogConfigFile>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    label: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    transcoder: Option<String>,
    target_fps: Option<u32>,
    quality: Option<u32>,
    rtsp_transport: Option<String>,
    start_grace_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
    stall_timeout_secs: Option<u64>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FeedConfigFile {
    addr: Option<String>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    addr: Option<String>,
    recognizer_url: Option<String>,
    request_timeout_secs: Option<u64>,
    probe_on_startup: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    idle_timeout_secs: Option<u64>,
    ping_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct LogConfigFile {
    health_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub cameras: Vec<Camera>,
    pub source: SourceSettings,
    pub feed: FeedSettings,
    pub recognition: RecognitionSettings,
    pub session: SessionSettings,
    /// Period of the per-camera health log line; zero disables it.
    pub health_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub addr: String,
    /// Frames buffered per viewer before the oldest is dropped.
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub addr: String,
    /// Root URL of the face-recognition worker.
    pub recognizer_url: String,
    pub request_timeout: Duration,
    pub probe_on_startup: bool,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Zero disables idle reaping.
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
}

impl RelayConfig {
    /// Load from the file named by `CAMGATE_CONFIG` (if any), then the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMGATE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .map(|camera| Camera {
                    label: camera.label.unwrap_or_else(|| camera.id.clone()),
                    id: camera.id,
                    url: camera.url,
                })
                .collect(),
            None => vec![default_camera(DEFAULT_CAMERA_URL)],
        };

        let defaults = SourceSettings::default();
        let src = file.source.unwrap_or_default();
        let source = SourceSettings {
            transcoder: src.transcoder.unwrap_or(defaults.transcoder),
            target_fps: src.target_fps.unwrap_or(defaults.target_fps),
            quality: src.quality.unwrap_or(defaults.quality),
            rtsp_transport: src.rtsp_transport.unwrap_or(defaults.rtsp_transport),
            start_grace: src
                .start_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.start_grace),
            stop_grace: src
                .stop_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_grace),
            stall_timeout: src
                .stall_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stall_timeout),
            initial_backoff: src
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: src
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            max_consecutive_failures: src
                .max_consecutive_failures
                .unwrap_or(defaults.max_consecutive_failures),
        };

        let feed_file = file.feed.unwrap_or_default();
        let feed = FeedSettings {
            addr: feed_file
                .addr
                .unwrap_or_else(|| DEFAULT_FEED_ADDR.to_string()),
            queue_depth: feed_file
                .queue_depth
                .unwrap_or(crate::frame::DEFAULT_QUEUE_DEPTH),
        };

        let rec = file.recognition.unwrap_or_default();
        let recognition = RecognitionSettings {
            addr: rec
                .addr
                .unwrap_or_else(|| DEFAULT_RECOGNITION_ADDR.to_string()),
            recognizer_url: rec
                .recognizer_url
                .unwrap_or_else(|| DEFAULT_RECOGNIZER_URL.to_string()),
            request_timeout: Duration::from_secs(
                rec.request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            probe_on_startup: rec.probe_on_startup.unwrap_or(true),
        };

        let sess = file.session.unwrap_or_default();
        let session = SessionSettings {
            idle_timeout: Duration::from_secs(
                sess.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            ),
            ping_interval: Duration::from_secs(
                sess.ping_interval_secs
                    .unwrap_or(DEFAULT_PING_INTERVAL_SECS),
            ),
        };

        let health_interval = Duration::from_secs(
            file.log
                .and_then(|log| log.health_interval_secs)
                .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
        );

        Self {
            cameras,
            source,
            feed,
            recognition,
            session,
            health_interval,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMGATE_FEED_ADDR") {
            if !addr.trim().is_empty() {
                self.feed.addr = addr;
            }
        }
        if let Ok(addr) = std::env::var("CAMGATE_RECOGNITION_ADDR") {
            if !addr.trim().is_empty() {
                self.recognition.addr = addr;
            }
        }
        if let Ok(url) = std::env::var("CAMGATE_RECOGNIZER_URL") {
            if !url.trim().is_empty() {
                self.recognition.recognizer_url = url;
            }
        }
        if let Ok(url) = std::env::var("CAMGATE_CAMERA_URL") {
            if !url.trim().is_empty() {
                match self.cameras.first_mut() {
                    Some(camera) => camera.url = url,
                    None => self.cameras.push(default_camera(&url)),
                }
            }
        }
        if let Ok(fps) = std::env::var("CAMGATE_TARGET_FPS") {
            self.source.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMGATE_TARGET_FPS must be an integer frame rate"))?;
        }
        if let Ok(program) = std::env::var("CAMGATE_TRANSCODER") {
            if !program.trim().is_empty() {
                self.source.transcoder = program;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        let mut seen = HashSet::new();
        for camera in &mut self.cameras {
            validate_camera_id(&camera.id)?;
            camera.id = camera.id.to_lowercase();
            if !seen.insert(camera.id.clone()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.id));
            }
            validate_camera_url(&camera.url)
                .with_context(|| format!("camera '{}'", camera.id))?;
        }

        if self.source.target_fps == 0 || self.source.target_fps > MAX_TARGET_FPS {
            return Err(anyhow!(
                "target_fps must be between 1 and {}",
                MAX_TARGET_FPS
            ));
        }
        if !matches!(self.source.rtsp_transport.as_str(), "tcp" | "udp") {
            return Err(anyhow!("rtsp_transport must be 'tcp' or 'udp'"));
        }
        if self.source.transcoder.trim().is_empty() {
            return Err(anyhow!("transcoder must not be empty"));
        }
        if self.source.stall_timeout.is_zero() {
            return Err(anyhow!("stall_timeout_secs must be greater than zero"));
        }
        if self.source.max_backoff < self.source.initial_backoff {
            self.source.max_backoff = self.source.initial_backoff;
        }
        if self.feed.queue_depth == 0 {
            return Err(anyhow!("feed queue_depth must be at least 1"));
        }
        if self.recognition.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout_secs must be greater than zero"));
        }
        if self.session.ping_interval.is_zero() {
            return Err(anyhow!("ping_interval_secs must be greater than zero"));
        }

        parse_addr(&self.feed.addr).context("feed addr")?;
        parse_addr(&self.recognition.addr).context("recognition addr")?;
        let recognizer = url::Url::parse(&self.recognition.recognizer_url)
            .with_context(|| format!("invalid recognizer_url '{}'", self.recognition.recognizer_url))?;
        if !matches!(recognizer.scheme(), "http" | "https") {
            return Err(anyhow!("recognizer_url must be http or https"));
        }
        Ok(())
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            request_timeout: self.recognition.request_timeout,
            ..GatewaySettings::default()
        }
    }
}

pub fn validate_camera_id(id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CAMERA_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9_-]{1,64}$").expect("camera id pattern compiles")
    });
    if !re.is_match(&id.to_lowercase()) {
        return Err(anyhow!(
            "camera id '{}' must match ^[a-z0-9_-]{{1,64}}$",
            id
        ));
    }
    Ok(())
}

fn validate_camera_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| anyhow!("invalid camera url '{}': {}", crate::ingest::redact_url(raw), e))?;
    match parsed.scheme() {
        "rtsp" | "rtsps" | "stub" => Ok(()),
        other => Err(anyhow!(
            "unsupported camera url scheme '{}' (expected rtsp, rtsps or stub)",
            other
        )),
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| anyhow!("invalid socket address '{}': {}", addr, e))
}

fn default_camera(url: &str) -> Camera {
    Camera {
        id: DEFAULT_CAMERA_ID.to_string(),
        label: DEFAULT_CAMERA_ID.to_string(),
        url: url.to_string(),
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
