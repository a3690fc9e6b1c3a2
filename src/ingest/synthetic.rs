//! Synthetic frame source for `stub://` URLs.
//!
//! Produces a byte stream shaped like transcoder stdout (back-to-back JPEG
//! byte strings at the target frame rate) without spawning a process. The
//! query string scripts failures so restart behavior can be exercised:
//!
//! - `fail_after=N`: the stream ends (as if the process exited) after N frames
//! - `stall_after=N`: the stream goes silent after N frames
//! - `fail_start=N`: the first N start attempts for this URL fail
//!
//! Start attempts and live instances are tracked per URL so tests can observe
//! that a "process" exists exactly while it should.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::error::SourceError;

#[derive(Default)]
struct Counters {
    start_attempts: u32,
    live: u32,
}

fn counters() -> &'static Mutex<HashMap<String, Counters>> {
    static COUNTERS: OnceLock<Mutex<HashMap<String, Counters>>> = OnceLock::new();
    COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn with_counters<T>(url: &str, f: impl FnOnce(&mut Counters) -> T) -> T {
    let mut map = counters()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(map.entry(url.to_string()).or_default())
}

/// Number of times a synthetic source for `url` has been started.
pub fn start_attempts(url: &str) -> u32 {
    with_counters(url, |c| c.start_attempts)
}

/// Number of synthetic sources for `url` currently alive.
pub fn live_instances(url: &str) -> u32 {
    with_counters(url, |c| c.live)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Script {
    fail_after: Option<u64>,
    stall_after: Option<u64>,
    fail_start: u32,
}

impl Script {
    fn parse(url: &str) -> Result<Self, SourceError> {
        let parsed =
            url::Url::parse(url).map_err(|_| SourceError::UnsupportedUrl(url.to_string()))?;
        let mut script = Script::default();
        for (key, value) in parsed.query_pairs() {
            let bad = || SourceError::UnsupportedUrl(url.to_string());
            match key.as_ref() {
                "fail_after" => script.fail_after = Some(value.parse().map_err(|_| bad())?),
                "stall_after" => script.stall_after = Some(value.parse().map_err(|_| bad())?),
                "fail_start" => script.fail_start = value.parse().map_err(|_| bad())?,
                _ => {}
            }
        }
        Ok(script)
    }
}

pub(crate) struct SyntheticStream {
    url: String,
    script: Script,
    ticker: Interval,
    produced: u64,
    pending: Vec<u8>,
    alive: bool,
}

impl SyntheticStream {
    pub(crate) fn start(url: &str, target_fps: u32) -> Result<Self, SourceError> {
        let script = Script::parse(url)?;
        let attempt = with_counters(url, |c| {
            c.start_attempts += 1;
            c.start_attempts
        });
        if attempt <= script.fail_start {
            return Err(SourceError::SyntheticRefused(url.to_string()));
        }
        with_counters(url, |c| c.live += 1);

        let period = Duration::from_millis((1000 / target_fps.max(1)).max(1) as u64);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!("synthetic source started: {}", url);
        Ok(Self {
            url: url.to_string(),
            script,
            ticker,
            produced: 0,
            pending: Vec::new(),
            alive: true,
        })
    }

    /// Fill `buf` like a pipe read would. Frames are handed out in two halves
    /// so the splitter sees partial frames.
    pub(crate) async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.alive {
            return Ok(0);
        }
        if self.pending.is_empty() {
            if self.script.fail_after.is_some_and(|n| self.produced >= n) {
                log::info!("synthetic source {} exiting after {} frames", self.url, self.produced);
                self.shutdown();
                return Ok(0);
            }
            if self.script.stall_after.is_some_and(|n| self.produced >= n) {
                std::future::pending::<()>().await;
            }
            self.ticker.tick().await;
            self.produced += 1;
            self.pending = synthetic_jpeg(self.produced);
        }

        let half = (self.pending.len() / 2).max(1);
        let n = half.min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    pub(crate) fn stop(&mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.alive {
            self.alive = false;
            with_counters(&self.url, |c| c.live = c.live.saturating_sub(1));
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A minimal JPEG-shaped byte string: SOI, a comment segment carrying the
/// frame number, EOI.
fn synthetic_jpeg(n: u64) -> Vec<u8> {
    let text = format!("camgate synthetic frame {n}");
    let len = (text.len() + 2) as u16;
    let mut out = Vec::with_capacity(text.len() + 8);
    out.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xFE]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}
