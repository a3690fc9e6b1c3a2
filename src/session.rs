//! Viewer sessions.
//!
//! A session lives from connect to disconnect of one transport connection. It
//! has at most one camera subscription and at most one recognition channel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id. Callers must not mix raw ids with `next()` ids.
    pub fn from_raw(raw: u64) -> Self {
        SessionId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Which channel a session arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Feed,
    Recognition,
}

/// Bookkeeping for one live connection.
#[derive(Debug)]
pub struct ViewerSession {
    pub id: SessionId,
    pub channel: Channel,
    pub peer: Option<std::net::SocketAddr>,
    /// Camera subscription, if any.
    pub camera: Option<String>,
    connected_at: Instant,
    last_activity: Instant,
}

impl ViewerSession {
    pub fn new(channel: Channel, peer: Option<std::net::SocketAddr>) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::next(),
            channel,
            peer,
            camera: None,
            connected_at: now,
            last_activity: now,
        }
    }

    /// Record client activity.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// True when `timeout` is non-zero and exceeded.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        !timeout.is_zero() && self.idle_for() > timeout
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
