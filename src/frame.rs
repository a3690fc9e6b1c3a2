//! Frame model and per-subscriber buffering.
//!
//! - `Frame`: immutable encoded still image with a sequence number and capture time.
//! - `FrameQueue`: bounded latest-wins queue that sits between the hub and one viewer.
//!
//! Frames are never stored beyond these queues. Cloning a `Frame` only bumps the
//! reference count of the underlying buffer, so fan-out to many viewers does not
//! copy JPEG data.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::sync::Notify;

/// Default depth of a viewer's outbound queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 2;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One encoded still image (JPEG) produced by a frame source.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Bytes,
    seq: u64,
    captured_at: SystemTime,
}

impl Frame {
    pub fn new(data: Bytes, seq: u64) -> Self {
        Self {
            data,
            seq,
            captured_at: SystemTime::now(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Sequence number within the running source instance, starting at 1.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ----------------------------------------------------------------------------
// FrameQueue: bounded latest-wins queue
// ----------------------------------------------------------------------------

/// Why a queue stopped yielding frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscriber was removed from its hub.
    Unsubscribed,
    /// The source behind the hub gave up after repeated failures.
    SourceDegraded,
}

/// Bounded single-consumer frame queue.
///
/// `push` never waits: when the queue is full the oldest frame is evicted so the
/// consumer always catches up to the newest frame. Order of the frames that do
/// get delivered is preserved.
pub struct FrameQueue {
    inner: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

struct QueueState {
    frames: VecDeque<Frame>,
    closed: Option<CloseReason>,
    dropped: u64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                closed: None,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push a frame, evicting the oldest queued frame when at capacity.
    ///
    /// Returns `false` when the queue is closed and the frame was discarded.
    pub fn push(&self, frame: Frame) -> bool {
        {
            let mut state = self.lock();
            if state.closed.is_some() {
                return false;
            }
            while state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.dropped += 1;
            }
            state.frames.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next frame.
    ///
    /// Frames queued before a close are drained first, then the close reason
    /// is returned on every call.
    pub async fn pop(&self) -> Result<Frame, CloseReason> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Ok(frame);
                }
                if let Some(reason) = state.closed {
                    return Err(reason);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of `pop`.
    pub fn try_pop(&self) -> Option<Frame> {
        self.lock().frames.pop_front()
    }

    /// Close the queue. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
        }
        self.notify.notify_one();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted by the latest-wins policy so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A panic while holding this lock cannot leave the deque inconsistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
