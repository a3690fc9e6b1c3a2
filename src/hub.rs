//! Broadcast hub: fans one camera's frames out to its viewers.
//!
//! Each subscriber owns a bounded `FrameQueue`. Publishing pushes into every
//! queue without awaiting, so a slow viewer only loses its own older frames and
//! never holds up the source or other viewers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::RelayError;
use crate::frame::{CloseReason, Frame, FrameQueue};
use crate::session::SessionId;

/// Subscriber set for one camera.
pub struct Hub {
    camera: String,
    queue_depth: usize,
    inner: Mutex<HubState>,
    published: AtomicU64,
}

struct HubState {
    subscribers: HashMap<SessionId, Arc<FrameQueue>>,
    closed: bool,
}

impl Hub {
    pub fn new(camera: impl Into<String>, queue_depth: usize) -> Self {
        Self {
            camera: camera.into(),
            queue_depth: queue_depth.max(1),
            inner: Mutex::new(HubState {
                subscribers: HashMap::new(),
                closed: false,
            }),
            published: AtomicU64::new(0),
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// Register `session`. Subscribing twice returns the same queue.
    pub fn subscribe(&self, session: SessionId) -> Result<Arc<FrameQueue>, RelayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RelayError::SourceDegraded(self.camera.clone()));
        }
        let queue = state
            .subscribers
            .entry(session)
            .or_insert_with(|| Arc::new(FrameQueue::new(self.queue_depth)))
            .clone();
        Ok(queue)
    }

    /// Deregister `session` and close its queue. Returns whether it was subscribed.
    pub fn unsubscribe(&self, session: SessionId) -> bool {
        let removed = self.lock().subscribers.remove(&session);
        match removed {
            Some(queue) => {
                queue.close(CloseReason::Unsubscribed);
                true
            }
            None => false,
        }
    }

    /// Deliver `frame` to every current subscriber. Returns the fan-out count.
    pub fn publish(&self, frame: Frame) -> usize {
        let state = self.lock();
        if state.closed {
            return 0;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        for queue in state.subscribers.values() {
            if queue.push(frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close every subscriber queue: the source behind this hub is gone for good.
    ///
    /// Subscribers stay registered until they unsubscribe, so the registry's
    /// count still drives teardown.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for queue in state.subscribers.values() {
            queue.close(CloseReason::SourceDegraded);
        }
    }

    /// Remove every subscriber, closing their queues as unsubscribed.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.lock().subscribers.drain().collect();
        for (_, queue) in &drained {
            queue.close(CloseReason::Unsubscribed);
        }
        drained.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.lock().subscribers.contains_key(&session)
    }

    /// Frames published since the hub was created.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Frames dropped by the latest-wins policy, summed over current subscribers.
    pub fn dropped(&self) -> u64 {
        self.lock().subscribers.values().map(|q| q.dropped()).sum()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(seq: u64) -> Frame {
        Frame::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), seq)
    }

    #[test]
    fn subscribe_is_idempotent_per_session() {
        let hub = Hub::new("lab1", 2);
        let a = SessionId::from_raw(1);
        let q1 = hub.subscribe(a).expect("subscribe");
        let q2 = hub.subscribe(a).expect("subscribe again");
        assert!(Arc::ptr_eq(&q1, &q2));
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn publish_reaches_only_subscribers() {
        let hub = Hub::new("lab1", 2);
        let a = hub.subscribe(SessionId::from_raw(1)).expect("a");
        let b = hub.subscribe(SessionId::from_raw(2)).expect("b");
        assert_eq!(hub.publish(frame(1)), 2);

        assert!(hub.unsubscribe(SessionId::from_raw(2)));
        assert!(!hub.unsubscribe(SessionId::from_raw(2)));
        assert_eq!(hub.publish(frame(2)), 1);

        assert_eq!(a.try_pop().map(|f| f.seq()), Some(1));
        assert_eq!(a.try_pop().map(|f| f.seq()), Some(2));
        assert_eq!(b.try_pop().map(|f| f.seq()), Some(1));
        assert!(b.try_pop().is_none());
        assert_eq!(b.close_reason(), Some(CloseReason::Unsubscribed));
        assert_eq!(hub.published(), 2);
    }

    #[test]
    fn slow_subscriber_does_not_affect_fast_one() {
        let hub = Hub::new("lab1", 1);
        let slow = hub.subscribe(SessionId::from_raw(1)).expect("slow");
        let fast = hub.subscribe(SessionId::from_raw(2)).expect("fast");
        for seq in 1..=10 {
            hub.publish(frame(seq));
            assert_eq!(fast.try_pop().map(|f| f.seq()), Some(seq));
        }
        assert_eq!(slow.try_pop().map(|f| f.seq()), Some(10));
        assert_eq!(hub.dropped(), 9);
    }

    #[test]
    fn closed_hub_rejects_new_subscribers() {
        let hub = Hub::new("lab1", 2);
        let q = hub.subscribe(SessionId::from_raw(1)).expect("subscribe");
        hub.close();
        assert_eq!(q.close_reason(), Some(CloseReason::SourceDegraded));
        assert!(matches!(
            hub.subscribe(SessionId::from_raw(2)),
            Err(RelayError::SourceDegraded(_))
        ));
        assert_eq!(hub.publish(frame(1)), 0);
        assert_eq!(hub.len(), 1);
    }
}
