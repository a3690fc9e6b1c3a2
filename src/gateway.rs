//! Recognition gateway.
//!
//! Sessions on the recognition channel submit frames; the gateway keeps at most
//! one recognizer request in flight per session and routes each result back to
//! the session that asked for it. Frames that arrive while a request is
//! outstanding are dropped, not queued, so a slow worker never builds a backlog.
//!
//! Every request carries a `RequestTag`. A result is delivered only when its
//! session is still open and the tag matches the session's in-flight tag, which
//! keeps late answers for a closed session from leaking anywhere else.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{RecognitionError, RelayError};
use crate::recognize::Recognizer;
use crate::session::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestTag(u64);

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Outcome of offering a frame to the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submit {
    Accepted(RequestTag),
    /// A request is already outstanding (or the session is closed).
    Dropped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecognitionResult {
    pub tag: RequestTag,
    pub matches: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub request_timeout: Duration,
    /// Undelivered results buffered per session before new ones are dropped.
    pub result_buffer: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            result_buffer: 8,
        }
    }
}

struct SessionEntry {
    results: mpsc::Sender<RecognitionResult>,
    in_flight: Option<RequestTag>,
    cancel: CancellationToken,
    /// Which `open` call owns this entry.
    generation: u64,
}

pub struct RecognitionGateway {
    recognizer: Arc<dyn Recognizer>,
    settings: GatewaySettings,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_tag: AtomicU64,
    next_generation: AtomicU64,
}

impl RecognitionGateway {
    pub fn new(recognizer: Arc<dyn Recognizer>, settings: GatewaySettings) -> Arc<Self> {
        Arc::new(Self {
            recognizer,
            settings,
            sessions: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Register `session`. Reopening an id cancels the previous registration.
    pub fn open(self: &Arc<Self>, session: SessionId) -> GatewaySession {
        let (tx, rx) = mpsc::channel(self.settings.result_buffer.max(1));
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = SessionEntry {
            results: tx,
            in_flight: None,
            cancel: CancellationToken::new(),
            generation,
        };
        if let Some(previous) = self.lock().insert(session, entry) {
            previous.cancel.cancel();
        }
        log::debug!("recognition session {} opened ({})", session, self.recognizer.name());
        GatewaySession {
            id: session,
            generation,
            results: rx,
            gateway: Arc::clone(self),
        }
    }

    /// Offer a frame. Never waits for the recognizer.
    pub fn on_frame(self: &Arc<Self>, session: SessionId, jpeg: Bytes) -> Submit {
        let (tag, cancel) = {
            let mut sessions = self.lock();
            let Some(entry) = sessions.get_mut(&session) else {
                log::debug!("frame for closed recognition session {} ignored", session);
                return Submit::Dropped;
            };
            if let Some(outstanding) = entry.in_flight {
                log::debug!(
                    "session {}: frame dropped, request {} still in flight",
                    session,
                    outstanding
                );
                return Submit::Dropped;
            }
            let tag = RequestTag(self.next_tag.fetch_add(1, Ordering::Relaxed));
            entry.in_flight = Some(tag);
            (tag, entry.cancel.clone())
        };

        let gateway = Arc::clone(self);
        let call = self.recognizer.recognize(jpeg);
        let timeout = self.settings.request_timeout;
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("session {}: request {} cancelled", session, tag);
                    return;
                }
                outcome = tokio::time::timeout(timeout, call) => outcome,
            };
            match outcome {
                Ok(Ok(matches)) => {
                    gateway.on_result(session, tag, matches);
                }
                Ok(Err(err)) => gateway.on_failure(session, tag, err),
                Err(_) => gateway.on_failure(session, tag, RecognitionError::Timeout),
            }
        });
        Submit::Accepted(tag)
    }

    /// Route a recognizer answer. Returns whether it reached the session.
    pub fn on_result(&self, session: SessionId, tag: RequestTag, matches: Vec<String>) -> bool {
        let mut sessions = self.lock();
        let Some(entry) = sessions.get_mut(&session) else {
            log::debug!("result {} for closed session {} discarded", tag, session);
            return false;
        };
        if entry.in_flight != Some(tag) {
            log::debug!("stale result {} for session {} discarded", tag, session);
            return false;
        }
        entry.in_flight = None;
        match entry.results.try_send(RecognitionResult { tag, matches }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("session {}: result buffer full, result {} dropped", session, tag);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close `session`, aborting any in-flight call. Returns whether it was open.
    pub fn close(&self, session: SessionId) -> bool {
        self.close_matching(session, |_| true)
    }

    /// Close `session` only if it is still the registration from `generation`.
    fn close_generation(&self, session: SessionId, generation: u64) -> bool {
        self.close_matching(session, |entry| entry.generation == generation)
    }

    fn close_matching(&self, session: SessionId, owns: impl Fn(&SessionEntry) -> bool) -> bool {
        let mut sessions = self.lock();
        if !sessions.get(&session).is_some_and(owns) {
            return false;
        }
        let Some(entry) = sessions.remove(&session) else {
            return false;
        };
        drop(sessions);
        entry.cancel.cancel();
        log::debug!("recognition session {} closed", session);
        true
    }

    pub fn in_flight(&self, session: SessionId) -> Option<RequestTag> {
        self.lock().get(&session).and_then(|entry| entry.in_flight)
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    fn on_failure(&self, session: SessionId, tag: RequestTag, err: RecognitionError) {
        let mut sessions = self.lock();
        if let Some(entry) = sessions.get_mut(&session) {
            if entry.in_flight == Some(tag) {
                entry.in_flight = None;
            }
        }
        drop(sessions);
        log::warn!("session {}: request {} failed: {}", session, tag, RelayError::from(err));
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A session's end of the gateway. Dropping it closes the session.
pub struct GatewaySession {
    id: SessionId,
    generation: u64,
    results: mpsc::Receiver<RecognitionResult>,
    gateway: Arc<RecognitionGateway>,
}

impl GatewaySession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn submit(&self, jpeg: Bytes) -> Submit {
        self.gateway.on_frame(self.id, jpeg)
    }

    /// Next result for this session. Pending forever once closed elsewhere.
    pub async fn recv(&mut self) -> Option<RecognitionResult> {
        self.results.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RecognitionResult> {
        self.results.try_recv().ok()
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.gateway.close_generation(self.id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;

    struct FakeRecognizer {
        reply: Result<Vec<String>, ()>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl FakeRecognizer {
        fn answering(names: &[&str], delay: Duration) -> Self {
            Self {
                reply: Ok(names.iter().map(|n| n.to_string()).collect()),
                delay,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Recognizer for FakeRecognizer {
        fn recognize(&self, _jpeg: Bytes) -> BoxFuture<'static, Result<Vec<String>, RecognitionError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.reply.clone();
            let delay = self.delay;
            async move {
                tokio::time::sleep(delay).await;
                reply.map_err(|_| RecognitionError::Status(500))
            }
            .boxed()
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn jpeg() -> Bytes {
        Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9])
    }

    fn gateway(recognizer: FakeRecognizer, timeout: Duration) -> Arc<RecognitionGateway> {
        RecognitionGateway::new(
            Arc::new(recognizer),
            GatewaySettings {
                request_timeout: timeout,
                ..GatewaySettings::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn one_request_in_flight_per_session() {
        let recognizer = FakeRecognizer::answering(&["Jane Doe"], Duration::from_millis(100));
        let calls = recognizer.calls.clone();
        let gateway = gateway(recognizer, Duration::from_secs(10));
        let mut session = gateway.open(SessionId::next());

        let Submit::Accepted(tag) = session.submit(jpeg()) else {
            panic!("first frame should be accepted");
        };
        assert_eq!(session.submit(jpeg()), Submit::Dropped);
        assert_eq!(gateway.in_flight(session.id()), Some(tag));

        let result = session.recv().await.expect("result");
        assert_eq!(result.tag, tag);
        assert_eq!(result.matches, vec!["Jane Doe".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.in_flight(session.id()), None);
        assert!(matches!(session.submit(jpeg()), Submit::Accepted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn results_reach_only_the_originating_session() {
        let gateway = gateway(
            FakeRecognizer::answering(&["Jane Doe"], Duration::from_millis(50)),
            Duration::from_secs(10),
        );
        let mut a = gateway.open(SessionId::next());
        let mut b = gateway.open(SessionId::next());

        assert!(matches!(a.submit(jpeg()), Submit::Accepted(_)));
        let result = a.recv().await.expect("result for a");
        assert_eq!(result.matches, vec!["Jane Doe".to_string()]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(b.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_after_close_is_discarded() {
        let gateway = gateway(
            FakeRecognizer::answering(&["Jane Doe"], Duration::from_secs(1)),
            Duration::from_secs(10),
        );
        let session = gateway.open(SessionId::next());
        let id = session.id();
        let Submit::Accepted(tag) = session.submit(jpeg()) else {
            panic!("should be accepted");
        };
        drop(session);
        assert_eq!(gateway.session_count(), 0);
        assert!(!gateway.on_result(id, tag, vec!["Jane Doe".to_string()]));
        assert_eq!(gateway.on_frame(id, jpeg()), Submit::Dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_clears_in_flight_without_result() {
        let gateway = gateway(
            FakeRecognizer::answering(&["Jane Doe"], Duration::from_secs(60)),
            Duration::from_secs(1),
        );
        let mut session = gateway.open(SessionId::next());
        assert!(matches!(session.submit(jpeg()), Submit::Accepted(_)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(gateway.in_flight(session.id()), None);
        assert!(session.try_recv().is_none());
        assert!(matches!(session.submit(jpeg()), Submit::Accepted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn recognizer_error_sends_nothing() {
        let recognizer = FakeRecognizer {
            reply: Err(()),
            delay: Duration::from_millis(10),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let gateway = gateway(recognizer, Duration::from_secs(1));
        let mut session = gateway.open(SessionId::next());
        assert!(matches!(session.submit(jpeg()), Submit::Accepted(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gateway.in_flight(session.id()), None);
        assert!(session.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_replaced_handle_keeps_the_new_registration() {
        let gateway = gateway(
            FakeRecognizer::answering(&["Jane Doe"], Duration::from_millis(50)),
            Duration::from_secs(10),
        );
        let id = SessionId::next();
        let old = gateway.open(id);
        let mut current = gateway.open(id);
        drop(old);
        assert_eq!(gateway.session_count(), 1);

        assert!(matches!(current.submit(jpeg()), Submit::Accepted(_)));
        let result = current.recv().await.expect("result for reopened session");
        assert_eq!(result.matches, vec!["Jane Doe".to_string()]);

        drop(current);
        assert_eq!(gateway.session_count(), 0);
    }

    #[tokio::test]
    async fn stale_tag_is_discarded() {
        let gateway = gateway(
            FakeRecognizer::answering(&[], Duration::from_secs(60)),
            Duration::from_secs(120),
        );
        let mut session = gateway.open(SessionId::next());
        let Submit::Accepted(tag) = session.submit(jpeg()) else {
            panic!("should be accepted");
        };
        assert!(!gateway.on_result(session.id(), RequestTag(tag.0 + 1000), vec![]));
        assert_eq!(gateway.in_flight(session.id()), Some(tag));
        assert!(gateway.on_result(session.id(), tag, vec![]));
        assert_eq!(session.try_recv().map(|r| r.matches), Some(vec![]));
    }
}
