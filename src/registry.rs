//! Source registry and lifecycle manager.
//!
//! The registry is the single owner of camera sources. It holds one arena slot
//! per configured camera and enforces that a camera's producer runs exactly
//! while the camera has subscribers:
//!
//! ```text
//! Idle -> Starting -> Running -> (Degraded -> Running | Stopping) -> Idle
//! ```
//!
//! Lifecycle operations on one camera are serialized by the slot's async lock.
//! While a camera is active, a supervisor task exclusively owns its
//! `FrameSource` (and therefore the transcoder process), forwards frames to the
//! hub, and restarts the source with exponential backoff when it dies or stalls.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::frame::{CloseReason, Frame, FrameQueue};
use crate::hub::Hub;
use crate::ingest::{redact_url, FrameSource, SourceSettings};
use crate::session::SessionId;

/// A configured camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Camera {
    /// Stable identifier used in feed paths (e.g. `lab1`).
    pub id: String,
    /// Room or lab the camera watches.
    pub label: String,
    /// `rtsp://`, `rtsps://` or `stub://` URL.
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// No process, no subscribers.
    Idle,
    /// First subscriber arrived; producer being spawned.
    Starting,
    /// Producer alive and emitting frames.
    Running,
    /// Producer died or stalled; retrying with backoff.
    Degraded,
    /// Last subscriber left; producer being terminated.
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one camera for health logging.
#[derive(Clone, Debug)]
pub struct CameraHealth {
    pub id: String,
    pub label: String,
    pub state: LifecycleState,
    pub subscribers: usize,
    pub frames_published: u64,
    pub source_starts: u64,
}

pub struct SourceRegistry {
    slots: Vec<Arc<CameraSlot>>,
    index: HashMap<String, usize>,
}

impl SourceRegistry {
    /// Build the arena. Camera ids are expected to be unique (config validation
    /// enforces it); on duplicates the first entry wins.
    pub fn new(cameras: Vec<Camera>, settings: SourceSettings, queue_depth: usize) -> Self {
        let mut slots = Vec::with_capacity(cameras.len());
        let mut index = HashMap::with_capacity(cameras.len());
        for camera in cameras {
            if index.contains_key(&camera.id) {
                log::warn!("duplicate camera id '{}' ignored", camera.id);
                continue;
            }
            index.insert(camera.id.clone(), slots.len());
            slots.push(Arc::new(CameraSlot::new(camera, settings.clone(), queue_depth)));
        }
        Self { slots, index }
    }

    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.slots.iter().map(|slot| &slot.camera)
    }

    pub fn camera(&self, id: &str) -> Option<&Camera> {
        self.slot(id).map(|slot| &slot.camera)
    }

    /// The first configured camera, served on the bare `/` feed path.
    pub fn default_camera(&self) -> Option<&str> {
        self.slots.first().map(|slot| slot.camera.id.as_str())
    }

    /// Subscribe `session` to `camera_id`, starting the source on 0 → 1.
    ///
    /// A source that fails to start is retried by its supervisor; the
    /// subscription still succeeds and simply sees no frames until it recovers.
    pub async fn subscribe(
        &self,
        camera_id: &str,
        session: SessionId,
    ) -> Result<Subscription, RelayError> {
        let slot = self
            .slot(camera_id)
            .ok_or_else(|| RelayError::UnknownCamera(camera_id.to_string()))?;
        slot.acquire(session).await
    }

    /// Unsubscribe `session`, tearing the source down on 1 → 0.
    ///
    /// Returns whether the session was subscribed. Completes after teardown.
    pub async fn unsubscribe(&self, camera_id: &str, session: SessionId) -> Result<bool, RelayError> {
        let slot = self
            .slot(camera_id)
            .ok_or_else(|| RelayError::UnknownCamera(camera_id.to_string()))?;
        Ok(slot.release(session).await)
    }

    pub fn state(&self, camera_id: &str) -> Option<LifecycleState> {
        self.slot(camera_id).map(|slot| *slot.state.borrow())
    }

    pub fn watch_state(&self, camera_id: &str) -> Option<watch::Receiver<LifecycleState>> {
        self.slot(camera_id).map(|slot| slot.state.subscribe())
    }

    pub fn subscriber_count(&self, camera_id: &str) -> Option<usize> {
        self.slot(camera_id)
            .map(|slot| slot.subscribers.load(Ordering::SeqCst))
    }

    pub fn health(&self) -> Vec<CameraHealth> {
        self.slots
            .iter()
            .map(|slot| CameraHealth {
                id: slot.camera.id.clone(),
                label: slot.camera.label.clone(),
                state: *slot.state.borrow(),
                subscribers: slot.subscribers.load(Ordering::SeqCst),
                frames_published: slot.stats.published.load(Ordering::Relaxed),
                source_starts: slot.stats.starts.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Stop every active source and drop all subscribers.
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            slot.shutdown().await;
        }
    }

    fn slot(&self, camera_id: &str) -> Option<&Arc<CameraSlot>> {
        self.index.get(camera_id).map(|&i| &self.slots[i])
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        // Supervisors observe the token and stop their process on the way out.
        for slot in &self.slots {
            if let Ok(mut active) = slot.active.try_lock() {
                if let Some(source) = active.take() {
                    source.cancel.cancel();
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Arena slot
// ----------------------------------------------------------------------------

struct CameraSlot {
    camera: Camera,
    settings: SourceSettings,
    queue_depth: usize,
    active: Mutex<Option<ActiveSource>>,
    state: Arc<watch::Sender<LifecycleState>>,
    subscribers: AtomicUsize,
    stats: Arc<SlotStats>,
}

#[derive(Default)]
struct SlotStats {
    published: AtomicU64,
    starts: AtomicU64,
}

/// The live part of a camera: exists iff the camera has subscribers.
struct ActiveSource {
    hub: Arc<Hub>,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl CameraSlot {
    fn new(camera: Camera, settings: SourceSettings, queue_depth: usize) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            camera,
            settings,
            queue_depth,
            active: Mutex::new(None),
            state: Arc::new(state),
            subscribers: AtomicUsize::new(0),
            stats: Arc::new(SlotStats::default()),
        }
    }

    async fn acquire(self: &Arc<Self>, session: SessionId) -> Result<Subscription, RelayError> {
        let mut active = self.active.lock().await;
        let source = active.get_or_insert_with(|| self.launch());
        let queue = source.hub.subscribe(session)?;
        let count = source.hub.len();
        self.subscribers.store(count, Ordering::SeqCst);
        log::info!(
            "camera {}: session {} subscribed ({} viewers)",
            self.camera.id,
            session,
            count
        );
        Ok(Subscription {
            slot: Arc::clone(self),
            session,
            queue,
            released: false,
        })
    }

    fn launch(&self) -> ActiveSource {
        self.state.send_replace(LifecycleState::Starting);
        log::info!(
            "camera {} ({}): starting source {}",
            self.camera.id,
            self.camera.label,
            redact_url(&self.camera.url)
        );
        let hub = Arc::new(Hub::new(self.camera.id.clone(), self.queue_depth));
        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            camera: self.camera.clone(),
            settings: self.settings.clone(),
            hub: hub.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            cancel: cancel.clone(),
        };
        ActiveSource {
            hub,
            cancel,
            supervisor: tokio::spawn(supervisor.run()),
        }
    }

    async fn release(&self, session: SessionId) -> bool {
        let mut active = self.active.lock().await;
        let Some(source) = active.as_ref() else {
            return false;
        };
        let removed = source.hub.unsubscribe(session);
        let remaining = source.hub.len();
        self.subscribers.store(remaining, Ordering::SeqCst);
        if removed {
            log::info!(
                "camera {}: session {} unsubscribed ({} viewers)",
                self.camera.id,
                session,
                remaining
            );
        }
        if remaining == 0 {
            if let Some(source) = active.take() {
                self.teardown(source).await;
            }
        }
        removed
    }

    async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        if let Some(source) = active.take() {
            let dropped = source.hub.clear();
            self.subscribers.store(0, Ordering::SeqCst);
            if dropped > 0 {
                log::info!("camera {}: disconnected {} viewers for shutdown", self.camera.id, dropped);
            }
            self.teardown(source).await;
        }
    }

    /// Called with the lifecycle lock held.
    async fn teardown(&self, source: ActiveSource) {
        self.state.send_replace(LifecycleState::Stopping);
        source.cancel.cancel();
        if let Err(err) = source.supervisor.await {
            log::error!("camera {}: supervisor task failed: {}", self.camera.id, err);
        }
        self.state.send_replace(LifecycleState::Idle);
        log::info!("camera {}: source stopped, idle", self.camera.id);
    }
}

// ----------------------------------------------------------------------------
// Subscription
// ----------------------------------------------------------------------------

/// A viewer's handle on a camera feed.
///
/// Dropping it without calling `unsubscribe` releases the subscription in the
/// background, so every exit path of a connection gives its slot back.
pub struct Subscription {
    slot: Arc<CameraSlot>,
    session: SessionId,
    queue: Arc<FrameQueue>,
    released: bool,
}

impl Subscription {
    /// Next frame for this viewer, in publish order (older frames may be skipped).
    pub async fn recv(&self) -> Result<Frame, RelayError> {
        self.queue.pop().await.map_err(|reason| match reason {
            CloseReason::Unsubscribed => RelayError::TransportClosed,
            CloseReason::SourceDegraded => RelayError::SourceDegraded(self.slot.camera.id.clone()),
        })
    }

    pub fn camera(&self) -> &Camera {
        &self.slot.camera
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Frames skipped for this viewer by the latest-wins policy.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Release the subscription and wait for any resulting teardown.
    pub async fn unsubscribe(mut self) -> bool {
        self.released = true;
        self.slot.release(self.session).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let slot = Arc::clone(&self.slot);
        let session = self.session;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    slot.release(session).await;
                });
            }
            Err(_) => log::warn!(
                "camera {}: session {} dropped outside a runtime; release skipped",
                slot.camera.id,
                session
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Supervisor
// ----------------------------------------------------------------------------

enum PumpOutcome {
    Cancelled,
    Exited,
    Stalled,
}

struct Supervisor {
    camera: Camera,
    settings: SourceSettings,
    hub: Arc<Hub>,
    state: Arc<watch::Sender<LifecycleState>>,
    stats: Arc<SlotStats>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let id = self.camera.id.clone();
        let max_failures = self.settings.max_consecutive_failures;
        let mut failures: u32 = 0;

        loop {
            let started = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = FrameSource::start(&self.camera.url, &self.settings) => result,
            };

            match started {
                Ok(mut source) => {
                    self.stats.starts.fetch_add(1, Ordering::Relaxed);
                    self.transition(LifecycleState::Running);
                    log::info!("camera {}: source running (pid {:?})", id, source.pid());

                    let outcome = self.pump(&mut source).await;
                    source.stop().await;
                    match outcome {
                        PumpOutcome::Cancelled => return,
                        PumpOutcome::Exited => log::warn!(
                            "camera {}: source exited after {} frames",
                            id,
                            source.frames_emitted()
                        ),
                        PumpOutcome::Stalled => log::warn!(
                            "camera {}: no frame for {:?}, restarting source",
                            id,
                            self.settings.stall_timeout
                        ),
                    }
                    if source.frames_emitted() > 0 {
                        failures = 0;
                    }
                }
                Err(err) => log::warn!("{}", err.into_relay(&id)),
            }

            if self.cancel.is_cancelled() {
                return;
            }
            failures += 1;
            self.transition(LifecycleState::Degraded);

            if max_failures > 0 && failures >= max_failures {
                log::error!(
                    "camera {}: {} consecutive source failures, giving up until viewers reconnect",
                    id,
                    failures
                );
                self.hub.close();
                return;
            }

            let delay = self.settings.backoff(failures);
            log::info!(
                "camera {}: restarting source in {:?} (failure {})",
                id,
                delay,
                failures
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(&self, source: &mut FrameSource) -> PumpOutcome {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpOutcome::Cancelled,
                next = tokio::time::timeout(self.settings.stall_timeout, source.next_frame()) => next,
            };
            match next {
                Ok(Some(frame)) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    self.hub.publish(frame);
                }
                Ok(None) => return PumpOutcome::Exited,
                Err(_) => return PumpOutcome::Stalled,
            }
        }
    }

    /// Supervisor-driven transitions never override a teardown in progress.
    fn transition(&self, next: LifecycleState) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Stopping || *state == next {
                return false;
            }
            log::info!("camera {}: {} -> {}", self.camera.id, state, next);
            *state = next;
            true
        });
    }
}
