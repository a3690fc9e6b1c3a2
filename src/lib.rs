//! camgate: live camera relay and recognition-event gateway.
//!
//! Browser viewers watch lab cameras over a WebSocket feed channel and push
//! frames to a face-recognition worker over a second WebSocket channel.
//!
//! # Architecture
//!
//! - One transcoder process per camera, shared by every viewer of that camera.
//!   It runs exactly while the camera has at least one subscriber.
//! - A supervisor task owns each running process, restarts it with backoff when
//!   it dies or stalls, and gives up after repeated failures.
//! - Per-viewer bounded queues keep only the newest frames, so a slow viewer
//!   never holds up the source or other viewers.
//! - Recognition keeps at most one request in flight per session and routes
//!   each result back only to the session that sent the frame.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (transcoder subprocess, synthetic `stub://`)
//! - `frame`: frames and per-subscriber latest-wins queues
//! - `hub`: fan-out of one camera's frames to its subscribers
//! - `registry`: per-camera lifecycle state machine and subscriptions
//! - `gateway` / `recognize`: recognition sessions and worker backends
//! - `transport`: the feed and recognition WebSocket servers
//! - `config`: file + environment configuration

pub mod config;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod hub;
pub mod ingest;
pub mod recognize;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::RelayConfig;
pub use error::{RecognitionError, RelayError, SourceError};
pub use frame::{CloseReason, Frame, FrameQueue};
pub use gateway::{GatewaySession, GatewaySettings, RecognitionGateway, RecognitionResult, RequestTag, Submit};
pub use hub::Hub;
pub use ingest::{FrameSource, SourceSettings};
pub use recognize::{HttpRecognizer, Recognizer};
pub use registry::{Camera, CameraHealth, LifecycleState, SourceRegistry, Subscription};
pub use session::SessionId;
pub use transport::{spawn_feed_server, spawn_recognition_server, ServerHandle};
