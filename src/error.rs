//! Error taxonomy for the relay.
//!
//! Only configuration problems are fatal. Everything here is recovered at the
//! connection or lifecycle level and surfaced to viewers as a stalled feed, a
//! closed socket, or a missing `faces` event.

use thiserror::Error;

/// Errors surfaced by the relay core to the transport layer.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("camera '{0}' is not configured")]
    UnknownCamera(String),

    /// The transcoder could not be started. Not fatal to the service.
    #[error("source unavailable for camera '{camera}': {reason}")]
    SourceUnavailable { camera: String, reason: SourceError },

    /// The transcoder kept dying and the supervisor gave up on it.
    #[error("source degraded for camera '{0}'")]
    SourceDegraded(String),

    /// Routine: the viewer went away or the subscription was released.
    #[error("transport closed")]
    TransportClosed,

    #[error("recognition unavailable: {0}")]
    RecognitionUnavailable(#[from] RecognitionError),
}

/// Failures starting or running a frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to spawn transcoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder exited during startup ({0})")]
    ExitedEarly(String),

    #[error("transcoder stdout was not captured")]
    MissingStdout,

    #[error("unsupported source url '{0}'")]
    UnsupportedUrl(String),

    #[error("synthetic source '{0}' refused to start")]
    SyntheticRefused(String),
}

impl SourceError {
    pub fn into_relay(self, camera: &str) -> RelayError {
        RelayError::SourceUnavailable {
            camera: camera.to_string(),
            reason: self,
        }
    }
}

/// Failures talking to the recognition worker.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("recognition worker unreachable: {0}")]
    Transport(String),

    #[error("recognition worker returned HTTP {0}")]
    Status(u16),

    #[error("recognition worker response was not understood: {0}")]
    Decode(String),

    #[error("recognition request timed out")]
    Timeout,

    #[error("recognition task failed: {0}")]
    Task(String),
}
