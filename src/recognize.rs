//! Recognition workers.
//!
//! `Recognizer` is the seam between the gateway and whatever identifies faces
//! in a frame. The production backend is the Python face-recognition worker,
//! reached over HTTP with a multipart upload.

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;

use crate::error::RecognitionError;

/// Placeholder the worker returns when faces were found but none matched.
const UNKNOWN_MATCH: &str = "Unknown";

/// Identifies faces in one JPEG frame. An empty list means "nobody known".
pub trait Recognizer: Send + Sync + 'static {
    fn recognize(&self, jpeg: Bytes) -> BoxFuture<'static, Result<Vec<String>, RecognitionError>>;

    fn name(&self) -> &'static str;
}

#[derive(Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    matches: Vec<String>,
}

/// `POST {base}/recognize` against the face-recognition worker.
#[derive(Clone)]
pub struct HttpRecognizer {
    endpoint: String,
    health: String,
    agent: ureq::Agent,
}

impl HttpRecognizer {
    /// `base_url` is the worker root, e.g. `http://127.0.0.1:8001`.
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let base = base_url.trim_end_matches('/');
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout.min(Duration::from_secs(5)))
            .timeout(timeout)
            .build();
        Self {
            endpoint: format!("{base}/recognize"),
            health: format!("{base}/"),
            agent,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Check the worker answers HTTP at all. Any status code counts: the
    /// worker only routes `POST /recognize`, so its root is usually a 404.
    pub fn probe(&self) -> Result<(), RecognitionError> {
        match self.agent.get(&self.health).call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => {
                log::debug!("recognition worker root answered {}", code);
                Ok(())
            }
            Err(ureq::Error::Transport(transport)) => Err(classify_transport(transport)),
        }
    }

    fn recognize_blocking(&self, jpeg: &[u8]) -> Result<Vec<String>, RecognitionError> {
        let boundary = multipart_boundary();
        let body = multipart_body(&boundary, "file", "frame.jpg", "image/jpeg", jpeg);
        let result = self
            .agent
            .post(&self.endpoint)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send_bytes(&body);

        let response = match result {
            Ok(response) => response,
            // The worker answers 400 when no face is present in the frame.
            Err(ureq::Error::Status(400, _)) => return Ok(Vec::new()),
            Err(ureq::Error::Status(code, _)) => return Err(RecognitionError::Status(code)),
            Err(ureq::Error::Transport(transport)) => {
                return Err(classify_transport(transport));
            }
        };
        let text = response
            .into_string()
            .map_err(|err| RecognitionError::Decode(err.to_string()))?;
        parse_matches(&text)
    }
}

impl Recognizer for HttpRecognizer {
    fn recognize(&self, jpeg: Bytes) -> BoxFuture<'static, Result<Vec<String>, RecognitionError>> {
        let this = self.clone();
        async move {
            tokio::task::spawn_blocking(move || this.recognize_blocking(&jpeg))
                .await
                .map_err(|err| RecognitionError::Task(err.to_string()))?
        }
        .boxed()
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn classify_transport(transport: ureq::Transport) -> RecognitionError {
    let message = transport.to_string();
    if matches!(transport.kind(), ureq::ErrorKind::Io) && message.contains("timed out") {
        RecognitionError::Timeout
    } else {
        RecognitionError::Transport(message)
    }
}

/// Parse `{"matches": [...]}`, dropping the worker's "Unknown" placeholder.
pub fn parse_matches(body: &str) -> Result<Vec<String>, RecognitionError> {
    let parsed: RecognizeResponse =
        serde_json::from_str(body).map_err(|err| RecognitionError::Decode(err.to_string()))?;
    Ok(parsed
        .matches
        .into_iter()
        .filter(|name| !name.is_empty() && name != UNKNOWN_MATCH)
        .collect())
}

fn multipart_boundary() -> String {
    let nonce: [u8; 12] = rand::random();
    format!("camgate-{}", hex::encode(nonce))
}

fn multipart_body(
    boundary: &str,
    field: &str,
    filename: &str,
    content_type: &str,
    payload: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
