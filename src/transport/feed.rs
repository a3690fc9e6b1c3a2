//! Camera feed channel.
//!
//! The request path picks the camera (`/<id>`, `/feed/<id>`, or `/` for the
//! first configured camera). The connection subscribes on connect and releases
//! its subscription on every exit path.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::ToSocketAddrs;
use tokio_websockets::{CloseCode, Message};

use super::wire::frame_data_uri;
use super::{serve, Connection, ServerHandle};
use crate::config::SessionSettings;
use crate::error::RelayError;
use crate::registry::SourceRegistry;
use crate::session::{Channel, ViewerSession};

pub async fn spawn_feed_server(
    addr: impl ToSocketAddrs,
    registry: Arc<SourceRegistry>,
    settings: SessionSettings,
) -> io::Result<ServerHandle> {
    serve(addr, "feed", move |conn| {
        handle_viewer(conn, Arc::clone(&registry), settings.clone())
    })
    .await
}

/// Map a request path to a configured camera id.
pub fn resolve_camera<'a>(registry: &'a SourceRegistry, path: &str) -> Option<&'a str> {
    let trimmed = path.trim_matches('/');
    let id = trimmed.strip_prefix("feed/").unwrap_or(trimmed);
    if id.is_empty() || id == "feed" {
        return registry.default_camera();
    }
    registry
        .camera(&id.to_lowercase())
        .map(|camera| camera.id.as_str())
}

async fn handle_viewer(conn: Connection, registry: Arc<SourceRegistry>, settings: SessionSettings) {
    let mut session = ViewerSession::new(Channel::Feed, Some(conn.peer));
    let (mut sink, mut stream) = conn.ws.split();

    let Some(camera_id) = resolve_camera(&registry, &conn.path) else {
        log::info!(
            "feed {} from {}: unknown camera path '{}'",
            session.id,
            conn.peer,
            conn.path
        );
        let _ = sink
            .send(Message::close(Some(CloseCode::POLICY_VIOLATION), "unknown camera"))
            .await;
        return;
    };

    let subscription = match registry.subscribe(camera_id, session.id).await {
        Ok(subscription) => subscription,
        Err(err) => {
            log::warn!("feed {}: subscribe failed: {}", session.id, err);
            let _ = sink
                .send(Message::close(
                    Some(CloseCode::INTERNAL_SERVER_ERROR),
                    close_reason(&err),
                ))
                .await;
            return;
        }
    };
    session.camera = Some(camera_id.to_string());
    log::info!(
        "feed {} from {} watching {} ({})",
        session.id,
        conn.peer,
        camera_id,
        subscription.camera().label
    );

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    let mut sent: u64 = 0;

    let closing = loop {
        tokio::select! {
            biased;
            _ = conn.shutdown.cancelled() => {
                break Some((CloseCode::GOING_AWAY, "server shutting down"));
            }
            incoming = stream.next() => match incoming {
                Some(Ok(message)) => {
                    session.touch();
                    if message.is_close() {
                        break None;
                    }
                }
                Some(Err(err)) => {
                    log::debug!("feed {}: read error: {}", session.id, err);
                    break None;
                }
                None => break None,
            },
            frame = subscription.recv() => match frame {
                Ok(frame) => {
                    if let Err(err) = sink.send(Message::text(frame_data_uri(frame.data()))).await {
                        log::debug!("feed {}: send failed: {}", session.id, err);
                        break None;
                    }
                    sent += 1;
                }
                Err(err) => {
                    log::info!("feed {}: {}", session.id, err);
                    break Some((CloseCode::INTERNAL_SERVER_ERROR, close_reason(&err)));
                }
            },
            _ = ping.tick() => {
                if session.is_idle(settings.idle_timeout) {
                    log::info!("feed {}: idle for {:?}, closing", session.id, session.idle_for());
                    break Some((CloseCode::NORMAL_CLOSURE, "idle timeout"));
                }
                if sink.send(Message::ping(Bytes::new())).await.is_err() {
                    break None;
                }
            }
        }
    };

    if let Some((code, reason)) = closing {
        let _ = sink.send(Message::close(Some(code), reason)).await;
    }
    let dropped = subscription.dropped();
    subscription.unsubscribe().await;
    log::info!(
        "feed {} closed after {:?}: {} frames sent, {} skipped",
        session.id,
        session.connected_for(),
        sent,
        dropped
    );
}

fn close_reason(err: &RelayError) -> &'static str {
    match err {
        RelayError::SourceDegraded(_) => "source degraded",
        RelayError::UnknownCamera(_) => "unknown camera",
        RelayError::TransportClosed => "server shutting down",
        _ => "source unavailable",
    }
}
