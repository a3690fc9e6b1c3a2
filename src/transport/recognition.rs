//! Recognition channel.
//!
//! Clients push frames (`{"event":"frame","data":...}` or a binary message) and
//! receive `{"event":"faces","data":[...]}` for the frames the gateway accepted.
//! Malformed input is logged and ignored; the connection stays open.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::ToSocketAddrs;
use tokio_websockets::{CloseCode, Message};

use super::wire::{self, ClientEvent, ServerEvent, WireError};
use super::{serve, Connection, ServerHandle};
use crate::config::SessionSettings;
use crate::gateway::{GatewaySession, RecognitionGateway, Submit};
use crate::session::{Channel, ViewerSession};

pub async fn spawn_recognition_server(
    addr: impl ToSocketAddrs,
    gateway: Arc<RecognitionGateway>,
    settings: SessionSettings,
) -> io::Result<ServerHandle> {
    serve(addr, "recognition", move |conn| {
        handle_client(conn, Arc::clone(&gateway), settings.clone())
    })
    .await
}

async fn handle_client(conn: Connection, gateway: Arc<RecognitionGateway>, settings: SessionSettings) {
    let mut session = ViewerSession::new(Channel::Recognition, Some(conn.peer));
    let mut recognition = gateway.open(session.id);
    let (mut sink, mut stream) = conn.ws.split();
    log::info!("recognition {} connected from {}", session.id, conn.peer);

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    let mut accepted: u64 = 0;
    let mut dropped: u64 = 0;

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
                    match submit_message(&recognition, message) {
                        Ok(Some(Submit::Accepted(_))) => accepted += 1,
                        Ok(Some(Submit::Dropped)) => dropped += 1,
                        Ok(None) => {}
                        Err(err) => log::warn!("recognition {}: ignoring message: {}", session.id, err),
                    }
                }
                Some(Err(err)) => {
                    log::debug!("recognition {}: read error: {}", session.id, err);
                    break None;
                }
                None => break None,
            },
            result = recognition.recv() => {
                let Some(result) = result else { break None };
                let event = ServerEvent::Faces(result.matches);
                let text = match wire::encode_server_event(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        log::error!("recognition {}: encode failed: {}", session.id, err);
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::text(text)).await {
                    log::debug!("recognition {}: send failed: {}", session.id, err);
                    break None;
                }
            }
            _ = ping.tick() => {
                if session.is_idle(settings.idle_timeout) {
                    log::info!("recognition {}: idle for {:?}, closing", session.id, session.idle_for());
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
    drop(recognition);
    log::info!(
        "recognition {} closed after {:?}: {} frames submitted, {} dropped",
        session.id,
        session.connected_for(),
        accepted,
        dropped
    );
}

/// Offer a client message to the gateway. Control frames yield `Ok(None)`.
fn submit_message(session: &GatewaySession, message: Message) -> Result<Option<Submit>, WireError> {
    let jpeg = if let Some(text) = message.as_text() {
        let ClientEvent::Frame(data) = wire::parse_client_event(text)?;
        wire::decode_image(&data)?
    } else if message.is_binary() {
        wire::check_image(Bytes::copy_from_slice(&message.into_payload()))?
    } else {
        return Ok(None);
    };
    Ok(Some(session.submit(jpeg)))
}
