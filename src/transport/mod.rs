//! WebSocket transport for the two viewer channels.
//!
//! - `feed`: one camera's MJPEG frames as base64 data URIs
//! - `recognition`: client frames in, `faces` events out
//!
//! Both servers share one accept loop. Each connection runs in its own task
//! under the server's `TaskTracker`, and `ServerHandle::stop` cancels and joins
//! all of them.

pub mod feed;
pub mod recognition;
pub mod wire;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_websockets::{ServerBuilder, WebSocketStream};

pub use feed::spawn_feed_server;
pub use recognition::spawn_recognition_server;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type WsStream = WebSocketStream<TcpStream>;

/// One upgraded connection handed to a channel handler.
pub(crate) struct Connection {
    pub ws: WsStream,
    /// Request path, e.g. `/lab1`.
    pub path: String,
    pub peer: SocketAddr,
    /// Cancelled when the server stops.
    pub shutdown: CancellationToken,
}

/// A running WebSocket server.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    name: &'static str,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of open connections.
    pub fn connections(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting, close every connection and wait for their tasks.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.accept.await {
            log::error!("{} accept loop failed: {}", self.name, err);
        }
        self.tracker.close();
        self.tracker.wait().await;
        log::info!("{} server on {} stopped", self.name, self.addr);
    }
}

pub(crate) async fn serve<A, H, Fut>(addr: A, name: &'static str, handler: H) -> io::Result<ServerHandle>
where
    A: ToSocketAddrs,
    H: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    log::info!("{} server listening on ws://{}", name, local_addr);

    let accept = tokio::spawn(accept_loop(
        listener,
        name,
        Arc::new(handler),
        cancel.clone(),
        tracker.clone(),
    ));

    Ok(ServerHandle {
        addr: local_addr,
        name,
        cancel,
        tracker,
        accept,
    })
}

async fn accept_loop<H, Fut>(
    listener: TcpListener,
    name: &'static str,
    handler: Arc<H>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) where
    H: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("{} accept error: {}", name, err);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let shutdown = cancel.child_token();
        // Handshake and handler both run off the accept loop.
        tracker.spawn(async move {
            let handshake =
                tokio::time::timeout(HANDSHAKE_TIMEOUT, ServerBuilder::new().accept(tcp)).await;
            let (request, ws) = match handshake {
                Ok(Ok(upgraded)) => upgraded,
                Ok(Err(err)) => {
                    log::warn!("{} handshake failed for {}: {}", name, peer, err);
                    return;
                }
                Err(_) => {
                    log::warn!("{} handshake timed out for {}", name, peer);
                    return;
                }
            };
            handler(Connection {
                ws,
                path: request.uri().path().to_string(),
                peer,
                shutdown,
            })
            .await;
        });
    }
    log::debug!("{} accept loop exiting", name);
}
