//! WebSocket transport driver.
//!
//! Peers connect to `/transport`; every binary frame carries one encoded
//! envelope in each direction.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use multiwire_core::{
    ConnectionReporter, DriverError, InboundFrame, InboundSender, PeerId, TransportDriver,
    TransportKind,
};
use multiwire_registry::drivers::PeerSet;

/// Driver serving WebSocket peers.
pub struct WebSocketDriver {
    peers: PeerSet,
    inbound: InboundSender,
}

impl WebSocketDriver {
    /// Create the driver. Mount [`WebSocketDriver::router`] to accept peers.
    #[must_use]
    pub fn new(reporter: ConnectionReporter, inbound: InboundSender) -> Arc<Self> {
        Arc::new(Self {
            peers: PeerSet::new(reporter),
            inbound,
        })
    }

    /// Number of attached peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Router accepting peers at `/transport`.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/transport", get(transport_handler))
            .with_state(Arc::clone(self))
    }
}

#[async_trait]
impl TransportDriver for WebSocketDriver {
    fn kind(&self) -> TransportKind {
        self.peers.kind()
    }

    async fn send(&self, frame: Bytes) -> Result<(), DriverError> {
        self.peers.broadcast(&frame).map(|_| ())
    }

    async fn send_to_peer(&self, peer: PeerId, frame: Bytes) -> Result<(), DriverError> {
        self.peers.send_to(peer, &frame)
    }
}

async fn transport_handler(
    ws: WebSocketUpgrade,
    State(driver): State<Arc<WebSocketDriver>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, driver))
}

async fn handle_socket(socket: WebSocket, driver: Arc<WebSocketDriver>) {
    let (mut sender, mut receiver) = socket.split();
    let (peer_id, mut rx) = driver.peers.attach("websocket peer");

    // Spawn task to forward queued frames to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sender.send(Message::Binary(frame)).await {
                tracing::error!("WebSocket write failed: {e}");
                break;
            }
        }
    });

    // Handle incoming frames
    while let Some(msg) = receiver.next().await {
        let bytes = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => {
                // Not an envelope; forwarded so the peer receives a parse error.
                Bytes::copy_from_slice(text.as_str().as_bytes())
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        if driver
            .inbound
            .send(InboundFrame {
                transport: driver.peers.kind(),
                peer: Some(peer_id),
                bytes,
            })
            .is_err()
        {
            break;
        }
    }

    send_task.abort();
    driver.peers.detach(peer_id);
    tracing::info!(%peer_id, "WebSocket peer disconnected");
}
