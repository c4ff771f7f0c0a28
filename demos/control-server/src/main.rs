//! Multi-transport control server.
//!
//! Run with: cargo run -p control-server-demo
//!
//! - `POST /api/send`, `POST /api/send-all`, `GET /api/status`, `/api/snapshots`
//! - `GET /ui` - snapshot/connection notifications (WebSocket, JSON)
//! - `GET /transport` - WebSocket transport peers (binary envelopes)
//! - TCP transport peers on `MULTIWIRE_TCP_ADDR` (length-prefixed envelopes)

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use multiwire_core::{
    ConnectionTracker, Envelope, EnvelopeType, SnapshotStore, TransportDriver, TransportKind,
    inbound_channel,
};
use multiwire_registry::{Dispatcher, drivers::TcpDriver};
use multiwire_transport::{WebSocketDriver, create_router};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(?config, "Starting control server");

    let connections = Arc::new(ConnectionTracker::new());
    let snapshots = Arc::new(SnapshotStore::new(config.snapshot_capacity));
    let (inbound_tx, inbound_rx) = inbound_channel();

    let websocket = WebSocketDriver::new(
        connections.reporter(TransportKind::WebSocket),
        inbound_tx.clone(),
    );
    let tcp = TcpDriver::bind(
        config.tcp_addr,
        connections.reporter(TransportKind::Tcp),
        inbound_tx,
    )
    .await
    .with_context(|| format!("failed to bind TCP transport on {}", config.tcp_addr))?;

    let mut dispatcher = Dispatcher::new(Arc::clone(&connections), snapshots);
    dispatcher.register(Arc::clone(&websocket) as Arc<dyn TransportDriver>)?;
    dispatcher.register(Arc::new(tcp))?;
    let dispatcher = Arc::new(dispatcher);

    let (unsolicited_tx, unsolicited_rx) = mpsc::unbounded_channel();
    let _pump = Arc::clone(&dispatcher).spawn_inbound_pump(inbound_rx, Some(unsolicited_tx));
    let _responder = tokio::spawn(answer_requests(Arc::clone(&dispatcher), unsolicited_rx));
    let _greeter = tokio::spawn(greet_peers(
        Arc::clone(&dispatcher),
        config.request_timeout,
    ));

    let app = create_router(dispatcher, Some(&websocket));

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP on {}", config.http_addr))?;
    tracing::info!("Server listening on http://{}", config.http_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Acknowledge every request a peer sends us.
async fn answer_requests(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::UnboundedReceiver<(TransportKind, Envelope)>,
) {
    while let Some((transport, envelope)) = rx.recv().await {
        if envelope.kind() != EnvelopeType::Request {
            continue;
        }
        if let Err(e) = dispatcher
            .respond(transport, &envelope, Bytes::from_static(b"ack"))
            .await
        {
            tracing::warn!(%transport, id = envelope.id(), "Failed to acknowledge request: {e}");
        }
    }
}

/// Send a greeting request whenever a transport comes up and log the reply.
async fn greet_peers(dispatcher: Arc<Dispatcher>, timeout: Duration) {
    let mut events = dispatcher.connections().subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) if event.connected => event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            match dispatcher
                .request(event.transport, Bytes::from_static(b"hello"), timeout)
                .await
            {
                Ok(reply) => tracing::info!(
                    transport = %event.transport,
                    reply_type = ?reply.kind(),
                    "Peer answered greeting"
                ),
                Err(e) => tracing::info!(transport = %event.transport, "Greeting unanswered: {e}"),
            }
        });
    }
}
