//! WebSocket channel that mirrors snapshot history and connection state to UIs.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use multiwire_core::SnapshotEvent;
use multiwire_registry::Dispatcher;
use tokio::sync::{broadcast::error::RecvError, mpsc};

use crate::protocol::{SnapshotView, UiClientMessage, UiServerMessage, snapshot_views};

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ui_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, dispatcher))
}

/// Answer one client message. Returns the reply for the requesting client,
/// if any; store changes reach every client through the event stream.
#[must_use]
pub fn handle_client_message(
    dispatcher: &Dispatcher,
    msg: UiClientMessage,
) -> Option<UiServerMessage> {
    match msg {
        UiClientMessage::List => Some(UiServerMessage::Snapshots {
            snapshots: snapshot_views(&dispatcher.snapshots().get_all()),
        }),
        UiClientMessage::Clear => {
            dispatcher.snapshots().clear();
            None
        }
        UiClientMessage::Ping => Some(UiServerMessage::Pong),
    }
}

async fn handle_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<UiServerMessage>();

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let (history, mut snapshot_rx) = dispatcher.snapshots().subscribe_with_history();
    let mut connection_rx = dispatcher.connections().subscribe();
    let _ = tx.send(UiServerMessage::Snapshots {
        snapshots: snapshot_views(&history),
    });
    let _ = tx.send(UiServerMessage::Status {
        transports: dispatcher.get_status(),
    });

    // Forward store and connection changes
    let events_task = {
        let tx = tx.clone();
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    event = snapshot_rx.recv() => match event {
                        Ok(SnapshotEvent::Recorded(snapshot)) => UiServerMessage::Snapshot {
                            snapshot: SnapshotView::from(&snapshot),
                        },
                        Ok(SnapshotEvent::Cleared) => UiServerMessage::Cleared,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "UI client lagged, resending snapshot list");
                            UiServerMessage::Snapshots {
                                snapshots: snapshot_views(&dispatcher.snapshots().get_all()),
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = connection_rx.recv() => match event {
                        Ok(event) => UiServerMessage::from(&event),
                        Err(RecvError::Lagged(_)) => UiServerMessage::Status {
                            transports: dispatcher.get_status(),
                        },
                        Err(RecvError::Closed) => break,
                    },
                };
                if tx.send(msg).is_err() {
                    break;
                }
            }
        })
    };

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg: UiClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid UI message: {e}");
                let _ = tx.send(UiServerMessage::Error {
                    message: format!("Invalid message: {e}"),
                });
                continue;
            }
        };

        if let Some(reply) = handle_client_message(&dispatcher, client_msg) {
            let _ = tx.send(reply);
        }
    }

    events_task.abort();
    send_task.abort();
    tracing::debug!("UI client disconnected");
}

/// Create the UI notification router, served at `/ui`.
#[must_use]
pub fn create_ui_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/ui", get(ui_handler))
        .with_state(dispatcher)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use multiwire_core::{
        ConnectionTracker, Envelope, SnapshotStore, TransportDriver, TransportKind,
        inbound_channel,
    };
    use multiwire_registry::drivers::ChannelDriver;
    use serde_json::{Value, json};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as ClientMessage,
    };

    use super::*;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn open(dispatcher: &Arc<Dispatcher>) -> Client {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_ui_router(Arc::clone(dispatcher));
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let (client, _) = connect_async(format!("ws://{addr}/ui")).await.unwrap();
        client
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(std::time::Duration::from_secs(5), client.next())
                .await
                .expect("message within timeout")
                .unwrap()
                .unwrap();
            if let ClientMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn dispatcher() -> (Arc<Dispatcher>, Arc<ChannelDriver>) {
        let tracker = Arc::new(ConnectionTracker::new());
        let (tx, _rx) = inbound_channel();
        let driver = Arc::new(ChannelDriver::new(tracker.reporter(TransportKind::Tcp), tx));
        let mut dispatcher = Dispatcher::new(tracker, Arc::new(SnapshotStore::new(4)));
        dispatcher
            .register(Arc::clone(&driver) as Arc<dyn TransportDriver>)
            .unwrap();
        (Arc::new(dispatcher), driver)
    }

    #[tokio::test]
    async fn test_list_returns_history() {
        let (dispatcher, driver) = dispatcher();
        let _peer = driver.connect("device");
        let sent = dispatcher
            .send_to(TransportKind::Tcp, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let reply = handle_client_message(&dispatcher, UiClientMessage::List).unwrap();
        let UiServerMessage::Snapshots { snapshots } = reply else {
            panic!("Wrong message type");
        };
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].envelope.id, sent.id());
    }

    #[tokio::test]
    async fn test_clear_pushes_event_to_subscribers() {
        let (dispatcher, _driver) = dispatcher();
        dispatcher.snapshots().record(
            TransportKind::Tcp,
            multiwire_core::Direction::Inbound,
            Envelope::create_error(None, Some("x")),
        );
        let mut rx = dispatcher.snapshots().subscribe();

        assert!(handle_client_message(&dispatcher, UiClientMessage::Clear).is_none());
        assert!(dispatcher.snapshots().is_empty());
        assert_eq!(rx.recv().await.unwrap(), SnapshotEvent::Cleared);
    }

    #[tokio::test]
    async fn test_socket_sends_history_and_status_on_connect() {
        let (dispatcher, _driver) = dispatcher();
        dispatcher.snapshots().record(
            TransportKind::Tcp,
            multiwire_core::Direction::Inbound,
            Envelope::create_error(None, Some("earlier")),
        );

        let mut client = open(&dispatcher).await;

        let history = next_json(&mut client).await;
        assert_eq!(history["type"], "snapshots");
        assert_eq!(history["snapshots"].as_array().unwrap().len(), 1);
        assert_eq!(history["snapshots"][0]["direction"], "inbound");

        let status = next_json(&mut client).await;
        assert_eq!(status, json!({"type": "status", "transports": {"tcp": false}}));
    }

    #[tokio::test]
    async fn test_socket_forwards_events_and_answers_clients() {
        let (dispatcher, driver) = dispatcher();
        let mut client = open(&dispatcher).await;
        assert_eq!(next_json(&mut client).await["type"], "snapshots");
        assert_eq!(next_json(&mut client).await["type"], "status");

        let _peer = driver.connect("device");
        let connection = next_json(&mut client).await;
        assert_eq!(
            connection,
            json!({"type": "connection", "transport": "tcp", "connected": true, "peer": "device"})
        );

        let sent = dispatcher
            .send_to(TransportKind::Tcp, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let snapshot = next_json(&mut client).await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["snapshot"]["direction"], "outbound");
        assert_eq!(snapshot["snapshot"]["envelope"]["id"], sent.id());

        dispatcher.snapshots().clear();
        assert_eq!(next_json(&mut client).await, json!({"type": "cleared"}));

        client
            .send(ClientMessage::Text(json!({"type": "ping"}).to_string()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut client).await, json!({"type": "pong"}));

        client
            .send(ClientMessage::Text("not json".to_string()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut client).await["type"], "error");
    }

    #[test]
    fn test_ping() {
        let (dispatcher, _driver) = dispatcher();
        assert!(matches!(
            handle_client_message(&dispatcher, UiClientMessage::Ping),
            Some(UiServerMessage::Pong)
        ));
    }
}
