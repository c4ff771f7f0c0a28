//! HTTP control API.
//!
//! Routes:
//! - `POST /api/send` - targeted send
//! - `POST /api/send-all` - broadcast
//! - `GET /api/status` - connection flags
//! - `GET /api/snapshots`, `DELETE /api/snapshots` - snapshot history

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use multiwire_core::TransportKind;
use multiwire_registry::{DispatchError, Dispatcher};

use crate::protocol::{
    ErrorBody, SendAllRequest, SendAllResponse, SendToRequest, SendToResponse, SnapshotView,
    snapshot_views,
};

/// Control API error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{error}")]
    SendFailed { transport: TransportKind, error: String },
    #[error("{0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn from_dispatch(transport: TransportKind, err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidArgument(_)
            | DispatchError::TransportNotRegistered(_)
            | DispatchError::MalformedEnvelope(_) => Self::BadRequest(err.to_string()),
            DispatchError::TransportNotConnected(_) | DispatchError::TransportSendFailed { .. } => {
                Self::SendFailed {
                    transport,
                    error: err.to_string(),
                }
            }
            DispatchError::ResponseTimeout(_) => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(error) => {
                tracing::warn!("Rejected control request: {error}");
                (StatusCode::BAD_REQUEST, Json(ErrorBody { error })).into_response()
            }
            Self::SendFailed { transport, error } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SendToResponse {
                    success: false,
                    transport: transport.to_string(),
                    envelope_id: None,
                    error: Some(error),
                }),
            )
                .into_response(),
            Self::Internal(error) => {
                tracing::error!("Control request failed: {error}");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error })).into_response()
            }
        }
    }
}

fn parse_transport(name: &str) -> Result<TransportKind, ApiError> {
    name.parse()
        .map_err(|e: multiwire_core::UnknownTransportKind| ApiError::BadRequest(e.to_string()))
}

fn ensure_message(message: &str) -> Result<(), ApiError> {
    if message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    Ok(())
}

async fn send_to(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: Result<Json<SendToRequest>, JsonRejection>,
) -> Result<Json<SendToResponse>, ApiError> {
    let Json(req) = body?;
    let transport = parse_transport(&req.transport)?;
    ensure_message(&req.message)?;

    let envelope = dispatcher
        .send_to(transport, Bytes::from(req.message))
        .await
        .map_err(|e| ApiError::from_dispatch(transport, e))?;

    Ok(Json(SendToResponse {
        success: true,
        transport: transport.to_string(),
        envelope_id: Some(envelope.id().to_string()),
        error: None,
    }))
}

async fn send_all(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: Result<Json<SendAllRequest>, JsonRejection>,
) -> Result<Json<SendAllResponse>, ApiError> {
    let Json(req) = body?;
    ensure_message(&req.message)?;
    let filter = req
        .transports
        .as_deref()
        .map(|names| names.iter().map(|n| parse_transport(n)).collect::<Result<Vec<_>, _>>())
        .transpose()?;

    let report = dispatcher
        .send_all(Bytes::from(req.message), filter.as_deref())
        .await
        .map_err(|e| match e {
            DispatchError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        })?;

    Ok(Json(SendAllResponse::from(&report)))
}

async fn status(
    State(dispatcher): State<Arc<Dispatcher>>,
) -> Json<std::collections::BTreeMap<TransportKind, bool>> {
    Json(dispatcher.get_status())
}

async fn list_snapshots(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Vec<SnapshotView>> {
    Json(snapshot_views(&dispatcher.snapshots().get_all()))
}

async fn clear_snapshots(State(dispatcher): State<Arc<Dispatcher>>) -> StatusCode {
    dispatcher.snapshots().clear();
    StatusCode::NO_CONTENT
}

/// Create the control router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_control_router(Arc::clone(&dispatcher)));
/// ```
#[must_use]
pub fn create_control_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/api/send", post(send_to))
        .route("/api/send-all", post(send_all))
        .route("/api/status", get(status))
        .route("/api/snapshots", get(list_snapshots).delete(clear_snapshots))
        .with_state(dispatcher)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, header},
    };
    use multiwire_core::{ConnectionTracker, SnapshotStore, TransportDriver, inbound_channel};
    use multiwire_registry::drivers::{ChannelDriver, ChannelPeer};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    struct Fixture {
        router: Router,
        dispatcher: Arc<Dispatcher>,
        ws: Arc<ChannelDriver>,
        tcp: Arc<ChannelDriver>,
    }

    fn fixture() -> Fixture {
        let tracker = Arc::new(ConnectionTracker::new());
        let store = Arc::new(SnapshotStore::new(8));
        let (tx, _rx) = inbound_channel();
        let ws = Arc::new(ChannelDriver::new(
            tracker.reporter(TransportKind::WebSocket),
            tx.clone(),
        ));
        let tcp = Arc::new(ChannelDriver::new(tracker.reporter(TransportKind::Tcp), tx));

        let mut dispatcher = Dispatcher::new(tracker, store);
        dispatcher.register(Arc::clone(&ws) as Arc<dyn TransportDriver>).unwrap();
        dispatcher.register(Arc::clone(&tcp) as Arc<dyn TransportDriver>).unwrap();
        let dispatcher = Arc::new(dispatcher);

        Fixture {
            router: create_control_router(Arc::clone(&dispatcher)),
            dispatcher,
            ws,
            tcp,
        }
    }

    async fn call(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn connect(driver: &ChannelDriver) -> ChannelPeer {
        driver.connect("test peer")
    }

    #[tokio::test]
    async fn test_send_to_connected() {
        let f = fixture();
        let mut peer = connect(&f.tcp);

        let (status, body) = call(
            &f.router,
            Method::POST,
            "/api/send",
            Some(json!({"transport": "tcp", "message": "reboot"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["transport"], "tcp");
        let frame = peer.try_recv().unwrap();
        let envelope = multiwire_core::Envelope::parse(&frame).unwrap();
        assert_eq!(body["envelopeId"], envelope.id());
        assert_eq!(envelope.payload().as_ref(), b"reboot");
    }

    #[tokio::test]
    async fn test_send_to_disconnected_is_500() {
        let f = fixture();
        let (status, body) = call(
            &f.router,
            Method::POST,
            "/api/send",
            Some(json!({"transport": "tcp", "message": "reboot"})),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["transport"], "tcp");
        assert!(body["error"].as_str().unwrap().contains("not connected"));
        assert!(f.dispatcher.snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_input_is_400() {
        let f = fixture();
        let _peer = connect(&f.tcp);

        for body in [
            json!({"transport": "tcp", "message": ""}),
            json!({"transport": "serial", "message": "x"}),
            json!({"transport": "udp", "message": "x"}),
            json!({"message": "missing transport"}),
        ] {
            let (status, reply) = call(&f.router, Method::POST, "/api/send", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(reply["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_send_all_reports_each_transport() {
        let f = fixture();
        let _peer = connect(&f.ws);

        let (status, body) = call(
            &f.router,
            Method::POST,
            "/api/send-all",
            Some(json!({"message": "hello all"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["transport"], "websocket");
        assert_eq!(results[0]["success"], true);
        assert_eq!(results[1]["transport"], "tcp");
        assert_eq!(results[1]["success"], false);
        assert!(results[1]["error"].as_str().unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn test_send_all_rejects_unknown_filter() {
        let f = fixture();
        let (status, _) = call(
            &f.router,
            Method::POST,
            "/api/send-all",
            Some(json!({"message": "x", "transports": ["pigeon"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_send_all_reports_unregistered_filter_kind() {
        let f = fixture();
        let mut peer = connect(&f.tcp);

        let (status, body) = call(
            &f.router,
            Method::POST,
            "/api/send-all",
            Some(json!({"message": "x", "transports": ["udp"]})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["transport"], "udp");
        assert_eq!(results[0]["success"], false);
        assert!(results[0]["error"].as_str().unwrap().contains("not registered"));
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_status_and_snapshots() {
        let f = fixture();
        let _peer = connect(&f.ws);

        let (status, body) = call(&f.router, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"websocket": true, "tcp": false}));

        f.dispatcher
            .send_to(TransportKind::WebSocket, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let (_, body) = call(&f.router, Method::GET, "/api/snapshots", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["direction"], "outbound");

        let (status, _) = call(&f.router, Method::DELETE, "/api/snapshots", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(f.dispatcher.snapshots().is_empty());
    }
}
