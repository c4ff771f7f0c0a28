//! HTTP and WebSocket surfaces for multiwire.
//!
//! Provides:
//! - Control/UI wire protocol (JSON + base64)
//! - HTTP control API (feature: http)
//! - UI notification WebSocket (feature: http)
//! - WebSocket transport driver (feature: http)

pub mod protocol;

#[cfg(feature = "http")]
pub mod control;

#[cfg(feature = "http")]
pub mod ui;

#[cfg(feature = "http")]
pub mod websocket;

pub use protocol::{UiClientMessage, UiServerMessage};

#[cfg(feature = "http")]
pub use websocket::WebSocketDriver;

#[cfg(feature = "http")]
use std::sync::Arc;

/// Control API, UI channel and (optionally) the WebSocket transport on one
/// router, with request tracing and permissive CORS.
#[cfg(feature = "http")]
#[must_use]
pub fn create_router(
    dispatcher: Arc<multiwire_registry::Dispatcher>,
    websocket: Option<&Arc<WebSocketDriver>>,
) -> axum::Router {
    let mut router = axum::Router::new()
        .merge(control::create_control_router(Arc::clone(&dispatcher)))
        .merge(ui::create_ui_router(dispatcher));
    if let Some(driver) = websocket {
        router = router.merge(driver.router());
    }
    router
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}
