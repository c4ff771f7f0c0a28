//! JSON protocol for the control API and the UI notification channel.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use multiwire_core::{ConnectionEvent, Direction, Envelope, EnvelopeType, Snapshot, TransportKind};
use multiwire_registry::BroadcastReport;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendToRequest {
    pub transport: String,
    pub message: String,
}

/// Reply of `POST /api/send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendToResponse {
    pub success: bool,
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `POST /api/send-all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAllRequest {
    pub message: String,
    /// Restrict the broadcast to these transports.
    #[serde(default)]
    pub transports: Option<Vec<String>>,
}

/// Outcome for one transport in a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportResult {
    pub transport: TransportKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply of `POST /api/send-all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAllResponse {
    pub envelope_id: String,
    pub results: Vec<TransportResult>,
}

impl From<&BroadcastReport> for SendAllResponse {
    fn from(report: &BroadcastReport) -> Self {
        Self {
            envelope_id: report.envelope.id().to_string(),
            results: report
                .outcomes
                .iter()
                .map(|o| TransportResult {
                    transport: o.transport,
                    success: o.result.is_ok(),
                    error: o.result.as_ref().err().map(ToString::to_string),
                })
                .collect(),
        }
    }
}

/// Error body for failed control requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Envelope as shown to UI clients. The payload is base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeView {
    pub id: String,
    pub request_id: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub payload: String,
}

impl EnvelopeView {
    /// Decode the payload from base64.
    #[must_use]
    pub fn decode_payload(&self) -> Option<Vec<u8>> {
        BASE64.decode(&self.payload).ok()
    }
}

impl From<&Envelope> for EnvelopeView {
    fn from(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id().to_string(),
            request_id: envelope.request_id().to_string(),
            kind: envelope.kind(),
            payload: BASE64.encode(envelope.payload()),
        }
    }
}

/// Snapshot as shown to UI clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    pub seq: u64,
    pub transport: TransportKind,
    pub direction: Direction,
    pub envelope: EnvelopeView,
    pub timestamp_ms: i64,
}

impl From<&Snapshot> for SnapshotView {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            seq: snapshot.seq,
            transport: snapshot.transport,
            direction: snapshot.direction,
            envelope: EnvelopeView::from(&snapshot.envelope),
            timestamp_ms: snapshot.timestamp_ms,
        }
    }
}

/// Convert a list of snapshots for the wire.
#[must_use]
pub fn snapshot_views(snapshots: &[Snapshot]) -> Vec<SnapshotView> {
    snapshots.iter().map(SnapshotView::from).collect()
}

/// Message from a UI client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiClientMessage {
    /// Request the full snapshot list.
    List,
    /// Empty the snapshot store.
    Clear,
    /// Ping for keepalive.
    Ping,
}

/// Message pushed to a UI client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum UiServerMessage {
    /// Full snapshot list, oldest first.
    Snapshots { snapshots: Vec<SnapshotView> },
    /// One newly recorded snapshot.
    Snapshot { snapshot: SnapshotView },
    /// The store was cleared.
    Cleared,
    /// Connection flag of every registered transport.
    Status {
        transports: BTreeMap<TransportKind, bool>,
    },
    /// One transport changed state.
    Connection {
        transport: TransportKind,
        connected: bool,
        peer: Option<String>,
    },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl From<&ConnectionEvent> for UiServerMessage {
    fn from(event: &ConnectionEvent) -> Self {
        Self::Connection {
            transport: event.transport,
            connected: event.connected,
            peer: event.peer.clone(),
        }
    }
}
