//! Transport kinds and traffic direction.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One independently connectable wire channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// WebSocket peers, one envelope per binary frame.
    #[serde(rename = "websocket", alias = "ws")]
    WebSocket,
    /// Raw TCP stream with length-prefixed frames.
    #[serde(rename = "tcp")]
    Tcp,
    /// UDP-based reliable transport.
    #[serde(rename = "udp", alias = "udp-reliable")]
    UdpReliable,
}

impl TransportKind {
    /// Every kind, in status-report order.
    pub const ALL: [Self; 3] = [Self::WebSocket, Self::Tcp, Self::UdpReliable];

    /// Wire name used in JSON and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Tcp => "tcp",
            Self::UdpReliable => "udp",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::WebSocket => 0,
            Self::Tcp => 1,
            Self::UdpReliable => 2,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for transport names that match no known kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown transport kind: {0}")]
pub struct UnknownTransportKind(pub String);

impl FromStr for TransportKind {
    type Err = UnknownTransportKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "tcp" => Ok(Self::Tcp),
            "udp" | "udp-reliable" => Ok(Self::UdpReliable),
            _ => Err(UnknownTransportKind(s.to_string())),
        }
    }
}

/// Whether an envelope was received or sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}
