//! Built-in transport drivers.

pub mod channel;
pub mod peers;

#[cfg(feature = "tcp")]
pub mod tcp;

pub use channel::{ChannelDriver, ChannelPeer};
pub use peers::{PeerId, PeerSet};

#[cfg(feature = "tcp")]
pub use tcp::TcpDriver;
