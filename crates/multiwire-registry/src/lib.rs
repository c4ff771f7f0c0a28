//! Transport registry and dispatch for multiwire.
//!
//! Provides:
//! - `Dispatcher` - Targeted and broadcast sends, inbound handling, request correlation
//! - Built-in drivers (in-memory channel, TCP)

pub mod dispatcher;
pub mod drivers;
pub mod pending;

pub use dispatcher::{BroadcastReport, DispatchError, Dispatcher, Inbound, TransportOutcome};
pub use pending::PendingRequests;
