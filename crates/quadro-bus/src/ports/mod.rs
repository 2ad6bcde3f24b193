//! Ports layer: traits at the boundaries of the bridge.

pub mod inbound;
pub mod outbound;

pub use inbound::{RemoteCalls, SignalSubscriptions};
pub use outbound::{BusConnector, BusTransport, TransportError};
