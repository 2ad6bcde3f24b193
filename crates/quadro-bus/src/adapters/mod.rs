//! Adapters layer: concrete bus transports.
//!
//! - [`MemoryBus`] - in-process daemon, always available
//! - `DbusConnector` - real host and session buses (feature `dbus`)

pub mod memory;

#[cfg(feature = "dbus")]
pub mod dbus;

pub use memory::{MemoryBus, MemoryTransport, RemoteFailure};

#[cfg(feature = "dbus")]
pub use dbus::{DbusConnector, DbusTransport};
