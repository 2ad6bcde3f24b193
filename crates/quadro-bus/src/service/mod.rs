//! Service layer: the dispatch loop and the public components built on it.

mod bridge;
mod calls;
mod dispatch;
mod handle;
mod receiver;
mod router;

pub use bridge::{BusBridge, BusBridges};
pub use calls::RemoteCallClient;
pub use handle::BusHandle;
pub use receiver::{NotificationReceiver, NotificationStream, ReceiveError};
pub use router::SignalRouter;
