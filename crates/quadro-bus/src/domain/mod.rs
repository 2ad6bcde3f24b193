//! Domain layer: the message model, the call correlation table and the
//! subscription table. Pure data structures with no I/O.

pub mod message;
pub mod owners;
pub mod pending;
pub mod subscriptions;

pub use message::{daemon, reply_value, CallId, InboundMessage, InboundSignal, MethodCall};
pub use owners::OwnerTable;
pub use pending::PendingCalls;
pub use subscriptions::{
    AttachPlan, DetachPlan, MatchState, SenderMatching, SubscriptionInfo, SubscriptionTable,
};
