//! # Quadro Types Crate
//!
//! Addressing, value and error types for the message-bus bridge.
//!
//! ## Design Principles
//!
//! - **Four-part addressing**: every remote method and broadcast signal is named
//!   by an [`Endpoint`] `(service, path, interface, member)`.
//! - **Generic values**: arguments, replies and notification payloads are
//!   [`Variant`]s, so the shell never depends on bus-specific type systems.
//! - **Bounded calls**: [`CallArguments`] holds at most [`MAX_CALL_ARGS`] values
//!   and is validated before any I/O happens.
//! - **Categorized failures**: every failure maps onto the taxonomy in
//!   [`errors`]; nothing is raised process-wide.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod entities;
pub mod errors;
pub mod notification;
pub mod values;

pub use entities::{BusKind, Endpoint, MatchRule, ANY_SENDER};
pub use errors::*;
pub use notification::{random_observer_id, Notification, NotificationPayload};
pub use values::{CallArguments, CallResult, Variant, MAX_CALL_ARGS};
