//! # Quadro Bus - Message-Bus Client Bridge
//!
//! Remote method calls and broadcast-signal subscriptions over the host bus
//! and the per-user session bus, for the kiosk shell and its web view.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`BusHandle`] | One connection and its dispatch thread |
//! | [`RemoteCallClient`] | Blocking `call(endpoint, args, timeout)` |
//! | [`SignalRouter`] | `attach` / `detach` and notification delivery |
//! | [`BusBridge`] | Façade pairing both over one handle |
//! | [`BusBridges`] | The host and session façades, held for the process lifetime |
//!
//! ## Dispatch Model
//!
//! ```text
//! ┌───────────────┐  call()/attach()   ┌────────────────────────────┐
//! │ Shell thread  │ ─────Command─────▶ │ quadro-bus-<kind> thread   │
//! │ (blocked on   │                    │  current-thread runtime    │
//! │  a oneshot)   │ ◀────reply──────── │  DispatchLoop              │
//! └───────────────┘                    │   ├─ PendingCalls          │
//!                                      │   ├─ SubscriptionTable     │
//! ┌───────────────┐   Notification     │   └─ BusTransport ◀──▶ bus │
//! │ Receivers     │ ◀──queue / tap──── │                            │
//! └───────────────┘                    └────────────────────────────┘
//! ```
//!
//! The dispatch thread never runs caller code, so a caller blocked in
//! `call()` cannot starve it, whatever thread the caller is on.
//!
//! ## Example
//!
//! ```rust
//! use quadro_bus::{BridgeConfig, BusBridges, MemoryBus};
//! use quadro_types::{CallArguments, CallResult, Endpoint, Variant};
//! use std::sync::Arc;
//!
//! let bus = MemoryBus::new();
//! let version = Endpoint::new("org.example.Sys", "/Sys", "org.example.Sys", "Version");
//! bus.register_value(&version, "1.0");
//!
//! let bridges = BusBridges::connect(Arc::new(bus), BridgeConfig::for_testing());
//! let result = bridges.session().call(&version, &CallArguments::new());
//! assert_eq!(result, CallResult::Value(Variant::from("1.0")));
//! ```
//!
//! ## Features
//!
//! - `dbus` - real host and session bus transport over `zbus`

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::{MemoryBus, MemoryTransport};
pub use config::{BridgeConfig, ConfigError};
pub use domain::{
    CallId, InboundMessage, InboundSignal, MethodCall, SenderMatching, SubscriptionInfo,
};
pub use ports::{BusConnector, BusTransport, RemoteCalls, SignalSubscriptions, TransportError};
pub use service::{
    BusBridge, BusBridges, BusHandle, NotificationReceiver, NotificationStream, ReceiveError,
    RemoteCallClient, SignalRouter,
};

#[cfg(feature = "dbus")]
pub use adapters::DbusConnector;
