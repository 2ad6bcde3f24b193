//! # Integration Scenarios
//!
//! The shell's view of the bridge: a [`quadro_bus::BusBridges`] pair over a
//! [`quadro_bus::MemoryBus`] daemon, exercised only through public API.

pub mod calls;
pub mod lifecycle;
pub mod subscriptions;
