//! Shared endpoints and bus setup for scenarios and benchmarks.

use quadro_bus::{BridgeConfig, BusBridges, MemoryBus};
use quadro_types::Endpoint;
use std::sync::Arc;

pub fn clock_tick() -> Endpoint {
    Endpoint::new("org.example.Clock", "/Clock", "org.example.Clock", "Tick")
}

pub fn sys_version() -> Endpoint {
    Endpoint::new("org.example.Sys", "/Sys", "org.example.Sys", "Version")
}

/// Echoes its arguments back as a list.
pub fn echo() -> Endpoint {
    Endpoint::new("org.example.Echo", "/Echo", "org.example.Echo", "Echo")
}

/// A memory bus serving `Sys.Version` and `Echo.Echo`.
pub fn stub_bus() -> MemoryBus {
    let bus = MemoryBus::new();
    bus.register_value(&sys_version(), "1.0");
    bus.register_method(&echo(), |args| {
        Ok(vec![quadro_types::Variant::List(args.to_vec())])
    });
    bus
}

pub fn bridges(bus: &MemoryBus) -> BusBridges {
    bridges_with(bus, BridgeConfig::for_testing())
}

pub fn bridges_with(bus: &MemoryBus, config: BridgeConfig) -> BusBridges {
    BusBridges::connect(Arc::new(bus.clone()), config)
}
