//! # Quadro Test Suite
//!
//! End-to-end scenarios for the bus bridge, driven against the in-memory bus
//! daemon.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── src/integration/   # Scenarios across quadro-types, quadro-bus, quadro-telemetry
//! │   ├── calls.rs
//! │   ├── subscriptions.rs
//! │   └── lifecycle.rs
//! └── benches/           # Call round-trip and signal fan-out
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p quadro-tests
//!
//! # By category
//! cargo test -p quadro-tests integration::subscriptions
//!
//! # Benchmarks
//! cargo bench -p quadro-tests
//! ```

pub mod fixtures;
pub mod integration;
