//! # Driving Ports (Inbound API)
//!
//! What the bridge offers to the shell.

use async_trait::async_trait;
use quadro_types::{AttachError, CallArguments, CallResult, DetachError, Endpoint};
use std::time::Duration;

/// Remote method invocation.
#[async_trait]
pub trait RemoteCalls: Send + Sync {
    /// Invoke `endpoint` and block until a reply, an error reply or the timeout.
    fn call(&self, endpoint: &Endpoint, args: &CallArguments, timeout: Duration) -> CallResult;

    /// Awaitable form of [`RemoteCalls::call`] with identical outcomes.
    async fn call_async(
        &self,
        endpoint: &Endpoint,
        args: &CallArguments,
        timeout: Duration,
    ) -> CallResult;
}

/// Broadcast-signal subscription management.
#[async_trait]
pub trait SignalSubscriptions: Send + Sync {
    /// Register `observer_id` for signals at `endpoint`. Idempotent.
    fn attach(&self, endpoint: &Endpoint, observer_id: &str) -> Result<(), AttachError>;

    /// Unregister `observer_id`. Detaching an unknown pair succeeds.
    fn detach(&self, endpoint: &Endpoint, observer_id: &str) -> Result<(), DetachError>;

    async fn attach_async(&self, endpoint: &Endpoint, observer_id: &str)
        -> Result<(), AttachError>;

    async fn detach_async(&self, endpoint: &Endpoint, observer_id: &str)
        -> Result<(), DetachError>;
}
