//! # Remote Call Client
//!
//! Request/response invocation over a [`BusHandle`]. Arguments and addressing
//! are validated before anything is handed to the dispatch loop, so malformed
//! calls fail without I/O. The loop answers every call that reached it, which
//! bounds the wait by the call's timeout.

use crate::ports::RemoteCalls;
use crate::service::dispatch::Command;
use crate::service::handle::BusHandle;
use async_trait::async_trait;
use quadro_telemetry::{log_endpoint_event, BUS_CALLS};
use quadro_types::{CallArguments, CallError, CallResult, Endpoint, Variant};
use std::time::Duration;
use tokio::sync::oneshot;

/// Synchronous RPC over one bus.
#[derive(Debug, Clone)]
pub struct RemoteCallClient {
    handle: BusHandle,
}

impl RemoteCallClient {
    #[must_use]
    pub fn new(handle: BusHandle) -> Self {
        Self { handle }
    }

    #[must_use]
    pub fn handle(&self) -> &BusHandle {
        &self.handle
    }

    /// Invoke `endpoint` and block the calling thread until a reply, an error
    /// reply or `timeout`.
    ///
    /// Never retries. Safe to call from any thread, including threads running
    /// an async runtime, since replies are processed on the handle's own
    /// dispatch thread.
    pub fn call(&self, endpoint: &Endpoint, args: &CallArguments, timeout: Duration) -> CallResult {
        let result = match self.submit(endpoint, args, timeout) {
            Ok(receiver) => {
                futures::executor::block_on(receiver).unwrap_or(Err(CallError::ConnectionInvalid))
            }
            Err(e) => Err(e),
        };
        self.record(endpoint, result)
    }

    /// Awaitable form of [`RemoteCallClient::call`].
    pub async fn call_async(
        &self,
        endpoint: &Endpoint,
        args: &CallArguments,
        timeout: Duration,
    ) -> CallResult {
        let result = match self.submit(endpoint, args, timeout) {
            Ok(receiver) => receiver.await.unwrap_or(Err(CallError::ConnectionInvalid)),
            Err(e) => Err(e),
        };
        self.record(endpoint, result)
    }

    fn submit(
        &self,
        endpoint: &Endpoint,
        args: &CallArguments,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Variant, CallError>>, CallError> {
        if !self.handle.is_valid() {
            return Err(CallError::ConnectionInvalid);
        }
        endpoint.validate_for_call()?;
        let wire = args.to_wire()?;

        self.handle
            .request(|reply| Command::Call {
                endpoint: endpoint.clone(),
                args: wire,
                timeout,
                reply,
            })
            .ok_or(CallError::ConnectionInvalid)
    }

    fn record(&self, endpoint: &Endpoint, result: Result<Variant, CallError>) -> CallResult {
        let bus = self.handle.kind();
        let outcome = match &result {
            Ok(value) => {
                log_endpoint_event!(debug, bus, endpoint, "Call succeeded", reply = value.kind());
                "ok"
            }
            Err(e @ CallError::Timeout(_)) => {
                log_endpoint_event!(warn, bus, endpoint, "Call failed", error = %e);
                e.category()
            }
            Err(e) => {
                log_endpoint_event!(debug, bus, endpoint, "Call failed", error = %e);
                e.category()
            }
        };
        BUS_CALLS.with_label_values(&[bus.as_str(), outcome]).inc();
        result.into()
    }
}

#[async_trait]
impl RemoteCalls for RemoteCallClient {
    fn call(&self, endpoint: &Endpoint, args: &CallArguments, timeout: Duration) -> CallResult {
        RemoteCallClient::call(self, endpoint, args, timeout)
    }

    async fn call_async(
        &self,
        endpoint: &Endpoint,
        args: &CallArguments,
        timeout: Duration,
    ) -> CallResult {
        RemoteCallClient::call_async(self, endpoint, args, timeout).await
    }
}
