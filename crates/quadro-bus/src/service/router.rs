//! # Signal Router
//!
//! Subscription lifecycle over a [`BusHandle`]. The subscription table lives
//! in the dispatch loop; this type only validates and forwards requests, and
//! hands out receivers for the notifications the loop produces.
//!
//! | Operation | Bus traffic |
//! |-----------|-------------|
//! | first `attach` for an endpoint | `AddMatch` |
//! | further `attach` for the endpoint | none |
//! | `detach` of a non-last observer | none |
//! | `detach` of the last observer | `RemoveMatch`, not awaited |
//! | `detach` while the first `attach` is in flight | `RemoveMatch` once it lands, if nobody is left |
//! | `detach` of an unknown pair | none |

use crate::domain::SubscriptionInfo;
use crate::ports::SignalSubscriptions;
use crate::service::dispatch::Command;
use crate::service::handle::BusHandle;
use crate::service::receiver::NotificationReceiver;
use async_trait::async_trait;
use quadro_types::{AttachError, DetachError, Endpoint, SubscriptionError};
use tokio::sync::oneshot;

/// Broadcast-signal subscriptions over one bus.
#[derive(Debug, Clone)]
pub struct SignalRouter {
    handle: BusHandle,
}

impl SignalRouter {
    #[must_use]
    pub fn new(handle: BusHandle) -> Self {
        Self { handle }
    }

    #[must_use]
    pub fn handle(&self) -> &BusHandle {
        &self.handle
    }

    /// Register `observer_id` for signals at `endpoint`.
    ///
    /// The first observer of an endpoint registers a match rule with the bus
    /// and waits for the daemon to accept it. Re-attaching a registered pair
    /// succeeds without any bus traffic.
    pub fn attach(&self, endpoint: &Endpoint, observer_id: &str) -> Result<(), AttachError> {
        let receiver = self.submit_attach(endpoint, observer_id)?;
        futures::executor::block_on(receiver).unwrap_or(Err(SubscriptionError::ConnectionInvalid))
    }

    /// Unregister `observer_id` from `endpoint`.
    ///
    /// Once this returns the observer receives no further notifications for
    /// the endpoint. Detaching a pair that was never attached succeeds. The
    /// daemon's answer to a released match rule is not awaited; a refused
    /// or unanswered removal is logged and counted, never reported here.
    pub fn detach(&self, endpoint: &Endpoint, observer_id: &str) -> Result<(), DetachError> {
        let receiver = self.submit_detach(endpoint, observer_id)?;
        futures::executor::block_on(receiver).unwrap_or(Err(SubscriptionError::ConnectionInvalid))
    }

    pub async fn attach_async(
        &self,
        endpoint: &Endpoint,
        observer_id: &str,
    ) -> Result<(), AttachError> {
        let receiver = self.submit_attach(endpoint, observer_id)?;
        receiver
            .await
            .unwrap_or(Err(SubscriptionError::ConnectionInvalid))
    }

    pub async fn detach_async(
        &self,
        endpoint: &Endpoint,
        observer_id: &str,
    ) -> Result<(), DetachError> {
        let receiver = self.submit_detach(endpoint, observer_id)?;
        receiver
            .await
            .unwrap_or(Err(SubscriptionError::ConnectionInvalid))
    }

    /// Every notification on this bus, whichever observer it is for.
    #[must_use]
    pub fn notifications(&self) -> NotificationReceiver {
        self.handle.subscribe_notifications()
    }

    /// Notifications addressed to one observer, queued without loss.
    #[must_use]
    pub fn notifications_for(&self, observer_id: &str) -> NotificationReceiver {
        self.handle.subscribe_observer(observer_id)
    }

    /// Active subscriptions, for diagnostics. Empty on an invalid handle.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.handle
            .request(|reply| Command::Snapshot { reply })
            .and_then(|receiver| futures::executor::block_on(receiver).ok())
            .unwrap_or_default()
    }

    fn submit_attach(
        &self,
        endpoint: &Endpoint,
        observer_id: &str,
    ) -> Result<oneshot::Receiver<Result<(), AttachError>>, AttachError> {
        if !self.handle.is_valid() {
            return Err(SubscriptionError::ConnectionInvalid);
        }
        endpoint
            .validate()
            .map_err(SubscriptionError::InvalidEndpoint)?;

        self.handle
            .request(|reply| Command::Attach {
                endpoint: endpoint.clone(),
                observer: observer_id.to_string(),
                reply,
            })
            .ok_or(SubscriptionError::ConnectionInvalid)
    }

    fn submit_detach(
        &self,
        endpoint: &Endpoint,
        observer_id: &str,
    ) -> Result<oneshot::Receiver<Result<(), DetachError>>, DetachError> {
        if !self.handle.is_valid() {
            return Err(SubscriptionError::ConnectionInvalid);
        }

        self.handle
            .request(|reply| Command::Detach {
                endpoint: endpoint.clone(),
                observer: observer_id.to_string(),
                reply,
            })
            .ok_or(SubscriptionError::ConnectionInvalid)
    }
}

#[async_trait]
impl SignalSubscriptions for SignalRouter {
    fn attach(&self, endpoint: &Endpoint, observer_id: &str) -> Result<(), AttachError> {
        SignalRouter::attach(self, endpoint, observer_id)
    }

    fn detach(&self, endpoint: &Endpoint, observer_id: &str) -> Result<(), DetachError> {
        SignalRouter::detach(self, endpoint, observer_id)
    }

    async fn attach_async(
        &self,
        endpoint: &Endpoint,
        observer_id: &str,
    ) -> Result<(), AttachError> {
        SignalRouter::attach_async(self, endpoint, observer_id).await
    }

    async fn detach_async(
        &self,
        endpoint: &Endpoint,
        observer_id: &str,
    ) -> Result<(), DetachError> {
        SignalRouter::detach_async(self, endpoint, observer_id).await
    }
}
