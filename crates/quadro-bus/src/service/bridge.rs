//! # Bus Façades
//!
//! [`BusBridge`] pairs a [`RemoteCallClient`] and a [`SignalRouter`] over one
//! handle. [`BusBridges`] holds the host and session façades the shell owns
//! from startup to shutdown.

use crate::config::BridgeConfig;
use crate::domain::SubscriptionInfo;
use crate::ports::BusConnector;
use crate::service::calls::RemoteCallClient;
use crate::service::handle::BusHandle;
use crate::service::receiver::NotificationReceiver;
use crate::service::router::SignalRouter;
use quadro_types::{AttachError, BusKind, CallArguments, CallResult, DetachError, Endpoint};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Call and subscription surface of one bus.
#[derive(Debug, Clone)]
pub struct BusBridge {
    calls: RemoteCallClient,
    signals: SignalRouter,
}

impl BusBridge {
    #[must_use]
    pub fn new(handle: BusHandle) -> Self {
        Self {
            calls: RemoteCallClient::new(handle.clone()),
            signals: SignalRouter::new(handle),
        }
    }

    /// Call with the configured default timeout.
    pub fn call(&self, endpoint: &Endpoint, args: &CallArguments) -> CallResult {
        let timeout = self.handle().config().call_timeout;
        self.calls.call(endpoint, args, timeout)
    }

    pub fn call_with_timeout(
        &self,
        endpoint: &Endpoint,
        args: &CallArguments,
        timeout: Duration,
    ) -> CallResult {
        self.calls.call(endpoint, args, timeout)
    }

    pub fn attach(&self, endpoint: &Endpoint, observer_id: &str) -> Result<(), AttachError> {
        self.signals.attach(endpoint, observer_id)
    }

    pub fn detach(&self, endpoint: &Endpoint, observer_id: &str) -> Result<(), DetachError> {
        self.signals.detach(endpoint, observer_id)
    }

    #[must_use]
    pub fn notifications(&self) -> NotificationReceiver {
        self.signals.notifications()
    }

    #[must_use]
    pub fn notifications_for(&self, observer_id: &str) -> NotificationReceiver {
        self.signals.notifications_for(observer_id)
    }

    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.signals.subscriptions()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.handle().is_valid()
    }

    #[must_use]
    pub fn kind(&self) -> BusKind {
        self.handle().kind()
    }

    #[must_use]
    pub fn handle(&self) -> &BusHandle {
        self.calls.handle()
    }

    #[must_use]
    pub fn calls(&self) -> &RemoteCallClient {
        &self.calls
    }

    #[must_use]
    pub fn signals(&self) -> &SignalRouter {
        &self.signals
    }
}

/// The host-bus and session-bus façades.
#[derive(Debug, Clone)]
pub struct BusBridges {
    system: BusBridge,
    session: BusBridge,
}

impl BusBridges {
    /// Connect both buses.
    ///
    /// A bus that cannot be reached yields a disconnected façade whose
    /// operations fail with connection-invalid errors; the other bus is
    /// unaffected.
    pub fn connect(connector: Arc<dyn BusConnector>, config: BridgeConfig) -> Self {
        let open = |kind: BusKind| {
            let handle = BusHandle::connect(kind, Arc::clone(&connector), config.clone())
                .unwrap_or_else(|e| {
                    warn!(bus = %kind, error = %e, "Bus unavailable, continuing without it");
                    BusHandle::disconnected(kind, config.clone())
                });
            BusBridge::new(handle)
        };

        Self {
            system: open(BusKind::System),
            session: open(BusKind::Session),
        }
    }

    /// Host-wide bus.
    #[must_use]
    pub fn system(&self) -> &BusBridge {
        &self.system
    }

    /// Per-user session bus.
    #[must_use]
    pub fn session(&self) -> &BusBridge {
        &self.session
    }

    #[must_use]
    pub fn get(&self, kind: BusKind) -> &BusBridge {
        match kind {
            BusKind::System => &self.system,
            BusKind::Session => &self.session,
        }
    }
}
