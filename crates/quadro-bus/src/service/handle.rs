//! # Bus Handle
//!
//! One connection to one bus instance. Constructing a handle spawns its
//! dispatch thread (named `quadro-bus-<kind>`) running a single-threaded
//! tokio runtime; every clone of the handle talks to that thread over a
//! command channel. The thread stops when the last clone is dropped or the
//! connection is lost, and a stopped handle never becomes valid again.

use crate::config::BridgeConfig;
use crate::ports::BusConnector;
use crate::service::dispatch::{Command, DispatchLoop};
use crate::service::receiver::NotificationReceiver;
use parking_lot::Mutex;
use quadro_telemetry::log_bus_event;
use quadro_types::{BusKind, ConnectionError, Notification};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Where the dispatch loop puts notifications.
pub(crate) struct Outlets {
    /// Bounded tap seen by every all-observers receiver.
    all: broadcast::Sender<Notification>,
    /// Unbounded queues of per-observer receivers.
    observers: HashMap<String, Vec<mpsc::UnboundedSender<Notification>>>,
}

impl Outlets {
    fn new(capacity: usize) -> Self {
        Self {
            all: broadcast::channel(capacity).0,
            observers: HashMap::new(),
        }
    }

    /// Hand a notification to the tap and to its observer's queues.
    pub(crate) fn publish(&mut self, notification: Notification) {
        // Err only means nobody is listening on the tap right now
        let _ = self.all.send(notification.clone());

        let observer = notification.observer_id.as_str();
        if let Some(queues) = self.observers.get_mut(observer) {
            queues.retain(|queue| queue.send(notification.clone()).is_ok());
            if queues.is_empty() {
                self.observers.remove(observer);
            }
        }
    }
}

/// State shared between the handle and its dispatch loop.
pub(crate) struct Shared {
    valid: AtomicBool,
    /// Taken by the loop when it stops, closing every receiver.
    outlets: Mutex<Option<Outlets>>,
}

impl Shared {
    fn new(outlets: Option<Outlets>) -> Self {
        Self {
            valid: AtomicBool::new(outlets.is_some()),
            outlets: Mutex::new(outlets),
        }
    }

    /// Publish notifications; a no-op once invalidated.
    pub(crate) fn publish(&self, notifications: impl IntoIterator<Item = Notification>) {
        if let Some(outlets) = self.outlets.lock().as_mut() {
            for notification in notifications {
                outlets.publish(notification);
            }
        }
    }

    /// Mark the handle unusable for good.
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
        self.outlets.lock().take();
    }
}

struct HandleInner {
    kind: BusKind,
    config: BridgeConfig,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log_bus_event!(warn, self.kind, "Dispatch thread panicked");
            }
        }
    }
}

/// Capability object owning one live bus connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct BusHandle {
    inner: Arc<HandleInner>,
}

impl BusHandle {
    /// Connect to the `kind` bus and start its dispatch thread.
    ///
    /// Blocks until the connector has either produced a transport or failed.
    pub fn connect(
        kind: BusKind,
        connector: Arc<dyn BusConnector>,
        config: BridgeConfig,
    ) -> Result<Self, ConnectionError> {
        config
            .validate()
            .map_err(|e| ConnectionError::DispatchStart(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(Some(Outlets::new(
            config.notification_capacity,
        ))));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), ConnectionError>>();

        let loop_shared = Arc::clone(&shared);
        let subscribe_timeout = config.subscribe_timeout;
        let thread = std::thread::Builder::new()
            .name(format!("quadro-bus-{kind}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ConnectionError::DispatchStart(e.to_string())));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let transport = match connector.connect(kind).await {
                        Ok(transport) => transport,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    DispatchLoop::new(kind, transport, command_rx, loop_shared, subscribe_timeout)
                    .run()
                    .await;
                });
            })
            .map_err(|e| ConnectionError::DispatchStart(e.to_string()))?;

        let ready = futures::executor::block_on(ready_rx).unwrap_or_else(|_| {
            Err(ConnectionError::DispatchStart(
                "dispatch thread exited during startup".to_string(),
            ))
        });

        if let Err(e) = ready {
            shared.invalidate();
            if thread.join().is_err() {
                log_bus_event!(warn, kind, "Dispatch thread panicked during startup");
            }
            log_bus_event!(warn, kind, "Bus connection failed", error = %e);
            return Err(e);
        }

        log_bus_event!(info, kind, "Connected to bus");
        Ok(Self {
            inner: Arc::new(HandleInner {
                kind,
                config,
                commands: command_tx,
                shared,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// A handle that is invalid from the start.
    ///
    /// Stands in for a bus that could not be reached: every operation fails
    /// immediately with a connection-invalid error.
    #[must_use]
    pub fn disconnected(kind: BusKind, config: BridgeConfig) -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        log_bus_event!(debug, kind, "Created disconnected bus handle");
        Self {
            inner: Arc::new(HandleInner {
                kind,
                config,
                commands,
                shared: Arc::new(Shared::new(None)),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Whether the connection is usable. Once `false`, stays `false`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.shared.valid.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn kind(&self) -> BusKind {
        self.inner.kind
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Receiver for every notification delivered on this bus.
    ///
    /// Reads a tap of `notification_capacity` entries; a receiver that falls
    /// further behind skips the oldest. On an invalid handle the receiver is
    /// closed from the start.
    #[must_use]
    pub fn subscribe_notifications(&self) -> NotificationReceiver {
        let receiver = match self.inner.shared.outlets.lock().as_ref() {
            Some(outlets) => outlets.all.subscribe(),
            None => broadcast::channel(1).1,
        };
        NotificationReceiver::all(self.inner.kind, receiver)
    }

    /// Receiver for the notifications addressed to one observer.
    ///
    /// Backed by its own unbounded queue, so nothing is lost however slowly
    /// it is drained. Closed from the start on an invalid handle.
    #[must_use]
    pub fn subscribe_observer(&self, observer_id: &str) -> NotificationReceiver {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        if let Some(outlets) = self.inner.shared.outlets.lock().as_mut() {
            outlets
                .observers
                .entry(observer_id.to_string())
                .or_default()
                .push(queue_tx);
        }
        NotificationReceiver::observer(self.inner.kind, observer_id, queue_rx)
    }

    /// Hand a command to the dispatch loop.
    ///
    /// Returns the reply receiver, or `None` when the handle is invalid. A
    /// receiver whose sender is dropped means the loop stopped first.
    pub(crate) fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Option<oneshot::Receiver<T>> {
        if !self.is_valid() {
            return None;
        }
        let (reply, receiver) = oneshot::channel();
        self.inner.commands.send(command(reply)).ok()?;
        Some(receiver)
    }
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle")
            .field("kind", &self.inner.kind)
            .field("valid", &self.is_valid())
            .finish()
    }
}
