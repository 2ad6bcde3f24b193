//! # Dispatch Loop
//!
//! The single event-processing context of one bus handle. It owns the
//! transport, the correlation table, the subscription table and the name
//! owner table, and is the only code that touches any of them, so
//! subscription changes and signal delivery are mutually exclusive without
//! locks.
//!
//! ```text
//!   callers ──Command──▶ ┌──────────────────┐ ──MethodCall──▶ transport
//!      ▲                 │   DispatchLoop   │
//!      └───oneshot────── │ pending + tables │ ◀──Inbound───── transport
//!                        └────────┬─────────┘
//!                                 └──Notification──▶ observer queues + tap
//! ```
//!
//! Every outstanding call has a deadline the loop enforces itself, so a
//! caller always gets an answer: a reply, an error reply, a timeout, or
//! `ConnectionInvalid` when the loop stops.
//!
//! When the transport reports unique sender names, the first endpoint naming
//! a well-known service also asks the daemon for the name's owner and
//! watches `NameOwnerChanged`, both ahead of the endpoint's `AddMatch`.

use crate::domain::{
    daemon, reply_value, AttachPlan, CallId, DetachPlan, InboundMessage, InboundSignal,
    MethodCall, OwnerTable, PendingCalls, SenderMatching, SubscriptionInfo, SubscriptionTable,
};
use crate::ports::{BusTransport, TransportError};
use crate::service::handle::Shared;
use quadro_telemetry::{
    log_bus_event, log_endpoint_event, CallTimer, ACTIVE_MATCHES, DAEMON_REQUEST_FAILURES,
    MESSAGES_DROPPED, NOTIFICATIONS_DELIVERED, SIGNALS_RECEIVED,
};
use quadro_types::{
    AttachError, BusKind, CallError, DetachError, Endpoint, MalformedArguments, MatchRule,
    Notification, SubscriptionError, Variant,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Idle wake-up when nothing is pending.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Requests from the public components to the loop.
pub(crate) enum Command {
    Call {
        endpoint: Endpoint,
        args: Vec<Variant>,
        timeout: Duration,
        reply: oneshot::Sender<Result<Variant, CallError>>,
    },
    Attach {
        endpoint: Endpoint,
        observer: String,
        reply: oneshot::Sender<Result<(), AttachError>>,
    },
    Detach {
        endpoint: Endpoint,
        observer: String,
        reply: oneshot::Sender<Result<(), DetachError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
    Shutdown,
}

impl Command {
    /// Answer a command that can no longer be served.
    fn reject(self) {
        match self {
            Self::Call { reply, .. } => {
                let _ = reply.send(Err(CallError::ConnectionInvalid));
            }
            Self::Attach { reply, .. } => {
                let _ = reply.send(Err(SubscriptionError::ConnectionInvalid));
            }
            Self::Detach { reply, .. } => {
                let _ = reply.send(Err(SubscriptionError::ConnectionInvalid));
            }
            Self::Snapshot { reply } => {
                let _ = reply.send(Vec::new());
            }
            Self::Shutdown => {}
        }
    }
}

type AttachReply = oneshot::Sender<Result<(), AttachError>>;

/// Who is waiting for a reply.
enum Waiter {
    Call {
        reply: oneshot::Sender<Result<Variant, CallError>>,
        _timer: CallTimer,
    },
    /// First `AddMatch` of an endpoint. Attaches arriving meanwhile add
    /// their reply and observer; detaches arriving meanwhile take the
    /// observer back out.
    AddMatch {
        endpoint: Endpoint,
        replies: Vec<AttachReply>,
        observers: BTreeSet<String>,
    },
    /// Released rule; the detach was already answered.
    RemoveMatch { endpoint: Endpoint },
    NameOwner { name: String },
    OwnerWatch,
}

enum Event {
    Command(Option<Command>),
    Inbound(Option<Result<InboundMessage, TransportError>>),
    Deadline,
}

pub(crate) struct DispatchLoop {
    kind: BusKind,
    transport: Box<dyn BusTransport>,
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    subscribe_timeout: Duration,
    pending: PendingCalls<Waiter>,
    table: SubscriptionTable,
    owners: OwnerTable,
    /// `NameOwnerChanged` match rule sent and not refused.
    watching_owners: bool,
    next_id: u64,
}

impl DispatchLoop {
    pub(crate) fn new(
        kind: BusKind,
        transport: Box<dyn BusTransport>,
        commands: mpsc::UnboundedReceiver<Command>,
        shared: Arc<Shared>,
        subscribe_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            transport,
            commands,
            shared,
            subscribe_timeout,
            pending: PendingCalls::new(),
            table: SubscriptionTable::new(),
            owners: OwnerTable::new(),
            watching_owners: false,
            next_id: 0,
        }
    }

    /// Run until shutdown is requested, every handle is gone, or the
    /// connection is lost.
    pub(crate) async fn run(mut self) {
        log_bus_event!(debug, self.kind, "Dispatch loop started");

        loop {
            let wake_at = self
                .pending
                .next_deadline()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_TICK);

            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command),
                inbound = self.transport.recv() => Event::Inbound(inbound),
                () = tokio::time::sleep_until(wake_at) => Event::Deadline,
            };

            let outcome = match event {
                Event::Command(None) | Event::Command(Some(Command::Shutdown)) => {
                    log_bus_event!(debug, self.kind, "Dispatch loop shutting down");
                    break;
                }
                Event::Command(Some(command)) => self.handle_command(command).await,
                Event::Inbound(Some(Ok(message))) => self.handle_inbound(message).await,
                Event::Inbound(Some(Err(e))) if e.is_fatal() => Err(e),
                Event::Inbound(Some(Err(e))) => {
                    warn!(bus = %self.kind, error = %e, "Dropping undecodable message");
                    MESSAGES_DROPPED
                        .with_label_values(&[self.kind.as_str(), "malformed"])
                        .inc();
                    Ok(())
                }
                Event::Inbound(None) => {
                    log_bus_event!(error, self.kind, "Bus connection closed by peer");
                    break;
                }
                Event::Deadline => self.expire(Instant::now()).await,
            };

            if let Err(e) = outcome {
                log_bus_event!(error, self.kind, "Bus connection lost", error = %e);
                break;
            }
        }

        self.shut_down();
    }

    fn next_call_id(&mut self) -> CallId {
        self.next_id += 1;
        CallId::new(self.next_id)
    }

    /// Only fatal transport errors are returned; everything else is answered
    /// to the caller directly.
    async fn handle_command(&mut self, command: Command) -> Result<(), TransportError> {
        match command {
            Command::Call {
                endpoint,
                args,
                timeout,
                reply,
            } => self.start_call(endpoint, args, timeout, reply).await,
            Command::Attach {
                endpoint,
                observer,
                reply,
            } => self.attach(endpoint, observer, reply).await,
            Command::Detach {
                endpoint,
                observer,
                reply,
            } => self.detach(endpoint, observer, reply).await,
            Command::Snapshot { reply } => {
                let _ = reply.send(self.table.snapshot());
                Ok(())
            }
            Command::Shutdown => Ok(()),
        }
    }

    async fn start_call(
        &mut self,
        endpoint: Endpoint,
        args: Vec<Variant>,
        timeout: Duration,
        reply: oneshot::Sender<Result<Variant, CallError>>,
    ) -> Result<(), TransportError> {
        let id = self.next_call_id();
        log_endpoint_event!(debug, self.kind, endpoint, "Sending method call", call_id = %id, args = args.len());

        let timer = CallTimer::start(self.kind.as_str());
        let call = MethodCall { id, endpoint, args };
        match self.transport.send(call).await {
            Ok(()) => {
                self.pending.insert(
                    id,
                    Instant::now(),
                    timeout,
                    Waiter::Call {
                        reply,
                        _timer: timer,
                    },
                );
                Ok(())
            }
            Err(TransportError::Encode(reason)) => {
                let _ = reply.send(Err(CallError::Malformed(MalformedArguments::Unencodable(
                    reason,
                ))));
                Ok(())
            }
            Err(e) => {
                let _ = reply.send(Err(CallError::ConnectionInvalid));
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Send a daemon request answered into `waiter`. A non-fatal send
    /// failure is logged and counted under `op`; returns whether it was sent.
    async fn send_daemon(
        &mut self,
        call: MethodCall,
        waiter: Waiter,
        op: &'static str,
    ) -> Result<bool, TransportError> {
        let id = call.id;
        match self.transport.send(call).await {
            Ok(()) => {
                self.pending
                    .insert(id, Instant::now(), self.subscribe_timeout, waiter);
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(bus = %self.kind, op, error = %e, "Cannot send daemon request");
                self.daemon_request_failed(op);
                Ok(false)
            }
        }
    }

    fn daemon_request_failed(&self, op: &'static str) {
        DAEMON_REQUEST_FAILURES
            .with_label_values(&[self.kind.as_str(), op])
            .inc();
    }

    /// Whether signals for `endpoint` are matched through the owner table.
    fn resolves_owner(&self, endpoint: &Endpoint) -> bool {
        self.transport.sender_matching() == SenderMatching::UniqueNames
            && !endpoint.is_any_sender()
            && OwnerTable::needs_resolution(endpoint.service())
    }

    async fn track_owner(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if !self.resolves_owner(endpoint) {
            return Ok(());
        }

        if !self.watching_owners {
            let id = self.next_call_id();
            let rule = MatchRule::for_endpoint(&daemon::name_owner_changed());
            self.watching_owners = self
                .send_daemon(daemon::add_match(id, &rule), Waiter::OwnerWatch, "owner_watch")
                .await?;
        }

        let name = endpoint.service();
        if self.owners.track(name) {
            let id = self.next_call_id();
            debug!(bus = %self.kind, name, call_id = %id, "Looking up name owner");
            self.send_daemon(
                daemon::get_name_owner(id, name),
                Waiter::NameOwner {
                    name: name.to_string(),
                },
                "owner_lookup",
            )
            .await?;
        }
        Ok(())
    }

    fn untrack_owner(&mut self, endpoint: &Endpoint) {
        if self.resolves_owner(endpoint) {
            self.owners.untrack(endpoint.service());
        }
    }

    /// Drop a requested endpoint and its owner tracking.
    fn abandon(&mut self, endpoint: &Endpoint) {
        if self.table.abandon_match(endpoint) {
            self.untrack_owner(endpoint);
        }
    }

    async fn attach(
        &mut self,
        endpoint: Endpoint,
        observer: String,
        reply: AttachReply,
    ) -> Result<(), TransportError> {
        match self.table.plan_attach(&endpoint, &observer) {
            AttachPlan::AlreadyAttached => {
                log_endpoint_event!(debug, self.kind, endpoint, "Observer already attached", observer = %observer);
                let _ = reply.send(Ok(()));
                Ok(())
            }
            AttachPlan::Joined => {
                self.table.join(&endpoint, &observer);
                log_endpoint_event!(debug, self.kind, endpoint, "Observer joined existing match", observer = %observer);
                let _ = reply.send(Ok(()));
                Ok(())
            }
            AttachPlan::AwaitMatch(id) => {
                if let Some(Waiter::AddMatch {
                    replies, observers, ..
                }) = self.pending.get_mut(id)
                {
                    log_endpoint_event!(debug, self.kind, endpoint, "Observer waits for in-flight match", observer = %observer, call_id = %id);
                    observers.insert(observer);
                    replies.push(reply);
                    return Ok(());
                }
                // Requested entry without its waiter: start over
                self.abandon(&endpoint);
                self.request_match(endpoint, observer, reply).await
            }
            AttachPlan::RequestMatch => self.request_match(endpoint, observer, reply).await,
        }
    }

    async fn request_match(
        &mut self,
        endpoint: Endpoint,
        observer: String,
        reply: AttachReply,
    ) -> Result<(), TransportError> {
        self.track_owner(&endpoint).await?;

        let id = self.next_call_id();
        let rule = MatchRule::for_endpoint(&endpoint);
        log_endpoint_event!(debug, self.kind, endpoint, "Requesting match rule", call_id = %id, observer = %observer);

        self.table.begin_match(endpoint.clone(), id);
        match self.transport.send(daemon::add_match(id, &rule)).await {
            Ok(()) => {
                self.pending.insert(
                    id,
                    Instant::now(),
                    self.subscribe_timeout,
                    Waiter::AddMatch {
                        endpoint,
                        replies: vec![reply],
                        observers: BTreeSet::from([observer]),
                    },
                );
                Ok(())
            }
            Err(e) => {
                self.abandon(&endpoint);
                let _ = reply.send(Err(send_failure(e.clone())));
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn detach(
        &mut self,
        endpoint: Endpoint,
        observer: String,
        reply: oneshot::Sender<Result<(), DetachError>>,
    ) -> Result<(), TransportError> {
        match self.table.detach(&endpoint, &observer) {
            DetachPlan::NotAttached => {
                log_endpoint_event!(debug, self.kind, endpoint, "Detach of unknown observer ignored", observer = %observer);
                let _ = reply.send(Ok(()));
                Ok(())
            }
            DetachPlan::Removed => {
                log_endpoint_event!(debug, self.kind, endpoint, "Observer detached", observer = %observer);
                let _ = reply.send(Ok(()));
                Ok(())
            }
            DetachPlan::Pending(id) => {
                let left = match self.pending.get_mut(id) {
                    Some(Waiter::AddMatch { observers, .. }) => observers.remove(&observer),
                    _ => false,
                };
                if left {
                    log_endpoint_event!(debug, self.kind, endpoint, "Observer left before match became active", observer = %observer, call_id = %id);
                }
                let _ = reply.send(Ok(()));
                Ok(())
            }
            DetachPlan::ReleaseMatch => {
                self.untrack_owner(&endpoint);
                self.update_match_gauge();
                log_endpoint_event!(debug, self.kind, endpoint, "Last observer detached", observer = %observer);
                let released = self.release_match(endpoint).await;
                let _ = reply.send(Ok(()));
                released
            }
        }
    }

    /// Ask the daemon to drop the rule for `endpoint` without anyone waiting
    /// on the answer.
    async fn release_match(&mut self, endpoint: Endpoint) -> Result<(), TransportError> {
        let id = self.next_call_id();
        let rule = MatchRule::for_endpoint(&endpoint);
        log_endpoint_event!(debug, self.kind, endpoint, "Releasing match rule", call_id = %id);
        self.send_daemon(
            daemon::remove_match(id, &rule),
            Waiter::RemoveMatch { endpoint },
            "remove",
        )
        .await
        .map(|_| ())
    }

    async fn handle_inbound(&mut self, message: InboundMessage) -> Result<(), TransportError> {
        match message {
            InboundMessage::MethodReturn { reply_to, body } => {
                match self.pending.resolve(reply_to) {
                    Some(waiter) => self.complete(reply_to, waiter, Ok(body)).await,
                    None => {
                        self.drop_late_reply(reply_to);
                        Ok(())
                    }
                }
            }
            InboundMessage::Error {
                reply_to,
                name,
                message,
            } => match self.pending.resolve(reply_to) {
                Some(waiter) => {
                    self.complete(reply_to, waiter, Err((name, message)))
                        .await
                }
                None => {
                    self.drop_late_reply(reply_to);
                    Ok(())
                }
            },
            InboundMessage::Signal(signal) => {
                self.deliver(signal);
                Ok(())
            }
        }
    }

    fn drop_late_reply(&self, id: CallId) {
        debug!(bus = %self.kind, call_id = %id, "Dropping reply with no pending call");
        MESSAGES_DROPPED
            .with_label_values(&[self.kind.as_str(), "late_reply"])
            .inc();
    }

    async fn complete(
        &mut self,
        id: CallId,
        waiter: Waiter,
        outcome: Result<Vec<Variant>, (String, Option<String>)>,
    ) -> Result<(), TransportError> {
        match waiter {
            Waiter::Call { reply, _timer } => {
                let result = outcome
                    .map(reply_value)
                    .map_err(|(name, message)| CallError::Remote { name, message });
                debug!(bus = %self.kind, call_id = %id, ok = result.is_ok(), "Call completed");
                let _ = reply.send(result);
                Ok(())
            }
            Waiter::AddMatch {
                endpoint,
                replies,
                observers,
            } => match outcome {
                Ok(_) if observers.is_empty() => {
                    self.abandon(&endpoint);
                    log_endpoint_event!(debug, self.kind, endpoint, "Match rule accepted after its observers left");
                    let released = self.release_match(endpoint).await;
                    for reply in replies {
                        let _ = reply.send(Ok(()));
                    }
                    released
                }
                Ok(_) => {
                    let count = observers.len();
                    self.table.complete_match(&endpoint, observers);
                    self.update_match_gauge();
                    log_endpoint_event!(info, self.kind, endpoint, "Match rule active", observers = count);
                    for reply in replies {
                        let _ = reply.send(Ok(()));
                    }
                    Ok(())
                }
                Err((name, message)) => {
                    self.abandon(&endpoint);
                    self.daemon_request_failed("add");
                    log_endpoint_event!(warn, self.kind, endpoint, "Bus rejected match rule", error = %name);
                    for reply in replies {
                        let _ = reply.send(Err(SubscriptionError::Rejected {
                            name: name.clone(),
                            message: message.clone(),
                        }));
                    }
                    Ok(())
                }
            },
            Waiter::RemoveMatch { endpoint } => {
                if let Err((name, _)) = outcome {
                    self.daemon_request_failed("remove");
                    log_endpoint_event!(warn, self.kind, endpoint, "Bus rejected match removal, rule may linger", error = %name);
                }
                Ok(())
            }
            Waiter::NameOwner { name } => {
                let owner = match outcome {
                    Ok(body) => body.first().and_then(Variant::as_str).map(str::to_string),
                    Err((error, _)) => {
                        debug!(bus = %self.kind, name = %name, error = %error, "Name has no owner");
                        None
                    }
                };
                if self.owners.set_owner(&name, owner.clone()) {
                    debug!(bus = %self.kind, name = %name, owner = ?owner, "Resolved name owner");
                }
                Ok(())
            }
            Waiter::OwnerWatch => {
                if let Err((name, _)) = outcome {
                    self.watching_owners = false;
                    self.daemon_request_failed("owner_watch");
                    warn!(bus = %self.kind, error = %name, "Bus rejected name owner watch");
                }
                Ok(())
            }
        }
    }

    async fn expire(&mut self, now: Instant) -> Result<(), TransportError> {
        for (id, timeout, waiter) in self.pending.expire(now) {
            match waiter {
                Waiter::Call { reply, _timer } => {
                    debug!(bus = %self.kind, call_id = %id, ?timeout, "Call timed out");
                    let _ = reply.send(Err(CallError::Timeout(timeout)));
                }
                Waiter::AddMatch {
                    endpoint, replies, ..
                } => {
                    self.abandon(&endpoint);
                    self.daemon_request_failed("add");
                    log_endpoint_event!(warn, self.kind, endpoint, "Match rule request timed out", call_id = %id);
                    // Cancels the rule should the daemon still accept it
                    let released = self.release_match(endpoint).await;
                    for reply in replies {
                        let _ = reply.send(Err(SubscriptionError::Timeout(timeout)));
                    }
                    released?;
                }
                Waiter::RemoveMatch { endpoint } => {
                    self.daemon_request_failed("remove");
                    log_endpoint_event!(warn, self.kind, endpoint, "Match removal unanswered, rule may linger", call_id = %id);
                }
                Waiter::NameOwner { name } => {
                    self.daemon_request_failed("owner_lookup");
                    warn!(bus = %self.kind, name = %name, call_id = %id, "Name owner lookup timed out");
                }
                Waiter::OwnerWatch => {
                    self.watching_owners = false;
                    self.daemon_request_failed("owner_watch");
                    warn!(bus = %self.kind, call_id = %id, "Name owner watch timed out");
                }
            }
        }
        Ok(())
    }

    /// Follow a `NameOwnerChanged` broadcast. Returns whether the signal
    /// was one.
    fn follow_owner_change(&mut self, signal: &InboundSignal) -> bool {
        let Some((name, owner)) = daemon::owner_change(signal) else {
            return false;
        };
        if self.owners.set_owner(name, Some(owner.to_string())) {
            debug!(bus = %self.kind, name, owner, "Name changed owner");
        }
        true
    }

    fn deliver(&mut self, signal: InboundSignal) {
        let bus = self.kind.as_str();
        SIGNALS_RECEIVED.with_label_values(&[bus]).inc();
        let owner_change = self.follow_owner_change(&signal);

        let payload = match signal.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    bus,
                    path = %signal.path,
                    interface = %signal.interface,
                    member = %signal.member,
                    error = %e,
                    "Dropping malformed signal"
                );
                MESSAGES_DROPPED.with_label_values(&[bus, "malformed"]).inc();
                return;
            }
        };

        let matching = self.transport.sender_matching();
        let mut notifications = Vec::new();
        for (endpoint, observers) in self.table.route(&signal, matching, &self.owners) {
            for observer in observers {
                notifications.push(Notification {
                    bus: self.kind,
                    observer_id: observer.clone(),
                    endpoint: endpoint.clone(),
                    payload: payload.clone(),
                });
            }
        }

        let delivered = notifications.len() as u64;
        if delivered == 0 {
            if !owner_change {
                debug!(
                    bus,
                    sender = ?signal.sender,
                    member = %signal.member,
                    "Dropping signal with no matching subscription"
                );
                MESSAGES_DROPPED.with_label_values(&[bus, "unmatched"]).inc();
            }
            return;
        }

        self.shared.publish(notifications);
        NOTIFICATIONS_DELIVERED
            .with_label_values(&[bus])
            .inc_by(delivered);
    }

    fn update_match_gauge(&self) {
        ACTIVE_MATCHES
            .with_label_values(&[self.kind.as_str()])
            .set(self.table.match_count() as i64);
    }

    /// Invalidate the handle and answer everybody still waiting.
    fn shut_down(mut self) {
        self.shared.invalidate();

        for (_, waiter) in self.pending.drain() {
            match waiter {
                Waiter::Call { reply, .. } => {
                    let _ = reply.send(Err(CallError::ConnectionInvalid));
                }
                Waiter::AddMatch { replies, .. } => {
                    for reply in replies {
                        let _ = reply.send(Err(SubscriptionError::ConnectionInvalid));
                    }
                }
                Waiter::RemoveMatch { .. } | Waiter::NameOwner { .. } | Waiter::OwnerWatch => {}
            }
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject();
        }

        self.table.clear();
        self.owners.clear();
        self.update_match_gauge();
        log_bus_event!(info, self.kind, "Bus handle closed");
    }
}

/// Subscription error for a match-rule request that could not be sent.
fn send_failure(error: TransportError) -> SubscriptionError {
    match error {
        TransportError::Encode(reason) => {
            SubscriptionError::InvalidEndpoint(MalformedArguments::Unencodable(reason))
        }
        _ => SubscriptionError::ConnectionInvalid,
    }
}
