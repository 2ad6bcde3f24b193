//! # In-Memory Bus
//!
//! A bus daemon living in process memory. It serves stub methods, keeps the
//! match rules of every connection, routes emitted signals to connections
//! whose rules match, and answers the daemon's own `AddMatch`,
//! `RemoveMatch` and `GetNameOwner` the way the real daemon does.
//!
//! By default signals carry the well-known name of their service. With
//! [`MemoryBus::set_unique_senders`] they carry a unique connection name
//! instead, names change hands through [`MemoryBus::claim_name`], and every
//! change is broadcast as `NameOwnerChanged`.
//!
//! Faults can be injected: unreachable buses, refused or unanswered daemon
//! requests, dropped connections and raw inbound messages.
//!
//! Method handlers run while the broker lock is held and must not call back
//! into the same [`MemoryBus`].

use crate::domain::{daemon, InboundMessage, InboundSignal, MethodCall, SenderMatching};
use crate::ports::{BusConnector, BusTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use quadro_types::{BusKind, ConnectionError, Endpoint, MatchRule, Variant};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Remote error: name and optional message.
pub type RemoteFailure = (String, Option<String>);

type MethodFn = dyn Fn(&[Variant]) -> Result<Vec<Variant>, RemoteFailure> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Reply(Arc<MethodFn>),
    /// Accept the call and never answer.
    Silent,
}

type Inbox = mpsc::UnboundedSender<Result<InboundMessage, TransportError>>;

struct Connection {
    kind: BusKind,
    inbox: Inbox,
    rules: Vec<MatchRule>,
}

#[derive(Default)]
struct BrokerState {
    methods: BTreeMap<Endpoint, Handler>,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    unreachable: HashSet<BusKind>,
    reject_matches: Option<String>,
    reject_removals: Option<String>,
    /// Daemon calls parked by `hold_daemon_replies`, with their connection.
    held: Option<Vec<(u64, MethodCall)>>,
    unique_senders: bool,
    /// Well-known name to unique owner.
    owners: HashMap<String, String>,
    next_unique: u64,
    sent: Vec<MethodCall>,
    add_match_requests: usize,
    remove_match_requests: usize,
}

impl BrokerState {
    fn reply(&self, connection: u64, message: InboundMessage) {
        if let Some(conn) = self.connections.get(&connection) {
            let _ = conn.inbox.send(Ok(message));
        }
    }

    fn error(&self, connection: u64, call: &MethodCall, name: &str, message: String) {
        self.reply(
            connection,
            InboundMessage::Error {
                reply_to: call.id,
                name: name.to_string(),
                message: Some(message),
            },
        );
    }

    fn handle_call(&mut self, connection: u64, call: MethodCall) {
        let endpoint = &call.endpoint;
        if endpoint.service() == daemon::SERVICE {
            match call.endpoint.member() {
                daemon::ADD_MATCH => self.add_match_requests += 1,
                daemon::REMOVE_MATCH => self.remove_match_requests += 1,
                _ => {}
            }
            if let Some(held) = self.held.as_mut() {
                held.push((connection, call));
                return;
            }
            self.handle_daemon_call(connection, &call);
            return;
        }

        match self.methods.get(endpoint).cloned() {
            Some(Handler::Reply(method)) => match method(&call.args) {
                Ok(body) => self.reply(
                    connection,
                    InboundMessage::MethodReturn {
                        reply_to: call.id,
                        body,
                    },
                ),
                Err((name, message)) => self.reply(
                    connection,
                    InboundMessage::Error {
                        reply_to: call.id,
                        name,
                        message,
                    },
                ),
            },
            Some(Handler::Silent) => {}
            None if self.methods.keys().any(|e| e.service() == endpoint.service()) => self.error(
                connection,
                &call,
                daemon::ERROR_UNKNOWN_METHOD,
                format!("No such method {}.{}", endpoint.interface(), endpoint.member()),
            ),
            None => self.error(
                connection,
                &call,
                daemon::ERROR_SERVICE_UNKNOWN,
                format!("The name {} was not provided by any service", endpoint.service()),
            ),
        }
    }

    fn handle_daemon_call(&mut self, connection: u64, call: &MethodCall) {
        let argument = call.args.first().and_then(Variant::as_str);
        let member = call.endpoint.member();

        if member == daemon::GET_NAME_OWNER {
            let owner = argument.and_then(|name| self.owner_of(name));
            match owner {
                Some(owner) => self.reply(
                    connection,
                    InboundMessage::MethodReturn {
                        reply_to: call.id,
                        body: vec![Variant::Str(owner)],
                    },
                ),
                None => self.error(
                    connection,
                    call,
                    daemon::ERROR_NAME_HAS_NO_OWNER,
                    format!("Could not get owner of name '{}'", argument.unwrap_or_default()),
                ),
            }
            return;
        }

        let Some(rule) = argument.and_then(MatchRule::parse) else {
            self.error(
                connection,
                call,
                daemon::ERROR_MATCH_RULE_INVALID,
                "Invalid match rule".to_string(),
            );
            return;
        };

        match member {
            daemon::ADD_MATCH => {
                if let Some(name) = self.reject_matches.clone() {
                    self.error(connection, call, &name, "Match rule refused".to_string());
                    return;
                }
                if let Some(conn) = self.connections.get_mut(&connection) {
                    conn.rules.push(rule);
                }
                self.reply(connection, empty_return(call));
            }
            daemon::REMOVE_MATCH => {
                if let Some(name) = self.reject_removals.clone() {
                    self.error(connection, call, &name, "Match rule removal refused".to_string());
                    return;
                }
                let removed = self.connections.get_mut(&connection).is_some_and(|conn| {
                    match conn.rules.iter().position(|r| *r == rule) {
                        Some(index) => {
                            conn.rules.remove(index);
                            true
                        }
                        None => false,
                    }
                });
                if removed {
                    self.reply(connection, empty_return(call));
                } else {
                    self.error(
                        connection,
                        call,
                        daemon::ERROR_MATCH_RULE_NOT_FOUND,
                        "The given match rule wasn't found".to_string(),
                    );
                }
            }
            other => self.error(
                connection,
                call,
                daemon::ERROR_UNKNOWN_METHOD,
                format!("No such daemon method {other}"),
            ),
        }
    }

    /// Unique owner of a name. Unique names and the daemon own themselves;
    /// without unique senders every well-known name owns itself too.
    fn owner_of(&self, name: &str) -> Option<String> {
        if let Some(owner) = self.owners.get(name) {
            return Some(owner.clone());
        }
        let owns_itself = !self.unique_senders || name.starts_with(':') || name == daemon::SERVICE;
        owns_itself.then(|| name.to_string())
    }

    /// Whether a rule's sender clause accepts `sender`, resolving the
    /// clause's well-known name to its owner.
    fn rule_accepts(&self, rule: &MatchRule, signal: &InboundSignal) -> bool {
        if rule.matches(
            signal.sender.as_deref(),
            &signal.path,
            &signal.interface,
            &signal.member,
        ) {
            return true;
        }
        let Some(name) = rule.sender() else {
            return false;
        };
        let Some(owner) = self.owners.get(name) else {
            return false;
        };
        signal.sender.as_deref() == Some(owner.as_str())
            && rule.matches(Some(name), &signal.path, &signal.interface, &signal.member)
    }

    fn claim(&mut self, name: &str) -> String {
        self.next_unique += 1;
        let owner = format!(":1.{}", self.next_unique);
        let previous = self.owners.insert(name.to_string(), owner.clone());
        self.announce_owner(name, previous.unwrap_or_default(), owner.clone());
        owner
    }

    fn announce_owner(&self, name: &str, previous: String, owner: String) {
        let change = InboundSignal::from_endpoint(
            &daemon::name_owner_changed(),
            vec![Variant::from(name), Variant::Str(previous), Variant::Str(owner)],
        );
        self.route(None, &change);
    }

    fn route(&self, kind: Option<BusKind>, signal: &InboundSignal) -> usize {
        let mut delivered = 0;
        for conn in self.connections.values() {
            if kind.is_some_and(|k| k != conn.kind) {
                continue;
            }
            let matched = conn.rules.iter().any(|rule| self.rule_accepts(rule, signal));
            if matched && conn.inbox.send(Ok(InboundMessage::Signal(signal.clone()))).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

fn empty_return(call: &MethodCall) -> InboundMessage {
    InboundMessage::MethodReturn {
        reply_to: call.id,
        body: Vec::new(),
    }
}

/// In-process bus daemon serving both bus kinds.
///
/// Cheap to clone; clones share the same daemon.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `endpoint` with a handler computing the reply body.
    pub fn register_method<F>(&self, endpoint: &Endpoint, method: F)
    where
        F: Fn(&[Variant]) -> Result<Vec<Variant>, RemoteFailure> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .methods
            .insert(endpoint.clone(), Handler::Reply(Arc::new(method)));
    }

    /// Serve `endpoint` with a constant single-value reply.
    pub fn register_value(&self, endpoint: &Endpoint, value: impl Into<Variant>) {
        let value = value.into();
        self.register_method(endpoint, move |_| Ok(vec![value.clone()]));
    }

    /// Accept calls to `endpoint` without ever replying.
    pub fn register_silent(&self, endpoint: &Endpoint) {
        self.state
            .lock()
            .methods
            .insert(endpoint.clone(), Handler::Silent);
    }

    /// Make connecting to `kind` fail, or succeed again.
    pub fn set_reachable(&self, kind: BusKind, reachable: bool) {
        let mut state = self.state.lock();
        if reachable {
            state.unreachable.remove(&kind);
        } else {
            state.unreachable.insert(kind);
        }
    }

    /// Refuse every `AddMatch` with the given error name, or stop refusing.
    pub fn set_reject_matches(&self, error_name: Option<&str>) {
        self.state.lock().reject_matches = error_name.map(str::to_string);
    }

    /// Refuse every `RemoveMatch` with the given error name, or stop refusing.
    pub fn set_reject_removals(&self, error_name: Option<&str>) {
        self.state.lock().reject_removals = error_name.map(str::to_string);
    }

    /// Park daemon calls unanswered until [`MemoryBus::release_daemon_replies`].
    ///
    /// Parked calls still count as `AddMatch`/`RemoveMatch` requests.
    pub fn hold_daemon_replies(&self) {
        let mut state = self.state.lock();
        if state.held.is_none() {
            state.held = Some(Vec::new());
        }
    }

    /// Answer the parked daemon calls in arrival order and stop parking.
    pub fn release_daemon_replies(&self) {
        let mut state = self.state.lock();
        let held = state.held.take().unwrap_or_default();
        debug!(calls = held.len(), "Memory bus releasing held daemon calls");
        for (connection, call) in held {
            state.handle_daemon_call(connection, &call);
        }
    }

    /// Stamp signals with unique connection names instead of service names.
    pub fn set_unique_senders(&self, unique: bool) {
        self.state.lock().unique_senders = unique;
    }

    /// Give `name` a fresh unique owner, announcing the change.
    ///
    /// Returns the new owner.
    pub fn claim_name(&self, name: &str) -> String {
        self.state.lock().claim(name)
    }

    /// Release `name`, announcing that it has no owner.
    pub fn release_name(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(previous) = state.owners.remove(name) {
            state.announce_owner(name, previous, String::new());
        }
    }

    /// Current unique owner of `name`, if claimed.
    #[must_use]
    pub fn name_owner(&self, name: &str) -> Option<String> {
        self.state.lock().owners.get(name).cloned()
    }

    /// Deliver a signal to every connection with a matching rule.
    ///
    /// Returns the number of connections it reached.
    pub fn emit(&self, signal: InboundSignal) -> usize {
        self.state.lock().route(None, &signal)
    }

    /// Deliver a signal only to connections of one bus kind.
    pub fn emit_on(&self, kind: BusKind, signal: InboundSignal) -> usize {
        self.state.lock().route(Some(kind), &signal)
    }

    /// Emit the signal `endpoint` names, sent by its service.
    ///
    /// With unique senders the signal carries the service's owner, claiming
    /// the name first if nobody owns it.
    pub fn emit_from(&self, endpoint: &Endpoint, args: Vec<Variant>) -> usize {
        let mut state = self.state.lock();
        let mut signal = InboundSignal::from_endpoint(endpoint, args);
        if state.unique_senders && !endpoint.is_any_sender() {
            let claimed = state.owners.get(endpoint.service()).cloned();
            let owner = match claimed {
                Some(owner) => owner,
                None => state.claim(endpoint.service()),
            };
            signal.sender = Some(owner);
        }
        state.route(None, &signal)
    }

    /// Push a raw inbound message or transport error to every connection,
    /// bypassing match rules.
    pub fn inject(&self, message: Result<InboundMessage, TransportError>) {
        for conn in self.state.lock().connections.values() {
            let _ = conn.inbox.send(message.clone());
        }
    }

    /// Drop every connection as if the daemon went away.
    pub fn disconnect_all(&self) {
        let dropped = std::mem::take(&mut self.state.lock().connections);
        debug!(connections = dropped.len(), "Memory bus dropped all connections");
    }

    /// Open connections.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Match rules registered across all connections.
    #[must_use]
    pub fn match_count(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .map(|c| c.rules.len())
            .sum()
    }

    /// Match rules registered across all connections, in canonical form.
    #[must_use]
    pub fn match_rules(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut rules: Vec<String> = state
            .connections
            .values()
            .flat_map(|c| c.rules.iter().map(ToString::to_string))
            .collect();
        rules.sort();
        rules
    }

    #[must_use]
    pub fn add_match_requests(&self) -> usize {
        self.state.lock().add_match_requests
    }

    #[must_use]
    pub fn remove_match_requests(&self) -> usize {
        self.state.lock().remove_match_requests
    }

    /// Every method call received, daemon calls included, in arrival order.
    #[must_use]
    pub fn sent_calls(&self) -> Vec<MethodCall> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self, kind: BusKind) -> Result<Box<dyn BusTransport>, ConnectionError> {
        let mut state = self.state.lock();
        if state.unreachable.contains(&kind) {
            return Err(ConnectionError::Unreachable {
                bus: kind,
                reason: "connection refused".to_string(),
            });
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let matching = if state.unique_senders {
            SenderMatching::UniqueNames
        } else {
            SenderMatching::Exact
        };
        let (inbox, receiver) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            Connection {
                kind,
                inbox,
                rules: Vec::new(),
            },
        );
        debug!(bus = %kind, connection = id, "Memory bus accepted connection");

        Ok(Box::new(MemoryTransport {
            id,
            state: Arc::clone(&self.state),
            receiver,
            matching,
        }))
    }
}

/// One connection to a [`MemoryBus`].
pub struct MemoryTransport {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    receiver: mpsc::UnboundedReceiver<Result<InboundMessage, TransportError>>,
    /// Fixed when the connection is opened.
    matching: SenderMatching,
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn send(&mut self, call: MethodCall) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        state.sent.push(call.clone());
        state.handle_call(self.id, call);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundMessage, TransportError>> {
        self.receiver.recv().await
    }

    fn sender_matching(&self) -> SenderMatching {
        self.matching
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        // Rules go with the connection
        self.state.lock().connections.remove(&self.id);
    }
}
