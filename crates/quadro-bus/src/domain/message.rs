//! Wire-level message model seen by the dispatch loop.
//!
//! Transports translate between these and the bus wire format. Replies refer
//! back to the [`CallId`] of the call that caused them; the id is opaque to
//! the transport, which keeps its own mapping to wire serials if it needs one.

use quadro_types::{Endpoint, MalformedMessage, MatchRule, NotificationPayload, Variant};
use std::fmt;

/// Opaque correlation id of one outstanding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An outgoing method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub id: CallId,
    pub endpoint: Endpoint,
    /// Positional arguments, already validated and stripped of trailing absent values.
    pub args: Vec<Variant>,
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Successful reply to a call.
    MethodReturn { reply_to: CallId, body: Vec<Variant> },
    /// Error reply to a call.
    Error {
        reply_to: CallId,
        name: String,
        message: Option<String>,
    },
    /// Broadcast signal.
    Signal(InboundSignal),
}

/// A broadcast signal as delivered by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    /// Sending connection, as reported by the bus.
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Variant>,
    /// Argument names, when the protocol carries them.
    pub arg_names: Option<Vec<String>>,
}

impl InboundSignal {
    pub fn new(
        sender: Option<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        args: Vec<Variant>,
    ) -> Self {
        Self {
            sender,
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            args,
            arg_names: None,
        }
    }

    /// A signal that an endpoint's service would emit.
    ///
    /// Wildcard endpoints produce a signal without a sender.
    pub fn from_endpoint(endpoint: &Endpoint, args: Vec<Variant>) -> Self {
        let sender = (!endpoint.is_any_sender()).then(|| endpoint.service().to_string());
        Self::new(
            sender,
            endpoint.path(),
            endpoint.interface(),
            endpoint.member(),
            args,
        )
    }

    /// Attach argument names.
    #[must_use]
    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.arg_names = Some(names);
        self
    }

    /// Build the notification payload: named keys when names are present,
    /// positional keys otherwise.
    pub fn payload(&self) -> Result<NotificationPayload, MalformedMessage> {
        match &self.arg_names {
            Some(names) => NotificationPayload::from_named(names.clone(), self.args.clone()),
            None => Ok(NotificationPayload::from_positional(self.args.clone())),
        }
    }
}

/// Collapse a reply body into the single value a call returns.
///
/// No values is `Empty`, one value is itself, several become a `List`.
#[must_use]
pub fn reply_value(mut body: Vec<Variant>) -> Variant {
    match body.len() {
        0 => Variant::Empty,
        1 => body.remove(0),
        _ => Variant::List(body),
    }
}

/// Addressing and error names of the bus daemon itself.
pub mod daemon {
    use super::*;

    pub const SERVICE: &str = "org.freedesktop.DBus";
    pub const PATH: &str = "/org/freedesktop/DBus";
    pub const INTERFACE: &str = "org.freedesktop.DBus";
    pub const ADD_MATCH: &str = "AddMatch";
    pub const REMOVE_MATCH: &str = "RemoveMatch";
    pub const GET_NAME_OWNER: &str = "GetNameOwner";
    pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";

    pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const ERROR_MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    pub const ERROR_MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    pub const ERROR_ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

    /// Endpoint of a daemon method.
    #[must_use]
    pub fn endpoint(member: &str) -> Endpoint {
        Endpoint::new(SERVICE, PATH, INTERFACE, member)
    }

    /// Call that registers a match rule.
    #[must_use]
    pub fn add_match(id: CallId, rule: &MatchRule) -> MethodCall {
        MethodCall {
            id,
            endpoint: endpoint(ADD_MATCH),
            args: vec![Variant::Str(rule.to_string())],
        }
    }

    /// Call that releases a match rule.
    #[must_use]
    pub fn remove_match(id: CallId, rule: &MatchRule) -> MethodCall {
        MethodCall {
            id,
            endpoint: endpoint(REMOVE_MATCH),
            args: vec![Variant::Str(rule.to_string())],
        }
    }

    /// Call that asks for the unique connection owning a well-known name.
    #[must_use]
    pub fn get_name_owner(id: CallId, name: &str) -> MethodCall {
        MethodCall {
            id,
            endpoint: endpoint(GET_NAME_OWNER),
            args: vec![Variant::from(name)],
        }
    }

    /// The signal the daemon broadcasts when a name changes hands.
    #[must_use]
    pub fn name_owner_changed() -> Endpoint {
        endpoint(NAME_OWNER_CHANGED)
    }

    /// Unpack a `NameOwnerChanged` signal into `(name, new_owner)`.
    ///
    /// `None` for any other signal. An empty new owner means the name was
    /// released.
    #[must_use]
    pub fn owner_change(signal: &InboundSignal) -> Option<(&str, &str)> {
        if signal.sender.as_deref() != Some(SERVICE)
            || signal.interface != INTERFACE
            || signal.member != NAME_OWNER_CHANGED
        {
            return None;
        }
        match signal.args.as_slice() {
            [name, _old, new] => Some((name.as_str()?, new.as_str()?)),
            _ => None,
        }
    }
}
