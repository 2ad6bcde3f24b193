//! # Error Types
//!
//! The failure taxonomy of the bridge. Connection failures are terminal for
//! one bus handle; call and subscription failures are returned to the caller
//! and never escalate.

use crate::entities::BusKind;
use std::time::Duration;
use thiserror::Error;

/// The bus could not be reached when a handle was constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Transport or socket could not be established, or the daemon is unreachable.
    #[error("{bus} bus unreachable: {reason}")]
    Unreachable { bus: BusKind, reason: String },

    /// The dispatch context for the connection could not be started.
    #[error("failed to start dispatch context: {0}")]
    DispatchStart(String),
}

/// Arguments or addressing rejected before any I/O took place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedArguments {
    /// More positional arguments than a call can carry.
    #[error("too many arguments: {count} given, at most {max} allowed")]
    TooManyArguments { count: usize, max: usize },

    /// An absent value sits before a present one and cannot be marshalled.
    #[error("argument {position} is absent but later arguments are present")]
    AbsentArgument { position: usize },

    /// One of the four endpoint fields is empty.
    #[error("endpoint {field} must not be empty")]
    EmptyEndpointField { field: &'static str },

    /// The wildcard service cannot be the destination of a call.
    #[error("wildcard service cannot be a call destination")]
    WildcardDestination,

    /// The wire format cannot represent a value or name.
    #[error("cannot encode message: {0}")]
    Unencodable(String),
}

/// Failure of a remote method call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The bus handle is not usable.
    #[error("bus connection invalid")]
    ConnectionInvalid,

    /// No reply arrived within the timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The remote side replied with an application-level error.
    #[error("remote error {name}{}", detail(.message))]
    Remote {
        name: String,
        message: Option<String>,
    },

    /// The call was rejected locally before any I/O.
    #[error("malformed call: {0}")]
    Malformed(#[from] MalformedArguments),
}

impl CallError {
    /// Short label used in logs and metric labels.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConnectionInvalid => "connection_invalid",
            Self::Timeout(_) => "timeout",
            Self::Remote { .. } => "remote_error",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Failure of a subscription change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The bus handle is not usable.
    #[error("bus connection invalid")]
    ConnectionInvalid,

    /// The bus daemon refused the match-rule request.
    #[error("bus rejected subscription: {name}{}", detail(.message))]
    Rejected {
        name: String,
        message: Option<String>,
    },

    /// The daemon did not answer the match-rule request in time.
    #[error("subscription request timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint cannot name a signal stream.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(MalformedArguments),
}

/// Failure of `attach` on a signal router.
pub type AttachError = SubscriptionError;

/// Failure of `detach` on a signal router.
pub type DetachError = SubscriptionError;

fn detail(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

/// An inbound message that cannot be turned into a notification.
///
/// Never surfaced to observers; the router logs and drops it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMessage {
    /// Argument names do not line up with argument values.
    #[error("argument count mismatch: {names} names for {values} values")]
    ArgumentCountMismatch { names: usize, values: usize },

    /// The same argument name appears twice.
    #[error("duplicate argument name {0}")]
    DuplicateArgumentName(String),

    /// A header field required for routing is missing.
    #[error("missing header field {0}")]
    MissingHeader(&'static str),

    /// The body could not be decoded into variants.
    #[error("undecodable body: {0}")]
    UndecodableBody(String),
}
