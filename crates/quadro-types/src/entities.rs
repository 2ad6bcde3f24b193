//! # Addressing Entities
//!
//! Four-part endpoint addressing, the two standard bus instances, and the
//! match rules the bus daemon uses to route broadcast signals.

use crate::errors::MalformedArguments;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Service name standing for "any sender" on a signal endpoint.
///
/// Only meaningful for subscriptions; a method call always needs a concrete
/// destination.
pub const ANY_SENDER: &str = "*";

/// The two standard bus instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusKind {
    /// The host-wide bus.
    System,
    /// The per-user-session bus.
    Session,
}

impl BusKind {
    /// Short label used in logs and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressing tuple `(service, path, interface, member)`.
///
/// Identifies either a remote method or a broadcast signal. Equality is
/// structural over the four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    service: String,
    path: String,
    interface: String,
    member: String,
}

impl Endpoint {
    /// Create an endpoint. No validation happens here; see [`Endpoint::validate`].
    pub fn new(
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
        }
    }

    /// Signal endpoint matching the given path, interface and member from any sender.
    pub fn any_sender(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self::new(ANY_SENDER, path, interface, member)
    }

    /// Owning service (well-known or unique bus name), or [`ANY_SENDER`].
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Object path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Method or signal name.
    #[must_use]
    pub fn member(&self) -> &str {
        &self.member
    }

    /// Whether this endpoint matches signals from any sender.
    #[must_use]
    pub fn is_any_sender(&self) -> bool {
        self.service == ANY_SENDER
    }

    /// Check that all four fields are non-empty.
    pub fn validate(&self) -> Result<(), MalformedArguments> {
        let fields = [
            ("service", &self.service),
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
        ];
        for (name, value) in fields {
            if value.is_empty() {
                return Err(MalformedArguments::EmptyEndpointField { field: name });
            }
        }
        Ok(())
    }

    /// Validate for use as a method-call destination.
    ///
    /// Stricter than [`Endpoint::validate`]: the wildcard service is rejected.
    pub fn validate_for_call(&self) -> Result<(), MalformedArguments> {
        self.validate()?;
        if self.is_any_sender() {
            return Err(MalformedArguments::WildcardDestination);
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}.{}",
            self.service, self.path, self.interface, self.member
        )
    }
}

/// A bus daemon match rule selecting one signal stream.
///
/// The canonical string form is what `AddMatch` / `RemoveMatch` expect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchRule {
    sender: Option<String>,
    path: String,
    interface: String,
    member: String,
}

impl MatchRule {
    /// Build the signal match rule for an endpoint.
    ///
    /// The sender clause is left out for wildcard endpoints.
    #[must_use]
    pub fn for_endpoint(endpoint: &Endpoint) -> Self {
        Self {
            sender: (!endpoint.is_any_sender()).then(|| endpoint.service.clone()),
            path: endpoint.path.clone(),
            interface: endpoint.interface.clone(),
            member: endpoint.member.clone(),
        }
    }

    /// Sender clause, if any.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Whether a signal with the given header fields satisfies this rule.
    #[must_use]
    pub fn matches(
        &self,
        sender: Option<&str>,
        path: &str,
        interface: &str,
        member: &str,
    ) -> bool {
        let sender_ok = match (&self.sender, sender) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected == actual,
            (Some(_), None) => false,
        };
        sender_ok && self.path == path && self.interface == interface && self.member == member
    }

    /// Parse the canonical form produced by `Display`.
    ///
    /// Only the keys this crate emits are understood; anything else yields `None`.
    #[must_use]
    pub fn parse(rule: &str) -> Option<Self> {
        let mut sender = None;
        let mut path = None;
        let mut interface = None;
        let mut member = None;
        let mut is_signal = false;

        for clause in split_clauses(rule) {
            let (key, value) = clause.split_once('=')?;
            let value = unquote(value)?;
            match key.trim() {
                "type" => is_signal = value == "signal",
                "sender" => sender = Some(value),
                "path" => path = Some(value),
                "interface" => interface = Some(value),
                "member" => member = Some(value),
                _ => return None,
            }
        }

        if !is_signal {
            return None;
        }
        Some(Self {
            sender,
            path: path?,
            interface: interface?,
            member: member?,
        })
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("type='signal'")?;
        if let Some(sender) = &self.sender {
            write!(f, ",sender='{}'", escape(sender))?;
        }
        write!(
            f,
            ",path='{}',interface='{}',member='{}'",
            escape(&self.path),
            escape(&self.interface),
            escape(&self.member)
        )
    }
}

// Match rule values are single-quoted; a literal quote is written as '\''.
fn escape(value: &str) -> String {
    value.replace('\'', r"'\''")
}

fn unquote(value: &str) -> Option<String> {
    let value = value.trim();
    let inner = value.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace(r"'\''", "'"))
}

fn split_clauses(rule: &str) -> Vec<&str> {
    let mut clauses = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in rule.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if !quoted => escaped = true,
            '\'' => quoted = !quoted,
            ',' if !quoted => {
                clauses.push(&rule[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < rule.len() {
        clauses.push(&rule[start..]);
    }
    clauses
}
