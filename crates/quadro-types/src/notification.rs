//! # Notifications
//!
//! Inbound broadcast signals are re-delivered to local observers as a
//! key-value [`NotificationPayload`], one [`Notification`] per observer.

use crate::entities::{BusKind, Endpoint};
use crate::errors::MalformedMessage;
use crate::values::Variant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Generate an observer id for callers that have none of their own.
#[must_use]
pub fn random_observer_id() -> String {
    format!("observer-{}", uuid::Uuid::new_v4())
}

/// Signal arguments keyed by name, or by position when the bus carries no names.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationPayload {
    entries: BTreeMap<String, Variant>,
}

impl NotificationPayload {
    /// Key each value by its position: `"0"`, `"1"`, ...
    #[must_use]
    pub fn from_positional(values: Vec<Variant>) -> Self {
        let entries = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect();
        Self { entries }
    }

    /// Key each value by the name the protocol carried for it.
    pub fn from_named(names: Vec<String>, values: Vec<Variant>) -> Result<Self, MalformedMessage> {
        if names.len() != values.len() {
            return Err(MalformedMessage::ArgumentCountMismatch {
                names: names.len(),
                values: values.len(),
            });
        }
        let mut entries = BTreeMap::new();
        for (name, value) in names.into_iter().zip(values) {
            if entries.contains_key(&name) {
                return Err(MalformedMessage::DuplicateArgumentName(name));
            }
            entries.insert(name, value);
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variant)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, Variant> {
        self.entries
    }
}

/// One delivery of a matched broadcast signal to one observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Bus the signal arrived on.
    pub bus: BusKind,
    /// Observer this delivery is addressed to.
    pub observer_id: String,
    /// Subscribed endpoint that matched.
    pub endpoint: Endpoint,
    pub payload: NotificationPayload,
}

impl Notification {
    /// JSON form handed to the web view.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
