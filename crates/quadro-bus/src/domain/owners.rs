//! Well-known name ownership.
//!
//! Signals carry the sender's unique connection name (`:1.42`), while
//! endpoints name services by their well-known name. The table records which
//! unique name currently owns each well-known name that some subscribed
//! endpoint refers to, so inbound signals can be matched to the right
//! service.

use super::message::daemon;
use std::collections::BTreeMap;

#[derive(Debug)]
struct Tracked {
    owner: Option<String>,
    /// Subscribed endpoints naming this service.
    endpoints: usize,
}

/// Well-known name to current unique owner.
#[derive(Debug, Default)]
pub struct OwnerTable {
    names: BTreeMap<String, Tracked>,
}

impl OwnerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a service name has to be resolved before signals can be
    /// matched against it. Unique names and the daemon itself are used as-is.
    #[must_use]
    pub fn needs_resolution(service: &str) -> bool {
        !service.starts_with(':') && service != daemon::SERVICE
    }

    /// Count one more endpoint naming `name`. Returns `true` when the name
    /// was not tracked before and its owner has to be looked up.
    pub fn track(&mut self, name: &str) -> bool {
        match self.names.get_mut(name) {
            Some(tracked) => {
                tracked.endpoints += 1;
                false
            }
            None => {
                self.names.insert(
                    name.to_string(),
                    Tracked {
                        owner: None,
                        endpoints: 1,
                    },
                );
                true
            }
        }
    }

    /// Count one endpoint fewer, forgetting the name after the last one.
    pub fn untrack(&mut self, name: &str) {
        if let Some(tracked) = self.names.get_mut(name) {
            tracked.endpoints = tracked.endpoints.saturating_sub(1);
            if tracked.endpoints == 0 {
                self.names.remove(name);
            }
        }
    }

    /// Record a new owner, or `None` when the name has no owner. Names
    /// nobody tracks are ignored; returns whether the name was tracked.
    pub fn set_owner(&mut self, name: &str, owner: Option<String>) -> bool {
        match self.names.get_mut(name) {
            Some(tracked) => {
                tracked.owner = owner.filter(|o| !o.is_empty());
                true
            }
            None => false,
        }
    }

    /// Current unique owner of a tracked name.
    #[must_use]
    pub fn owner(&self, name: &str) -> Option<&str> {
        self.names.get(name).and_then(|t| t.owner.as_deref())
    }

    #[must_use]
    pub fn is_tracked(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}
