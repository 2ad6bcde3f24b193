//! Correlation table for outstanding calls.
//!
//! Every call that reached the transport has exactly one entry until it is
//! resolved by a reply, expired by its deadline, or drained at shutdown.
//! Whichever happens first consumes the entry, so at most one outcome is
//! ever produced per call.

use super::message::CallId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Pending<T> {
    /// `None` when `now + timeout` is beyond what `Instant` can represent.
    deadline: Option<Instant>,
    timeout: Duration,
    waiter: T,
}

/// Outstanding calls keyed by [`CallId`], each carrying a waiter of type `T`.
pub struct PendingCalls<T> {
    entries: HashMap<CallId, Pending<T>>,
}

impl<T> Default for PendingCalls<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingCalls<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Track a call that must be answered by `now + timeout`.
    pub fn insert(&mut self, id: CallId, now: Instant, timeout: Duration, waiter: T) {
        let deadline = now.checked_add(timeout);
        self.entries.insert(
            id,
            Pending {
                deadline,
                timeout,
                waiter,
            },
        );
    }

    /// Take the waiter for a reply. `None` for unknown or already-expired ids.
    pub fn resolve(&mut self, id: CallId) -> Option<T> {
        self.entries.remove(&id).map(|p| p.waiter)
    }

    pub fn get_mut(&mut self, id: CallId) -> Option<&mut T> {
        self.entries.get_mut(&id).map(|p| &mut p.waiter)
    }

    /// Earliest deadline among outstanding calls.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|p| p.deadline).min()
    }

    /// Remove and return every call whose deadline is at or before `now`,
    /// together with the timeout it was given.
    pub fn expire(&mut self, now: Instant) -> Vec<(CallId, Duration, T)> {
        let expired: Vec<CallId> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                self.entries
                    .remove(&id)
                    .map(|p| (id, p.timeout, p.waiter))
            })
            .collect()
    }

    /// Remove every outstanding call.
    pub fn drain(&mut self) -> Vec<(CallId, T)> {
        self.entries.drain().map(|(id, p)| (id, p.waiter)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
