//! Subscription bookkeeping.
//!
//! Maps each subscribed [`Endpoint`] to its set of observer ids and tracks
//! whether the bus-level match rule for it is requested or active. The table
//! only decides; the dispatch loop performs the bus traffic a decision calls
//! for. Exactly one match rule exists per endpoint no matter how many
//! observers watch it.

use super::message::{CallId, InboundSignal};
use super::owners::OwnerTable;
use quadro_types::Endpoint;
use std::collections::{BTreeMap, BTreeSet};

/// How the sender of an inbound signal is compared with an endpoint's service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderMatching {
    /// The signal's sender must equal the endpoint's service.
    #[default]
    Exact,
    /// Signals carry unique connection names. A well-known service matches
    /// when the sender is its current owner in the [`OwnerTable`]; a service
    /// with no known owner matches nothing.
    UniqueNames,
}

/// Bus-level state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// `AddMatch` sent, reply outstanding.
    Requested(CallId),
    /// Match rule registered; signals are routed.
    Active,
}

#[derive(Debug)]
struct Entry {
    state: MatchState,
    observers: BTreeSet<String>,
}

/// What `attach` has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPlan {
    /// Pair already registered; nothing to do.
    AlreadyAttached,
    /// Endpoint active; add the observer locally.
    Joined,
    /// A match request is in flight; wait for it.
    AwaitMatch(CallId),
    /// First observer; a match rule must be requested.
    RequestMatch,
}

/// What `detach` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachPlan {
    /// Pair was never attached; nothing changed.
    NotAttached,
    /// Observer removed; others remain.
    Removed,
    /// Last observer removed; the match rule must be released.
    ReleaseMatch,
    /// The endpoint's match request is still in flight; the observer may be
    /// waiting on it.
    Pending(CallId),
}

/// Read-only view of one active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub endpoint: Endpoint,
    pub observers: Vec<String>,
}

/// Endpoint to observer-set table.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: BTreeMap<Endpoint, Entry>,
}

impl SubscriptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide how to attach `observer` to `endpoint`. Does not mutate.
    #[must_use]
    pub fn plan_attach(&self, endpoint: &Endpoint, observer: &str) -> AttachPlan {
        match self.entries.get(endpoint) {
            None => AttachPlan::RequestMatch,
            Some(Entry {
                state: MatchState::Requested(id),
                ..
            }) => AttachPlan::AwaitMatch(*id),
            Some(entry) if entry.observers.contains(observer) => AttachPlan::AlreadyAttached,
            Some(_) => AttachPlan::Joined,
        }
    }

    /// Add an observer to an active endpoint. Returns `false` if the endpoint
    /// is not active or the observer was already present.
    pub fn join(&mut self, endpoint: &Endpoint, observer: &str) -> bool {
        match self.entries.get_mut(endpoint) {
            Some(entry) if entry.state == MatchState::Active => {
                entry.observers.insert(observer.to_string())
            }
            _ => false,
        }
    }

    /// Record that a match request for `endpoint` was sent as call `id`.
    pub fn begin_match(&mut self, endpoint: Endpoint, id: CallId) {
        self.entries.insert(
            endpoint,
            Entry {
                state: MatchState::Requested(id),
                observers: BTreeSet::new(),
            },
        );
    }

    /// The match request succeeded: activate the endpoint with its observers.
    pub fn complete_match<I>(&mut self, endpoint: &Endpoint, observers: I)
    where
        I: IntoIterator<Item = String>,
    {
        let entry = self.entries.entry(endpoint.clone()).or_insert_with(|| Entry {
            state: MatchState::Active,
            observers: BTreeSet::new(),
        });
        entry.state = MatchState::Active;
        entry.observers.extend(observers);
    }

    /// The match request failed, timed out or lost all its observers:
    /// forget the endpoint. Returns whether a requested entry was removed.
    pub fn abandon_match(&mut self, endpoint: &Endpoint) -> bool {
        match self.entries.get(endpoint) {
            Some(Entry {
                state: MatchState::Requested(_),
                ..
            }) => self.entries.remove(endpoint).is_some(),
            _ => false,
        }
    }

    /// Remove `observer` from `endpoint`, dropping the endpoint when it empties.
    pub fn detach(&mut self, endpoint: &Endpoint, observer: &str) -> DetachPlan {
        let Some(entry) = self.entries.get_mut(endpoint) else {
            return DetachPlan::NotAttached;
        };
        if let MatchState::Requested(id) = entry.state {
            return DetachPlan::Pending(id);
        }
        if !entry.observers.remove(observer) {
            return DetachPlan::NotAttached;
        }
        if entry.observers.is_empty() {
            self.entries.remove(endpoint);
            DetachPlan::ReleaseMatch
        } else {
            DetachPlan::Removed
        }
    }

    /// Active endpoints matching an inbound signal, with their observers.
    pub fn route<'a>(
        &'a self,
        signal: &'a InboundSignal,
        matching: SenderMatching,
        owners: &'a OwnerTable,
    ) -> impl Iterator<Item = (&'a Endpoint, &'a BTreeSet<String>)> + 'a {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == MatchState::Active)
            .filter(move |(endpoint, _)| endpoint_matches(endpoint, signal, matching, owners))
            .map(|(endpoint, entry)| (endpoint, &entry.observers))
    }

    /// Observers registered on an active endpoint.
    #[must_use]
    pub fn observer_count(&self, endpoint: &Endpoint) -> usize {
        match self.entries.get(endpoint) {
            Some(entry) if entry.state == MatchState::Active => entry.observers.len(),
            _ => 0,
        }
    }

    /// Endpoints with a registered or requested match rule.
    #[must_use]
    pub fn match_count(&self) -> usize {
        self.entries.len()
    }

    /// Active subscriptions, ordered by endpoint.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == MatchState::Active)
            .map(|(endpoint, entry)| SubscriptionInfo {
                endpoint: endpoint.clone(),
                observers: entry.observers.iter().cloned().collect(),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn endpoint_matches(
    endpoint: &Endpoint,
    signal: &InboundSignal,
    matching: SenderMatching,
    owners: &OwnerTable,
) -> bool {
    if endpoint.path() != signal.path
        || endpoint.interface() != signal.interface
        || endpoint.member() != signal.member
    {
        return false;
    }
    if endpoint.is_any_sender() {
        return true;
    }
    let Some(sender) = signal.sender.as_deref() else {
        return false;
    };
    match matching {
        SenderMatching::Exact => sender == endpoint.service(),
        SenderMatching::UniqueNames => {
            sender == endpoint.service() || owners.owner(endpoint.service()) == Some(sender)
        }
    }
}
