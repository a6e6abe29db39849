//! Vector clocks for per-document causal progress.
//!
//! A [`VectorClock`] maps each actor (replica) to the highest sequence number
//! seen from it for one document. Merging two clocks takes the maximum per
//! actor, so merges commute, associate and are idempotent: peers converge no
//! matter how clock updates are reordered or duplicated.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use yrs::StateVector;

/// Identifier of a replica in a clock.
pub type ActorId = String;

/// Sequence number within an actor's stream of changes.
pub type SeqNum = u64;

/// Document id -> clock, for every document a repo knows about.
pub type ClockMap = HashMap<String, VectorClock>;

/// Actor id -> highest sequence number seen from that actor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    seen: BTreeMap<ActorId, SeqNum>,
}

impl VectorClock {
    /// Create an empty clock (has seen nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from the yrs state vector of a document.
    pub fn from_state_vector(sv: &StateVector) -> Self {
        let seen = sv
            .iter()
            .map(|(client, clock)| (client.to_string(), *clock as SeqNum))
            .collect();
        Self { seen }
    }

    /// Sequence number seen from an actor (0 if never seen)
    pub fn get(&self, actor: &str) -> SeqNum {
        self.seen.get(actor).copied().unwrap_or(0)
    }

    /// Record having seen `seq` from `actor`. Never moves backwards.
    pub fn observe(&mut self, actor: &str, seq: SeqNum) {
        match self.seen.get_mut(actor) {
            Some(current) if *current >= seq => {}
            Some(current) => *current = seq,
            None => {
                self.seen.insert(actor.to_string(), seq);
            }
        }
    }

    /// Merge another clock into this one (pointwise max).
    pub fn merge(&mut self, other: &VectorClock) {
        for (actor, seq) in &other.seen {
            self.observe(actor, *seq);
        }
    }

    /// Pointwise max of two clocks, leaving both inputs untouched.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// True if this clock has seen everything `other` has seen.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other.seen.iter().all(|(actor, seq)| self.get(actor) >= *seq)
    }

    /// True if neither clock dominates the other.
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Actors this clock knows about.
    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.seen.keys()
    }

    /// True if no actor has been seen
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Iterate `(actor, seq)` pairs in actor order
    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, &SeqNum)> {
        self.seen.iter()
    }
}

impl FromIterator<(ActorId, SeqNum)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ActorId, SeqNum)>>(iter: I) -> Self {
        let mut clock = VectorClock::new();
        for (actor, seq) in iter {
            clock.observe(&actor, seq);
        }
        clock
    }
}

/// Merge `new_clock` into an optional existing clock.
///
/// A missing clock behaves like the empty clock.
pub fn merge_clocks(old_clock: Option<&VectorClock>, new_clock: &VectorClock) -> VectorClock {
    match old_clock {
        Some(old) => old.merged(new_clock),
        None => new_clock.clone(),
    }
}
