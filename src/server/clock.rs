//! Vector clocks for causal ordering of task mutations, plus the
//! per-client clock registry kept on the serving node.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::utils::TaskboardError;

/// Process ID type. Node IDs and client IDs share this space.
pub type ProcessId = i32;

/// Outcome of comparing two vector clocks.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ClockOrdering {
    /// Every counter here is <= the other's, at least one strictly.
    Less,

    /// Identical mappings (zeros included).
    Equal,

    /// Every counter here is >= the other's, at least one strictly.
    Greater,

    /// Neither clock dominates the other.
    Concurrent,
}

/// A vector clock owned by one process.
///
/// Absent entries count as zero on both sides of every comparison.
/// `Equal` is reserved for identical mappings; clocks that agree on all
/// counters but differ in which entries are present compare `Concurrent`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct VectorClock {
    /// Owning process; `increment` and `merge` bump this entry.
    owner: ProcessId,

    /// Per-process counters. The owner's entry is always present.
    entries: BTreeMap<ProcessId, i32>,
}

impl VectorClock {
    /// Creates a fresh clock with the owner's entry present at zero.
    pub fn new(owner: ProcessId) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(owner, 0);
        VectorClock { owner, entries }
    }

    /// Rebuilds a clock from raw entries (wire decoding). The owner's
    /// entry is materialized if the wire form lacked it.
    pub(crate) fn from_entries(
        owner: ProcessId,
        mut entries: BTreeMap<ProcessId, i32>,
    ) -> Self {
        entries.entry(owner).or_insert(0);
        VectorClock { owner, entries }
    }

    /// Owning process ID of this clock.
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Bumps the owner's entry by one.
    pub fn increment(&mut self) {
        *self.entries.entry(self.owner).or_insert(0) += 1;
    }

    /// Takes the pointwise max with `other`, then bumps the owner's entry.
    pub fn merge(&mut self, other: &VectorClock) {
        for (&id, &value) in &other.entries {
            let slot = self.entries.entry(id).or_insert(0);
            *slot = (*slot).max(value);
        }
        self.increment();
    }

    /// Counter for the given process, zero if absent.
    pub fn get(&self, id: ProcessId) -> i32 {
        self.entries.get(&id).copied().unwrap_or(0)
    }

    /// Compares two clocks under the partial order.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for &id in self.entries.keys().chain(other.entries.keys()) {
            let mine = self.get(id);
            let theirs = other.get(id);
            if mine < theirs {
                less = true;
            }
            if mine > theirs {
                greater = true;
            }
        }

        match (less, greater) {
            (true, true) => ClockOrdering::Concurrent,
            (true, false) => ClockOrdering::Less,
            (false, true) => ClockOrdering::Greater,
            (false, false) => {
                if self.entries == other.entries {
                    ClockOrdering::Equal
                } else {
                    ClockOrdering::Concurrent
                }
            }
        }
    }

    /// Raw per-process counters (wire encoding).
    pub fn entries(&self) -> &BTreeMap<ProcessId, i32> {
        &self.entries
    }
}

/// Per-client causal clocks maintained on the serving node. The owner of
/// every tracked clock is the originating client's ID.
#[derive(Debug, Default)]
pub(crate) struct ClientClocks {
    clocks: Mutex<HashMap<ProcessId, VectorClock>>,
}

impl ClientClocks {
    /// Creates an empty registry.
    pub(crate) fn new() -> Self {
        ClientClocks {
            clocks: Mutex::new(HashMap::new()),
        }
    }

    /// Bumps (creating at zero if absent) and returns the clock for a
    /// client. The lock covers exactly one entry's read-modify-write.
    pub(crate) fn advance(
        &self,
        client: ProcessId,
    ) -> Result<VectorClock, TaskboardError> {
        let mut clocks = self.clocks.lock()?;
        let clock = clocks
            .entry(client)
            .or_insert_with(|| VectorClock::new(client));
        clock.increment();
        Ok(clock.clone())
    }

    /// Drops all tracked clocks (used on demotion).
    pub(crate) fn clear(&self) -> Result<(), TaskboardError> {
        self.clocks.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_get() {
        let mut clock = VectorClock::new(3);
        assert_eq!(clock.get(3), 0);
        clock.increment();
        clock.increment();
        assert_eq!(clock.get(3), 2);
        assert_eq!(clock.get(99), 0);
    }

    #[test]
    fn merge_takes_pointwise_max() {
        let mut a = VectorClock::new(1);
        a.increment(); // {1: 1}
        let mut b = VectorClock::new(2);
        b.increment();
        b.increment(); // {2: 2}

        a.merge(&b); // max then owner bump
        assert_eq!(a.get(1), 2);
        assert_eq!(a.get(2), 2);
    }

    #[test]
    fn compare_less_and_greater() {
        let mut a = VectorClock::new(1); // {1: 0}
        let mut b = VectorClock::new(1);
        b.increment(); // {1: 1}
        assert_eq!(a.compare(&b), ClockOrdering::Less);
        assert_eq!(b.compare(&a), ClockOrdering::Greater);

        a.merge(&b); // {1: 2}
        assert_eq!(a.compare(&b), ClockOrdering::Greater);
    }

    #[test]
    fn compare_equal_identical_mappings() {
        let mut a = VectorClock::new(1);
        a.increment();
        let mut b = VectorClock::new(1);
        b.increment();
        assert_eq!(a.compare(&b), ClockOrdering::Equal);
    }

    #[test]
    fn compare_concurrent_disjoint_progress() {
        let mut a = VectorClock::new(1);
        a.increment(); // {1: 1}
        let mut b = VectorClock::new(2);
        b.increment(); // {2: 1}
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn fresh_clocks_of_different_owners_are_concurrent() {
        // both owners present at zero: value-equal yet not identical
        let a = VectorClock::new(1);
        let b = VectorClock::new(2);
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn absent_entries_count_as_zero_on_both_sides() {
        // {1: 0} vs. {} must give the same verdict from either side
        let a = VectorClock::new(1);
        let b = VectorClock::from_entries(2, BTreeMap::new()); // {2: 0}
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn from_entries_materializes_owner() {
        let clock = VectorClock::from_entries(5, BTreeMap::new());
        assert_eq!(clock.get(5), 0);
        assert!(clock.entries().contains_key(&5));
    }

    #[test]
    fn advance_creates_then_bumps() -> Result<(), TaskboardError> {
        let clocks = ClientClocks::new();
        let first = clocks.advance(7)?;
        assert_eq!(first.owner(), 7);
        assert_eq!(first.get(7), 1);
        let second = clocks.advance(7)?;
        assert_eq!(second.get(7), 2);

        clocks.clear()?;
        let fresh = clocks.advance(7)?;
        assert_eq!(fresh.get(7), 1);
        Ok(())
    }
}
