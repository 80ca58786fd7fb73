//! Bounded per-path version history.
//!
//! Every committed record is appended here; once superseded by a later
//! write it remains as a past version. The history is ordered by causal
//! dominance: the most dominant entry (normally the current head) sits
//! first, the most dominated last, and concurrent or identical neighbours
//! are broken by origin in lexicographic order. Overflow evicts the tail,
//! the most dominated entry.
//!
//! The history is an ephemeral aid for rollback tooling; it is not
//! persisted across restarts.

use crate::clock::Dominance;
use crate::store::Record;
use std::collections::HashMap;

/// Per-path bounded version history.
///
/// Not internally synchronized; lives inside the node's primary lock.
#[derive(Debug)]
pub struct VersionStore {
    max_versions: usize,
    histories: HashMap<String, Vec<Record>>,
}

impl VersionStore {
    /// Create a store keeping at most `max_versions` entries per path.
    pub fn new(max_versions: usize) -> Self {
        Self {
            max_versions: max_versions.max(1),
            histories: HashMap::new(),
        }
    }

    /// Insert a superseded record at its causal position.
    pub fn append(&mut self, path: &str, record: Record) {
        let history = self.histories.entry(path.to_string()).or_default();

        // First slot the new record does not rank below: either it
        // dominates the entry there, or they are causally unordered and the
        // new record's origin sorts first.
        let position = history
            .iter()
            .position(|existing| match record.vector_clock.dominance(&existing.vector_clock) {
                Dominance::Dominates => true,
                Dominance::Dominated => false,
                Dominance::Concurrent | Dominance::Identical => record.origin <= existing.origin,
            })
            .unwrap_or(history.len());

        history.insert(position, record);

        if history.len() > self.max_versions {
            history.truncate(self.max_versions);
        }
    }

    /// The ordered history for a path (most dominant first).
    pub fn history(&self, path: &str) -> Vec<Record> {
        self.histories.get(path).cloned().unwrap_or_default()
    }

    /// Drop the history for a path.
    pub fn clear(&mut self, path: &str) {
        self.histories.remove(path);
    }

    /// Number of paths with recorded history.
    pub fn paths(&self) -> usize {
        self.histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use serde_json::json;

    fn record(counter: u64, origin: &str) -> Record {
        let mut clock = VectorClock::new();
        for _ in 0..counter {
            clock.increment(origin);
        }
        Record::new(json!({"v": counter}), clock, origin)
    }

    #[test]
    fn test_empty_history() {
        let versions = VersionStore::new(10);
        assert!(versions.history("nowhere").is_empty());
        assert_eq!(versions.paths(), 0);
    }

    #[test]
    fn test_dominant_first() {
        let mut versions = VersionStore::new(10);
        versions.append("k", record(1, "n1"));
        versions.append("k", record(3, "n1"));
        versions.append("k", record(2, "n1"));

        let history = versions.history("k");
        let counters: Vec<u64> = history
            .iter()
            .map(|r| r.vector_clock.get("n1"))
            .collect();
        assert_eq!(counters, vec![3, 2, 1]);
    }

    #[test]
    fn test_concurrent_broken_by_origin() {
        let mut versions = VersionStore::new(10);
        // Clocks {b:1} and {a:1} are concurrent; "a" sorts first.
        versions.append("k", record(1, "b"));
        versions.append("k", record(1, "a"));

        let history = versions.history("k");
        assert_eq!(history[0].origin, "a");
        assert_eq!(history[1].origin, "b");
    }

    #[test]
    fn test_overflow_drops_most_dominated() {
        let mut versions = VersionStore::new(5);
        for counter in 1..=6 {
            versions.append("k", record(counter, "n1"));
        }

        let history = versions.history("k");
        assert_eq!(history.len(), 5);
        // The smallest-causality entry (counter 1) has been evicted.
        let counters: Vec<u64> = history
            .iter()
            .map(|r| r.vector_clock.get("n1"))
            .collect();
        assert_eq!(counters, vec![6, 5, 4, 3, 2]);
    }

    #[test]
    fn test_clear() {
        let mut versions = VersionStore::new(10);
        versions.append("k", record(1, "n1"));
        versions.clear("k");
        assert!(versions.history("k").is_empty());
    }

    #[test]
    fn test_paths_are_independent() {
        let mut versions = VersionStore::new(2);
        versions.append("a", record(1, "n1"));
        versions.append("b", record(1, "n1"));
        versions.append("b", record(2, "n1"));
        versions.append("b", record(3, "n1"));

        assert_eq!(versions.history("a").len(), 1);
        assert_eq!(versions.history("b").len(), 2);
        assert_eq!(versions.paths(), 2);
    }

    #[test]
    fn test_max_versions_floor() {
        let mut versions = VersionStore::new(0);
        versions.append("k", record(1, "n1"));
        versions.append("k", record(2, "n1"));
        // Floor of 1 applies.
        assert_eq!(versions.history("k").len(), 1);
    }

    #[test]
    fn test_consecutive_entries_causally_ordered() {
        let mut versions = VersionStore::new(10);
        versions.append("k", record(2, "n1"));
        versions.append("k", record(1, "b"));
        versions.append("k", record(1, "a"));
        versions.append("k", record(3, "n1"));

        let history = versions.history("k");
        for pair in history.windows(2) {
            let relation = pair[0].vector_clock.dominance(&pair[1].vector_clock);
            let ordered = match relation {
                Dominance::Dominates => true,
                Dominance::Concurrent | Dominance::Identical => {
                    pair[0].origin <= pair[1].origin
                }
                Dominance::Dominated => false,
            };
            assert!(ordered, "history out of causal order");
        }
    }
}
