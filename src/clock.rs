//! Vector clocks for causality tracking.
//!
//! Each node keeps one integer counter per known node. A clock `A` dominates
//! a clock `B` when every entry of `A` is `>=` the corresponding entry of
//! `B` (absent = 0) and at least one is strictly greater. Two clocks where
//! each side has some greater entry are concurrent; conflict resolution then
//! falls back to a deterministic tiebreak on origin IDs so every replica
//! picks the same winner.
//!
//! Wire and persisted forms are JSON maps from node ID to counter. Parsing
//! sanitizes: negative, fractional, or non-numeric counters coerce to 0 and
//! non-string keys are dropped, so a malformed peer clock can never poison
//! local state.

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Node identifier. Short opaque string, stable across restarts.
pub type NodeId = String;

/// Four-valued causal comparison between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every entry `<=` the other's and at least one `<`.
    Before,
    /// Every entry `>=` the other's and at least one `>`.
    After,
    /// Some entries greater on each side.
    Concurrent,
    /// All entries equal.
    Identical,
}

/// Dominance relation derived from [`ClockOrdering`], phrased from the
/// perspective of `self`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dominance {
    Dominates,
    Dominated,
    Concurrent,
    Identical,
}

/// Which side wins a deterministic tiebreak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// A vector clock: map from node ID to a monotonic counter.
///
/// Absent entries read as 0. Entries are kept in a `BTreeMap` so the
/// serialized form is canonical (stable key order), which the envelope's
/// MAC relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VectorClock {
    #[serde(flatten)]
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock with a single entry, used for messages that arrive without
    /// causal metadata.
    pub fn singleton(node_id: impl Into<NodeId>, counter: u64) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(node_id.into(), counter);
        Self { entries }
    }

    /// Counter for a node. Absent reads as 0.
    pub fn get(&self, node_id: &str) -> u64 {
        self.entries.get(node_id).copied().unwrap_or(0)
    }

    /// Number of known nodes in this clock.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no node has a counter.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Increment the counter for a node (absent starts at 0).
    pub fn increment(&mut self, node_id: &str) {
        let counter = self.entries.entry(node_id.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
    }

    /// Ensure a node has an entry (value >= 0) without advancing it.
    ///
    /// Every node ID seen in any inbound message gets a key in the local
    /// clock; this keeps comparisons over the same key universe.
    pub fn ensure(&mut self, node_id: &str) {
        self.entries.entry(node_id.to_string()).or_insert(0);
    }

    /// Pointwise maximum across the union of keys.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, counter) in &other.entries {
            let entry = self.entries.entry(node_id.clone()).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
    }

    /// Compare two clocks.
    ///
    /// Short-circuits to `Concurrent` as soon as both a strictly-smaller and
    /// a strictly-greater entry have been observed.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut some_less = false;
        let mut some_greater = false;

        for (node_id, counter) in &self.entries {
            let theirs = other.get(node_id);
            if *counter < theirs {
                some_less = true;
            } else if *counter > theirs {
                some_greater = true;
            }
            if some_less && some_greater {
                return ClockOrdering::Concurrent;
            }
        }
        for (node_id, theirs) in &other.entries {
            if self.entries.contains_key(node_id) {
                continue;
            }
            if *theirs > 0 {
                some_less = true;
            }
            if some_less && some_greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (some_less, some_greater) {
            (false, false) => ClockOrdering::Identical,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Dominance relation of `self` over `other`.
    pub fn dominance(&self, other: &VectorClock) -> Dominance {
        match self.compare(other) {
            ClockOrdering::After => Dominance::Dominates,
            ClockOrdering::Before => Dominance::Dominated,
            ClockOrdering::Concurrent => Dominance::Concurrent,
            ClockOrdering::Identical => Dominance::Identical,
        }
    }

    /// Deterministic winner between this clock (`self_id`'s side) and
    /// another (`other_id`'s side).
    ///
    /// Non-concurrent pairs are decided by causal order (identical keeps the
    /// local side). Concurrent pairs fall back to lexicographic order on the
    /// node IDs: the greater ID wins. The rule is a pure function of its
    /// inputs, so both ends of a conflict agree on the outcome.
    pub fn deterministic_winner(
        &self,
        other: &VectorClock,
        self_id: &str,
        other_id: &str,
    ) -> Winner {
        match self.compare(other) {
            ClockOrdering::After | ClockOrdering::Identical => Winner::Local,
            ClockOrdering::Before => Winner::Remote,
            ClockOrdering::Concurrent => {
                if self_id >= other_id {
                    Winner::Local
                } else {
                    Winner::Remote
                }
            }
        }
    }

    /// Parse a clock from loosely-typed JSON, sanitizing bad entries.
    ///
    /// `null` or a non-object yields an empty clock. Within an object,
    /// negative, fractional, NaN, or non-numeric counters coerce to 0.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut entries = BTreeMap::new();
        if let serde_json::Value::Object(map) = value {
            for (node_id, raw) in map {
                entries.insert(node_id.clone(), sanitize_counter(raw));
            }
        }
        Self { entries }
    }

    /// Serialize to a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Iterate over `(node_id, counter)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.entries.iter()
    }
}

fn sanitize_counter(raw: &serde_json::Value) -> u64 {
    match raw {
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                v
            } else if let Some(f) = n.as_f64() {
                // Negative, fractional, or NaN all coerce to 0.
                if f.is_finite() && f >= 0.0 {
                    f.trunc() as u64
                } else {
                    0
                }
            } else {
                0
            }
        }
        _ => 0,
    }
}

impl<'de> Deserialize<'de> for VectorClock {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ClockVisitor;

        impl<'de> Visitor<'de> for ClockVisitor {
            type Value = VectorClock;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of node IDs to counters")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = BTreeMap::new();
                while let Some((node_id, raw)) =
                    access.next_entry::<String, serde_json::Value>()?
                {
                    entries.insert(node_id, sanitize_counter(&raw));
                }
                Ok(VectorClock { entries })
            }

            fn visit_unit<E>(self) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(VectorClock::default())
            }
        }

        deserializer.deserialize_any(ClockVisitor)
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (node_id, counter)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", node_id, counter)?;
        }
        write!(f, "}}")
    }
}
