//! Path-scoped conflict resolution.
//!
//! Given a path and two records, the resolver picks a single winner or
//! computes a field-wise merge. Deletion handling runs before strategy
//! dispatch: a tombstone (JSON `null` value) wins against a concurrent
//! update and loses only to an update that causally dominates it.
//!
//! Strategy selection walks path rules by longest matching prefix. Two
//! match forms are accepted: segment-wise prefixes of the path (tried
//! longest first), and the legacy `starts_with(prefix + "/")`-or-equal
//! form; a segment-form hit takes precedence. With no rule, the default
//! strategy applies.
//!
//! Every choice here consults vector clocks and origin IDs only, never
//! wall-clock time, so both sides of any conflict agree on the outcome.

use crate::clock::{Dominance, Winner};
use crate::config::{ConflictConfig, Strategy};
use crate::error::Result;
use crate::store::Record;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// A user-supplied conflict resolver.
///
/// Implemented for any `Fn(&str, &Record, &Record) -> Result<Record>`
/// closure. Failures fall back to `vector-dominance`.
pub trait ResolveConflict: Send + Sync {
    fn resolve(&self, path: &str, local: &Record, remote: &Record) -> Result<Record>;
}

impl<F> ResolveConflict for F
where
    F: Fn(&str, &Record, &Record) -> Result<Record> + Send + Sync,
{
    fn resolve(&self, path: &str, local: &Record, remote: &Record) -> Result<Record> {
        self(path, local, remote)
    }
}

/// Path-scoped strategy selection and resolution.
pub struct ConflictResolver {
    default_strategy: Strategy,
    path_strategies: RwLock<HashMap<String, Strategy>>,
    custom_resolvers: RwLock<HashMap<String, Arc<dyn ResolveConflict>>>,
}

impl ConflictResolver {
    /// Build a resolver from config.
    pub fn new(config: &ConflictConfig) -> Self {
        Self {
            default_strategy: config.default_strategy,
            path_strategies: RwLock::new(config.path_strategies.clone()),
            custom_resolvers: RwLock::new(HashMap::new()),
        }
    }

    /// Set the strategy for a path prefix.
    pub fn set_strategy(&self, prefix: &str, strategy: Strategy) {
        self.path_strategies
            .write()
            .expect("strategy table poisoned")
            .insert(prefix.to_string(), strategy);
    }

    /// Register a custom resolver for a path prefix and route the prefix to
    /// the `custom` strategy.
    pub fn register_custom(&self, prefix: &str, resolver: Arc<dyn ResolveConflict>) {
        self.custom_resolvers
            .write()
            .expect("resolver table poisoned")
            .insert(prefix.to_string(), resolver);
        self.set_strategy(prefix, Strategy::Custom);
    }

    /// Resolve a conflict between the locally stored record and an incoming
    /// one. Always returns a record; resolution never fails outward.
    pub fn resolve(&self, path: &str, local: &Record, remote: &Record) -> Record {
        // Deletions are decided first, whatever the configured strategy.
        match (local.is_tombstone(), remote.is_tombstone()) {
            (true, true) => return vector_dominance(local, remote),
            (true, false) => {
                // Deletion wins unless the update causally supersedes it.
                return if remote.vector_clock.dominance(&local.vector_clock)
                    == Dominance::Dominates
                {
                    remote.clone()
                } else {
                    local.clone()
                };
            }
            (false, true) => {
                return if local.vector_clock.dominance(&remote.vector_clock)
                    == Dominance::Dominates
                {
                    local.clone()
                } else {
                    remote.clone()
                };
            }
            (false, false) => {}
        }

        let strategy = self.strategy_for(path);
        crate::metrics::record_conflict(path, &strategy.to_string());
        debug!(path, %strategy, "Resolving concurrent write");

        match strategy {
            Strategy::VectorDominance => vector_dominance(local, remote),
            Strategy::FirstWriteWins => first_write_wins(local, remote),
            Strategy::MergeFields => merge_fields(local, remote),
            Strategy::Custom => self.run_custom(path, local, remote),
        }
    }

    /// Strategy for a path: longest segment prefix, then legacy form, then
    /// the default.
    pub fn strategy_for(&self, path: &str) -> Strategy {
        let table = self.path_strategies.read().expect("strategy table poisoned");
        if table.is_empty() {
            return self.default_strategy;
        }

        // Form (a): decreasing-length segment prefixes of the path.
        let segments: Vec<&str> = path.split('/').collect();
        for end in (1..=segments.len()).rev() {
            let candidate = segments[..end].join("/");
            if let Some(strategy) = table.get(candidate.as_str()) {
                return *strategy;
            }
        }

        // Form (b): legacy startsWith(prefix + "/") or equality, longest
        // registered prefix first.
        let mut legacy: Option<(&String, &Strategy)> = None;
        for (prefix, strategy) in table.iter() {
            if path == prefix.as_str() || path.starts_with(&format!("{}/", prefix)) {
                let longer = legacy.map(|(p, _)| prefix.len() > p.len()).unwrap_or(true);
                if longer {
                    legacy = Some((prefix, strategy));
                }
            }
        }
        legacy.map(|(_, s)| *s).unwrap_or(self.default_strategy)
    }

    fn run_custom(&self, path: &str, local: &Record, remote: &Record) -> Record {
        let resolver = {
            let table = self.custom_resolvers.read().expect("resolver table poisoned");
            lookup_prefix(&table, path)
        };

        let Some(resolver) = resolver else {
            warn!(path, "No custom resolver registered; using vector-dominance");
            return vector_dominance(local, remote);
        };

        match resolver.resolve(path, local, remote) {
            Ok(record) => record,
            Err(e) => {
                warn!(path, error = %e, "Custom resolver failed; using vector-dominance");
                vector_dominance(local, remote)
            }
        }
    }
}

fn lookup_prefix(
    table: &HashMap<String, Arc<dyn ResolveConflict>>,
    path: &str,
) -> Option<Arc<dyn ResolveConflict>> {
    let segments: Vec<&str> = path.split('/').collect();
    for end in (1..=segments.len()).rev() {
        let candidate = segments[..end].join("/");
        if let Some(resolver) = table.get(candidate.as_str()) {
            return Some(Arc::clone(resolver));
        }
    }
    None
}

/// Causally newest wins; concurrent falls to the deterministic origin
/// tiebreak (greater origin wins).
fn vector_dominance(local: &Record, remote: &Record) -> Record {
    match local.vector_clock.deterministic_winner(
        &remote.vector_clock,
        &local.origin,
        &remote.origin,
    ) {
        Winner::Local => local.clone(),
        Winner::Remote => remote.clone(),
    }
}

/// Causally oldest wins; the concurrent tiebreak is reversed (smaller
/// origin wins). Applied pairwise, repeated resolution converges on the
/// record authored by the smallest origin among a concurrent set.
fn first_write_wins(local: &Record, remote: &Record) -> Record {
    match local.vector_clock.dominance(&remote.vector_clock) {
        Dominance::Dominates => remote.clone(),
        Dominance::Dominated => local.clone(),
        Dominance::Identical => local.clone(),
        Dominance::Concurrent => {
            if local.origin <= remote.origin {
                local.clone()
            } else {
                remote.clone()
            }
        }
    }
}

/// Field-wise merge of two object values.
///
/// Keys on one side only are copied. Keys on both sides are decided by the
/// records' clock relation, with the origin tiebreak for concurrent pairs.
/// Non-object inputs fall back to vector-dominance. The merged record
/// carries the merged clock and the deterministic winner's origin.
fn merge_fields(local: &Record, remote: &Record) -> Record {
    let (Value::Object(local_map), Value::Object(remote_map)) = (&local.value, &remote.value)
    else {
        return vector_dominance(local, remote);
    };

    let local_field_wins = match local.vector_clock.dominance(&remote.vector_clock) {
        Dominance::Dominates | Dominance::Identical => true,
        Dominance::Dominated => false,
        Dominance::Concurrent => local.origin >= remote.origin,
    };

    let mut merged = Map::new();
    for (key, value) in local_map {
        if !remote_map.contains_key(key) || local_field_wins {
            merged.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in remote_map {
        if !local_map.contains_key(key) || !local_field_wins {
            merged.insert(key.clone(), value.clone());
        }
    }

    let mut clock = local.vector_clock.clone();
    clock.merge(&remote.vector_clock);
    let origin = if local_field_wins {
        local.origin.clone()
    } else {
        remote.origin.clone()
    };

    Record::new(Value::Object(merged), clock, origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::error::ReplicationError;
    use serde_json::json;

    fn record(value: Value, entries: &[(&str, u64)], origin: &str) -> Record {
        let mut clock = VectorClock::new();
        for (id, n) in entries {
            for _ in 0..*n {
                clock.increment(id);
            }
        }
        Record::new(value, clock, origin)
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(&ConflictConfig::default())
    }

    #[test]
    fn test_dominant_remote_wins() {
        let r = resolver();
        let local = record(json!("old"), &[("n1", 1)], "n1");
        let remote = record(json!("new"), &[("n1", 2)], "n2");
        assert_eq!(r.resolve("k", &local, &remote).value, json!("new"));
    }

    #[test]
    fn test_dominant_local_wins() {
        let r = resolver();
        let local = record(json!("new"), &[("n1", 2)], "n1");
        let remote = record(json!("old"), &[("n1", 1)], "n2");
        assert_eq!(r.resolve("k", &local, &remote).value, json!("new"));
    }

    #[test]
    fn test_concurrent_tiebreak_is_symmetric() {
        let r = resolver();
        let a = record(json!("A"), &[("n1", 1)], "n1");
        let b = record(json!("B"), &[("n2", 1)], "n2");
        // Greater origin ("n2") wins from both perspectives.
        assert_eq!(r.resolve("k", &a, &b).value, json!("B"));
        assert_eq!(r.resolve("k", &b, &a).value, json!("B"));
    }

    #[test]
    fn test_first_write_wins_prefers_dominated() {
        let r = resolver();
        r.set_strategy("k", Strategy::FirstWriteWins);
        let local = record(json!("old"), &[("n1", 1)], "n1");
        let remote = record(json!("new"), &[("n1", 2)], "n2");
        assert_eq!(r.resolve("k", &local, &remote).value, json!("old"));
    }

    #[test]
    fn test_first_write_wins_concurrent_tiebreak_reversed() {
        let r = resolver();
        r.set_strategy("k", Strategy::FirstWriteWins);
        let a = record(json!("A"), &[("n1", 1)], "n1");
        let b = record(json!("B"), &[("n2", 1)], "n2");
        assert_eq!(r.resolve("k", &a, &b).value, json!("A"));
        assert_eq!(r.resolve("k", &b, &a).value, json!("A"));
    }

    #[test]
    fn test_deletion_wins_over_concurrent_update() {
        let r = resolver();
        let tombstone = record(Value::Null, &[("n1", 1)], "n1");
        let update = record(json!("v"), &[("n2", 1)], "n2");
        assert!(r.resolve("k", &tombstone, &update).is_tombstone());
        assert!(r.resolve("k", &update, &tombstone).is_tombstone());
    }

    #[test]
    fn test_dominating_update_beats_deletion() {
        let r = resolver();
        let tombstone = record(Value::Null, &[("n1", 1)], "n1");
        let update = record(json!("revived"), &[("n1", 1), ("n2", 1)], "n2");
        assert_eq!(r.resolve("k", &tombstone, &update).value, json!("revived"));
        assert_eq!(r.resolve("k", &update, &tombstone).value, json!("revived"));
    }

    #[test]
    fn test_both_tombstones_resolved_by_dominance() {
        let r = resolver();
        let older = record(Value::Null, &[("n1", 1)], "n1");
        let newer = record(Value::Null, &[("n1", 2)], "n2");
        let winner = r.resolve("k", &older, &newer);
        assert_eq!(winner.origin, "n2");
    }

    #[test]
    fn test_merge_fields_disjoint_keys() {
        let r = resolver();
        r.set_strategy("inv", Strategy::MergeFields);
        let local = record(json!({"a": 1}), &[("n1", 1)], "n1");
        let remote = record(json!({"b": 2}), &[("n2", 1)], "n2");
        let merged = r.resolve("inv/item", &local, &remote);
        assert_eq!(merged.value, json!({"a": 1, "b": 2}));
        assert_eq!(merged.vector_clock.get("n1"), 1);
        assert_eq!(merged.vector_clock.get("n2"), 1);
    }

    #[test]
    fn test_merge_fields_overlapping_keys_use_clock_relation() {
        let r = resolver();
        r.set_strategy("inv", Strategy::MergeFields);
        let local = record(json!({"qty": 5, "loc": "A"}), &[("n1", 1)], "n1");
        let remote = record(json!({"qty": 9}), &[("n1", 1), ("n2", 1)], "n2");
        // Remote dominates, so shared keys take the remote side.
        let merged = r.resolve("inv/item", &local, &remote);
        assert_eq!(merged.value, json!({"qty": 9, "loc": "A"}));
    }

    #[test]
    fn test_merge_fields_concurrent_uses_origin_order() {
        let r = resolver();
        r.set_strategy("inv", Strategy::MergeFields);
        let local = record(json!({"qty": 5}), &[("n1", 1)], "n1");
        let remote = record(json!({"qty": 9}), &[("n2", 1)], "n2");
        let merged = r.resolve("inv/item", &local, &remote);
        // Greater origin (n2) supplies contested fields.
        assert_eq!(merged.value, json!({"qty": 9}));
    }

    #[test]
    fn test_merge_fields_non_object_falls_back() {
        let r = resolver();
        r.set_strategy("inv", Strategy::MergeFields);
        let local = record(json!([1, 2]), &[("n1", 1)], "n1");
        let remote = record(json!("scalar"), &[("n1", 2)], "n2");
        // Fallback to vector-dominance: remote dominates.
        assert_eq!(r.resolve("inv/item", &local, &remote).value, json!("scalar"));
    }

    #[test]
    fn test_custom_resolver_runs() {
        let r = resolver();
        r.register_custom(
            "merge",
            Arc::new(|_path: &str, local: &Record, remote: &Record| {
                let mut clock = local.vector_clock.clone();
                clock.merge(&remote.vector_clock);
                Ok(Record::new(json!("custom"), clock, local.origin.clone()))
            }),
        );
        let local = record(json!("L"), &[("n1", 1)], "n1");
        let remote = record(json!("R"), &[("n2", 1)], "n2");
        assert_eq!(r.resolve("merge/k", &local, &remote).value, json!("custom"));
    }

    #[test]
    fn test_custom_resolver_error_falls_back() {
        let r = resolver();
        r.register_custom(
            "bad",
            Arc::new(|path: &str, _l: &Record, _r: &Record| {
                Err(ReplicationError::resolver(path, "boom"))
            }),
        );
        let local = record(json!("L"), &[("n1", 1)], "n1");
        let remote = record(json!("R"), &[("n2", 1)], "n2");
        // Fallback tiebreak: greater origin wins.
        assert_eq!(r.resolve("bad/k", &local, &remote).value, json!("R"));
    }

    #[test]
    fn test_strategy_selection_longest_prefix() {
        let r = resolver();
        r.set_strategy("a", Strategy::FirstWriteWins);
        r.set_strategy("a/b", Strategy::MergeFields);

        assert_eq!(r.strategy_for("a/b/c"), Strategy::MergeFields);
        assert_eq!(r.strategy_for("a/x"), Strategy::FirstWriteWins);
        assert_eq!(r.strategy_for("other"), Strategy::VectorDominance);
    }

    #[test]
    fn test_strategy_selection_exact_path() {
        let r = resolver();
        r.set_strategy("exact/path", Strategy::MergeFields);
        assert_eq!(r.strategy_for("exact/path"), Strategy::MergeFields);
    }

    #[test]
    fn test_custom_without_registered_resolver_falls_back() {
        let r = resolver();
        r.set_strategy("k", Strategy::Custom);
        let local = record(json!("L"), &[("n1", 2)], "n1");
        let remote = record(json!("R"), &[("n1", 1)], "n2");
        assert_eq!(r.resolve("k", &local, &remote).value, json!("L"));
    }
}
