//! Path-prefix subscriptions and committed-write fan-out.
//!
//! A subscription pairs a path prefix with a callback. `notify(path, value)`
//! delivers to every subscription whose prefix is an ancestor of the written
//! path *or* a descendant of it: changing a parent notifies subscribers
//! watching below it, and changing a leaf notifies subscribers watching
//! above it. Exact equality matches.
//!
//! Callbacks run outside the registry lock. A panicking callback is logged
//! and swallowed; it never aborts the notification loop or the writer.

use crate::error::{ReplicationError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

/// Subscriber callback. Receives the written path and the committed value
/// (JSON `null` for deletions).
pub type SubscriberFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Handle returned by `subscribe`; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Per-node subscription registry.
pub struct SubscriptionBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, (String, SubscriberFn)>>,
    shutting_down: AtomicBool,
}

impl SubscriptionBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register a callback for a path prefix.
    ///
    /// Fails with `Shutdown` once the node has started closing.
    pub fn subscribe(&self, prefix: &str, callback: SubscriberFn) -> Result<SubscriptionId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ReplicationError::Shutdown);
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .lock()
            .expect("subscription registry poisoned")
            .insert(id, (prefix.to_string(), callback));
        trace!(prefix, id = id.0, "Subscriber registered");
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .lock()
            .expect("subscription registry poisoned")
            .remove(&id)
            .is_some()
    }

    /// Deliver a committed write to every matching subscriber.
    pub fn notify(&self, path: &str, value: &Value) {
        let matching: Vec<SubscriberFn> = {
            let subscribers = self
                .subscribers
                .lock()
                .expect("subscription registry poisoned");
            subscribers
                .values()
                .filter(|(prefix, _)| prefixes_related(prefix, path))
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };

        crate::metrics::record_notifications(path, matching.len());

        for callback in matching {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(path, value)));
            if outcome.is_err() {
                warn!(path, "Subscriber callback panicked; continuing");
            }
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscription registry poisoned")
            .len()
    }

    /// Refuse new subscriptions from now on.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        Self::new()
    }
}

/// True when one of `prefix`/`path` is an ancestor of (or equal to) the
/// other, on segment boundaries. The empty prefix relates to everything.
fn prefixes_related(prefix: &str, path: &str) -> bool {
    ancestor_of(prefix, path) || ancestor_of(path, prefix)
}

fn ancestor_of(shorter: &str, longer: &str) -> bool {
    if shorter.is_empty() {
        return true;
    }
    longer == shorter
        || (longer.len() > shorter.len()
            && longer.starts_with(shorter)
            && longer.as_bytes()[shorter.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_subscriber() -> (SubscriberFn, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let callback: SubscriberFn = Arc::new(move |_path, _value| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        (callback, hits)
    }

    #[test]
    fn test_exact_match() {
        let bus = SubscriptionBus::new();
        let (callback, hits) = counting_subscriber();
        bus.subscribe("a/b", callback).unwrap();

        bus.notify("a/b", &json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ancestor_prefix_sees_descendant_write() {
        let bus = SubscriptionBus::new();
        let (callback, hits) = counting_subscriber();
        bus.subscribe("users", callback).unwrap();

        bus.notify("users/42/name", &json!("alice"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_descendant_prefix_sees_ancestor_write() {
        let bus = SubscriptionBus::new();
        let (callback, hits) = counting_subscriber();
        bus.subscribe("users/42/name", callback).unwrap();

        bus.notify("users", &json!({"wiped": true}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unrelated_path_not_notified() {
        let bus = SubscriptionBus::new();
        let (callback, hits) = counting_subscriber();
        bus.subscribe("users", callback).unwrap();

        bus.notify("userspace", &json!(1));
        bus.notify("orders/1", &json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_prefix_sees_everything() {
        let bus = SubscriptionBus::new();
        let (callback, hits) = counting_subscriber();
        bus.subscribe("", callback).unwrap();

        bus.notify("a", &json!(1));
        bus.notify("deep/b/c", &json!(2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = SubscriptionBus::new();
        let (callback, hits) = counting_subscriber();
        let id = bus.subscribe("k", callback).unwrap();

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.notify("k", &json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.len(), 0);
    }

    #[test]
    fn test_panicking_callback_does_not_abort_loop() {
        let bus = SubscriptionBus::new();
        let panicking: SubscriberFn = Arc::new(|_path, _value| panic!("subscriber bug"));
        let (callback, hits) = counting_subscriber();

        bus.subscribe("k", panicking).unwrap();
        bus.subscribe("k", callback).unwrap();

        bus.notify("k", &json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_during_shutdown_fails() {
        let bus = SubscriptionBus::new();
        bus.begin_shutdown();
        let (callback, _hits) = counting_subscriber();
        let err = bus.subscribe("k", callback).unwrap_err();
        assert!(matches!(err, ReplicationError::Shutdown));
    }

    #[test]
    fn test_callback_receives_path_and_value() {
        let bus = SubscriptionBus::new();
        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        bus.subscribe(
            "k",
            Arc::new(move |path, value| {
                seen2.lock().unwrap().push((path.to_string(), value.clone()));
            }),
        )
        .unwrap();

        bus.notify("k/child", &json!({"n": 7}));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "k/child");
        assert_eq!(seen[0].1, json!({"n": 7}));
    }
}
