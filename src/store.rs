// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable store integration trait.
//!
//! The replication engine persists [`Record`]s keyed by path and consumes
//! the store only through [`ReplicaStore`]. This decouples the engine from
//! any particular backend and allows testing with an in-memory map.
//!
//! Deletion is soft: a record whose `value` is JSON `null` is a tombstone.
//! The record and its causal metadata persist so that a delete can win (or
//! lose) conflicts like any other write. `del()` on the trait physically
//! removes a row and exists for wipe/compaction tooling, not for the
//! replicated delete path.

use crate::clock::VectorClock;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// What is persisted at a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Arbitrary structured value; JSON `null` marks a tombstone.
    pub value: Value,
    /// Causal metadata stamped at commit time.
    pub vector_clock: VectorClock,
    /// Node that authored this value.
    pub origin: String,
}

impl Record {
    /// Build a record.
    pub fn new(value: Value, vector_clock: VectorClock, origin: impl Into<String>) -> Self {
        Self {
            value,
            vector_clock,
            origin: origin.into(),
        }
    }

    /// True when this record is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_null()
    }
}

/// Trait defining what the replication engine needs from a durable store.
///
/// Implementations must be safe to call concurrently. Paths are opaque
/// slash-delimited strings; `scan` matches a prefix on segment boundaries
/// (`"a"` matches `"a"` and `"a/b"`, never `"ab"`). An empty prefix matches
/// everything.
pub trait ReplicaStore: Send + Sync + 'static {
    /// Fetch the record at a path. Absent is `Ok(None)`, not an error.
    fn get(&self, path: &str) -> BoxFuture<'_, Option<Record>>;

    /// Persist a record at a path, replacing any existing one.
    fn put(&self, path: &str, record: Record) -> BoxFuture<'_, ()>;

    /// Physically remove a row. Returns whether a row existed.
    fn del(&self, path: &str) -> BoxFuture<'_, bool>;

    /// All records under a prefix, in path order.
    fn scan(&self, prefix: &str) -> BoxFuture<'_, Vec<(String, Record)>>;

    /// Flush and release resources. Further calls may fail.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// True when `path` equals `prefix` or sits below it on a segment boundary.
pub(crate) fn path_under_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path == prefix || (path.len() > prefix.len() && path.starts_with(prefix) && path.as_bytes()[prefix.len()] == b'/')
}

/// In-memory store backed by an ordered map.
///
/// Used by tests and by embedders that do not need durability. Lives
/// outside the node (behind an `Arc`) so a "restarted" node in tests can
/// reopen the same data.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, Record>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of rows, tombstones included.
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }
}

impl ReplicaStore for MemoryStore {
    fn get(&self, path: &str) -> BoxFuture<'_, Option<Record>> {
        let path = path.to_string();
        Box::pin(async move { Ok(self.map.read().await.get(&path).cloned()) })
    }

    fn put(&self, path: &str, record: Record) -> BoxFuture<'_, ()> {
        let path = path.to_string();
        Box::pin(async move {
            self.map.write().await.insert(path, record);
            Ok(())
        })
    }

    fn del(&self, path: &str) -> BoxFuture<'_, bool> {
        let path = path.to_string();
        Box::pin(async move { Ok(self.map.write().await.remove(&path).is_some()) })
    }

    fn scan(&self, prefix: &str) -> BoxFuture<'_, Vec<(String, Record)>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let map = self.map.read().await;
            let rows = map
                .range(prefix.clone()..)
                .take_while(|(path, _)| prefix.is_empty() || path.starts_with(prefix.as_str()))
                .filter(|(path, _)| path_under_prefix(path, &prefix))
                .map(|(path, record)| (path.clone(), record.clone()))
                .collect();
            Ok(rows)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
