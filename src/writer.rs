// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The write pipeline.
//!
//! [`WriteProcessor::handle_put`] ingests every write, local and remote,
//! through one pipeline:
//!
//! 1. Shutdown gate.
//! 2. `msgId` dedupe against the recent-message set.
//! 3. `visitedServers` loop prevention (best-effort; `msgId` is
//!    authoritative).
//! 4. Remember the `msgId`, learn the origin node.
//! 5. Parse the incoming clock (absent or invalid → singleton `{origin: 1}`).
//! 6. Load the existing record; if present, run conflict resolution.
//! 7. Merge the incoming clock into the local clock; a locally authored
//!    write additionally increments our own entry.
//! 8. Stamp the winner with the committed clock, persist, archive the new
//!    head in the version history, notify subscribers.
//! 9. Unless the write came from anti-entropy, re-broadcast with ourselves
//!    appended to `visitedServers`.
//!
//! The node's primary lock is never held across store or transport I/O:
//! state transitions happen in short critical sections with the I/O between
//! them.

use crate::clock::VectorClock;
use crate::envelope::generate_secure_id;
use crate::error::{ReplicationError, Result};
use crate::node::SharedState;
use crate::resolver::ConflictResolver;
use crate::store::{Record, ReplicaStore};
use crate::subscriptions::SubscriptionBus;
use crate::wire::{Event, PutMessage, Wire};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Ingests local and remote writes: dedupe, conflict resolution, persist,
/// notify, propagate.
pub struct WriteProcessor {
    node_id: String,
    state: Arc<Mutex<SharedState>>,
    store: Arc<dyn ReplicaStore>,
    resolver: Arc<ConflictResolver>,
    subscriptions: Arc<SubscriptionBus>,
    wire: Arc<Wire>,
    shutting_down: Arc<AtomicBool>,
    max_message_age: Duration,
}

impl WriteProcessor {
    /// Wire up a processor over the node's shared state and collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: &str,
        state: Arc<Mutex<SharedState>>,
        store: Arc<dyn ReplicaStore>,
        resolver: Arc<ConflictResolver>,
        subscriptions: Arc<SubscriptionBus>,
        wire: Arc<Wire>,
        shutting_down: Arc<AtomicBool>,
        max_message_age: Duration,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            state,
            store,
            resolver,
            subscriptions,
            wire,
            shutting_down,
            max_message_age,
        }
    }

    /// Process one write. Returns the committed record, or `None` when the
    /// message was dropped by dedupe, loop prevention, or shutdown.
    pub async fn handle_put(&self, msg: PutMessage) -> Result<Option<Record>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            crate::metrics::record_put_dropped("shutdown");
            return Ok(None);
        }

        let locally_authored = msg.origin == self.node_id;

        // Dedupe and bookkeeping in one short critical section.
        {
            let mut state = self.state.lock().await;
            if state.recent.contains_key(&msg.msg_id) {
                crate::metrics::record_put_dropped("msg-id");
                trace!(path = %msg.path, msg_id = %msg.msg_id, "Dropping duplicate message");
                return Ok(None);
            }
            if msg.visited().iter().any(|id| id == &self.node_id) {
                crate::metrics::record_put_dropped("visited");
                trace!(path = %msg.path, msg_id = %msg.msg_id, "Dropping looped message");
                return Ok(None);
            }
            state.recent.insert(msg.msg_id.clone(), Instant::now());
            state.known_nodes.insert(msg.origin.clone());
        }

        let incoming_clock = match &msg.vector_clock {
            Some(raw) if raw.is_object() => VectorClock::from_json(raw),
            _ => VectorClock::singleton(&msg.origin, 1),
        };
        let incoming = Record::new(msg.value.clone(), incoming_clock.clone(), msg.origin.clone());

        // Store read happens unlocked.
        let existing = self.store.get(&msg.path).await?;

        let mut committed = match existing {
            Some(existing) => self.resolver.resolve(&msg.path, &existing, &incoming),
            None => incoming,
        };

        // Advance the local clock and stamp the winner with it.
        let committed_clock = {
            let mut state = self.state.lock().await;
            state.clock.merge(&incoming_clock);
            if locally_authored {
                state.clock.increment(&self.node_id);
            }
            let known: Vec<String> = state.known_nodes.iter().cloned().collect();
            for node_id in known {
                state.clock.ensure(&node_id);
            }
            state.clock.clone()
        };
        committed.vector_clock = committed_clock.clone();

        self.store.put(&msg.path, committed.clone()).await?;
        {
            // Every committed record becomes a version; once superseded it
            // stays in the bounded history for rollback tooling.
            let mut state = self.state.lock().await;
            state.versions.append(&msg.path, committed.clone());
        }
        crate::metrics::record_put_applied(&msg.origin, locally_authored);
        debug!(
            path = %msg.path,
            origin = %msg.origin,
            tombstone = committed.is_tombstone(),
            "Committed write"
        );

        self.subscriptions.notify(&msg.path, &committed.value);

        if !self.shutting_down.load(Ordering::SeqCst) && !msg.is_anti_entropy() {
            self.propagate(msg, &committed_clock).await;
        }

        Ok(Some(committed))
    }

    /// Re-broadcast a committed write to the mesh.
    async fn propagate(&self, mut msg: PutMessage, committed_clock: &VectorClock) {
        msg.vector_clock = Some(committed_clock.to_json());
        let mut visited = msg.visited_servers.take().unwrap_or_default();
        if !visited.iter().any(|id| id == &self.node_id) {
            visited.push(self.node_id.clone());
        }
        msg.visited_servers = Some(visited);
        msg.hop_count = Some(msg.hop_count.unwrap_or(0) + 1);
        msg.forwarded = Some(true);

        if let Err(e) = self.wire.broadcast(&Event::Put(msg)).await {
            // Best-effort: anti-entropy repairs whatever broadcast misses.
            warn!(error = %e, "Broadcast failed");
        }
    }

    /// Author a local write and run it through the pipeline.
    pub async fn local_put(&self, path: &str, value: Value) -> Result<Record> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ReplicationError::Shutdown);
        }

        let message_clock = {
            let state = self.state.lock().await;
            let mut clock = state.clock.clone();
            clock.increment(&self.node_id);
            clock
        };

        let msg = PutMessage {
            path: path.to_string(),
            value,
            msg_id: generate_secure_id(),
            origin: self.node_id.clone(),
            vector_clock: Some(message_clock.to_json()),
            visited_servers: None,
            hop_count: None,
            forwarded: None,
            anti_entropy: None,
        };

        self.handle_put(msg)
            .await?
            .ok_or_else(|| ReplicationError::Internal("local write was dropped".into()))
    }

    /// Soft delete: a local put of JSON `null`. Returns whether a live
    /// (non-tombstone) record existed.
    pub async fn local_del(&self, path: &str) -> Result<bool> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ReplicationError::Shutdown);
        }
        let existed = self
            .store
            .get(path)
            .await?
            .map(|record| !record.is_tombstone())
            .unwrap_or(false);
        self.local_put(path, Value::Null).await?;
        Ok(existed)
    }

    /// Drop recent-message entries older than the retention window.
    pub async fn sweep_recent(&self) {
        let remaining = {
            let mut state = self.state.lock().await;
            let cutoff = self.max_message_age;
            state.recent.retain(|_, seen| seen.elapsed() < cutoff);
            state.recent.len()
        };
        crate::metrics::set_recent_set_size(remaining);
        trace!(remaining, "Swept recent-message set");
    }
}
