// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replication node orchestrator.
//!
//! [`ReplicaNode`] ties together the write pipeline, conflict resolution,
//! version history, subscriptions, anti-entropy, and the sealed transport:
//!
//! 1. `start()` takes the transport's inbound feed, spawns the dispatch
//!    loop, identifies itself to peers (with a security handshake when
//!    enabled), and schedules the intervals.
//! 2. Local operations (`put`/`get`/`del`/`scan`) serve from the durable
//!    store; writes run the full pipeline and broadcast to the mesh.
//! 3. `close()` flips the one-way shutdown flag, stops the intervals,
//!    detaches the transport, drains ~500 ms, and closes the store.

mod dispatch;
mod types;

pub use types::{HealthCheck, NodeState, SharedState, SyncState};

use crate::anti_entropy::Reconciler;
use crate::clock::VectorClock;
use crate::config::{NodeConfig, Strategy};
use crate::envelope::{generate_secure_id, Payload, SecurityEnvelope};
use crate::error::{ReplicationError, Result};
use crate::resilience::RateLimiter;
use crate::resolver::{ConflictResolver, ResolveConflict};
use crate::store::{Record, ReplicaStore};
use crate::subscriptions::{SubscriberFn, SubscriptionBus, SubscriptionId};
use crate::transport::Transport;
use crate::wire::{now_millis, Event, Identify, SecurityHandshake, Wire};
use crate::writer::WriteProcessor;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// How long `close()` waits for in-flight messages after the transport
/// detaches.
const DRAIN_DELAY: Duration = Duration::from_millis(500);
/// Per-task join timeout during shutdown.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What a committed local write returns.
#[derive(Debug, Clone, PartialEq)]
pub struct PutReceipt {
    pub path: String,
    pub value: Value,
    pub vector_clock: VectorClock,
}

/// A full local replica participating in the mesh.
pub struct ReplicaNode {
    config: NodeConfig,
    node_id: String,
    state: Arc<Mutex<SharedState>>,
    store: Arc<dyn ReplicaStore>,
    transport: Arc<dyn Transport>,
    wire: Arc<Wire>,
    resolver: Arc<ConflictResolver>,
    subscriptions: Arc<SubscriptionBus>,
    writer: Arc<WriteProcessor>,
    reconciler: Arc<Reconciler>,
    rate_limiter: Option<Arc<RateLimiter>>,
    shutting_down: Arc<AtomicBool>,
    state_tx: watch::Sender<NodeState>,
    state_rx: watch::Receiver<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReplicaNode {
    /// Create a node over a durable store and a transport endpoint.
    ///
    /// Validates the configuration; the node starts in `Created` state.
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn ReplicaStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let node_id = config.node_id.clone();
        let envelope = if config.security.enabled {
            Some(Arc::new(SecurityEnvelope::new(&config.security)?))
        } else {
            None
        };
        let wire = Arc::new(Wire::new(&node_id, Arc::clone(&transport), envelope));

        let state = Arc::new(Mutex::new(SharedState::new(
            &node_id,
            config.sync.max_versions,
        )));
        let resolver = Arc::new(ConflictResolver::new(&config.conflict));
        let subscriptions = Arc::new(SubscriptionBus::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let writer = Arc::new(WriteProcessor::new(
            &node_id,
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::clone(&resolver),
            Arc::clone(&subscriptions),
            Arc::clone(&wire),
            Arc::clone(&shutting_down),
            config.sync.max_message_age(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            &node_id,
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::clone(&writer),
            Arc::clone(&wire),
            Arc::clone(&shutting_down),
        ));

        let rate_limiter = config
            .sync
            .rate_limit
            .clone()
            .map(|cfg| Arc::new(RateLimiter::new(cfg)));

        let (state_tx, state_rx) = watch::channel(NodeState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            node_id,
            state,
            store,
            transport,
            wire,
            resolver,
            subscriptions,
            writer,
            reconciler,
            rate_limiter,
            shutting_down,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            tasks: RwLock::new(Vec::new()),
        })
    }

    /// Start serving: register handlers, greet peers, schedule intervals.
    pub async fn start(&self) -> Result<()> {
        if self.state() != NodeState::Created {
            return Err(ReplicationError::Internal(format!(
                "start() called in state {}",
                self.state()
            )));
        }
        let _ = self.state_tx.send(NodeState::Starting);
        crate::metrics::set_node_state("Starting");

        let inbound = self.transport.take_inbound().ok_or_else(|| {
            ReplicationError::Internal("transport inbound feed already taken".into())
        })?;

        info!(
            node_id = %self.node_id,
            peer_count = self.config.peers.len(),
            security = self.wire.security_enabled(),
            "Starting replication node"
        );

        // Inbound dispatch loop.
        let ctx = Arc::new(dispatch::DispatchCtx {
            node_id: self.node_id.clone(),
            wire: Arc::clone(&self.wire),
            writer: Arc::clone(&self.writer),
            reconciler: Arc::clone(&self.reconciler),
            state: Arc::clone(&self.state),
            rate_limiter: self.rate_limiter.clone(),
            shutting_down: Arc::clone(&self.shutting_down),
        });
        let shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(dispatch::run(ctx, inbound, shutdown_rx));
        self.tasks.write().await.push(handle);

        self.greet_peers().await;
        self.spawn_clock_sync_task().await;
        self.spawn_sweep_task().await;
        if let Some(interval) = self.config.sync.anti_entropy_interval() {
            self.spawn_anti_entropy_task(interval).await;
        }

        let _ = self.state_tx.send(NodeState::Running);
        crate::metrics::set_node_state("Running");
        info!(node_id = %self.node_id, "Replication node running");
        Ok(())
    }

    /// Send `identify` (and a handshake challenge when secured) to every
    /// configured peer.
    async fn greet_peers(&self) {
        for peer in &self.config.peers {
            let identify = Identify {
                server_id: self.node_id.clone(),
                url: peer.url.clone(),
            };
            if let Err(e) = self.wire.send(&peer.node_id, &Event::Identify(identify)).await {
                warn!(peer_id = %peer.node_id, error = %e, "Failed to identify to peer");
            }

            if let Some(envelope) = self.wire.envelope() {
                match self.build_handshake(envelope, &peer.node_id).await {
                    Ok(handshake) => {
                        if let Err(e) = self
                            .wire
                            .send(&peer.node_id, &Event::SecurityHandshake(handshake))
                            .await
                        {
                            warn!(peer_id = %peer.node_id, error = %e, "Failed to send handshake");
                        }
                    }
                    Err(e) => warn!(peer_id = %peer.node_id, error = %e, "Failed to build handshake"),
                }
            }
        }
    }

    async fn build_handshake(
        &self,
        envelope: &Arc<SecurityEnvelope>,
        peer_id: &str,
    ) -> Result<SecurityHandshake> {
        let challenge = generate_secure_id();
        {
            let mut state = self.state.lock().await;
            state
                .pending_challenges
                .insert(peer_id.to_string(), challenge.clone());
        }
        let sealed = envelope.encrypt(&Payload::Json(json!({
            "challenge": challenge,
            "timestamp": now_millis(),
        })))?;
        Ok(SecurityHandshake {
            challenge: serde_json::to_value(sealed)?,
        })
    }

    /// Short-interval vector-clock exchange keeps causal metadata current.
    async fn spawn_clock_sync_task(&self) {
        let reconciler = Arc::clone(&self.reconciler);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.sync.clock_sync_interval();

        let handle = tokio::spawn(async move {
            let _ = shutdown_rx.borrow_and_update();
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Clock sync task stopping");
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        reconciler.clock_sync_all().await;
                    }
                }
            }
        });
        self.tasks.write().await.push(handle);
    }

    /// Periodic recent-message sweep.
    async fn spawn_sweep_task(&self) {
        let writer = Arc::clone(&self.writer);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.sync.sweep_interval();

        let handle = tokio::spawn(async move {
            let _ = shutdown_rx.borrow_and_update();
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Sweep task stopping");
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        writer.sweep_recent().await;
                    }
                }
            }
        });
        self.tasks.write().await.push(handle);
    }

    /// Scheduled full anti-entropy cycles.
    async fn spawn_anti_entropy_task(&self, interval: Duration) {
        let reconciler = Arc::clone(&self.reconciler);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let _ = shutdown_rx.borrow_and_update();
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_ms = interval.as_millis() as u64, "Anti-entropy scheduled");
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Anti-entropy task stopping");
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        match reconciler.run("", false).await {
                            Ok(_) => {}
                            Err(ReplicationError::Shutdown) => break,
                            Err(e) => warn!(error = %e, "Scheduled anti-entropy failed"),
                        }
                    }
                }
            }
        });
        self.tasks.write().await.push(handle);
    }

    /// Shut down gracefully: stop intervals, detach the transport, drain
    /// briefly, close the store. Idempotent.
    pub async fn close(&self) {
        if self.state() == NodeState::Stopped {
            return;
        }
        info!(node_id = %self.node_id, "Shutting down replication node");
        let _ = self.state_tx.send(NodeState::ShuttingDown);
        crate::metrics::set_node_state("ShuttingDown");

        self.shutting_down.store(true, Ordering::SeqCst);
        self.subscriptions.begin_shutdown();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut tasks = self.tasks.write().await;
            std::mem::take(&mut *tasks)
        };
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        self.transport.detach();
        tokio::time::sleep(DRAIN_DELAY).await;

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Store close failed");
        }

        let _ = self.state_tx.send(NodeState::Stopped);
        crate::metrics::set_node_state("Stopped");
        info!(node_id = %self.node_id, "Replication node stopped");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Public API
    // ─────────────────────────────────────────────────────────────────────

    /// Write a value at a path and replicate it.
    pub async fn put(&self, path: &str, value: Value) -> Result<PutReceipt> {
        let record = self.writer.local_put(path, value).await?;
        Ok(PutReceipt {
            path: path.to_string(),
            value: record.value,
            vector_clock: record.vector_clock,
        })
    }

    /// Read the value at a path. Missing paths and tombstones are `None`.
    pub async fn get(&self, path: &str) -> Result<Option<Value>> {
        let record = self.store.get(path).await?;
        Ok(record.and_then(|r| if r.is_tombstone() { None } else { Some(r.value) }))
    }

    /// Soft-delete a path. Returns whether a live record existed.
    pub async fn del(&self, path: &str) -> Result<bool> {
        self.writer.local_del(path).await
    }

    /// All live values under a prefix, in path order. Tombstones are
    /// filtered out.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let rows = self.store.scan(prefix).await?;
        Ok(rows
            .into_iter()
            .filter(|(_, record)| !record.is_tombstone())
            .map(|(path, record)| (path, record.value))
            .collect())
    }

    /// Subscribe to committed writes related to a path prefix.
    pub fn subscribe(&self, prefix: &str, callback: SubscriberFn) -> Result<SubscriptionId> {
        self.subscriptions.subscribe(prefix, callback)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    /// Version history for a path, most dominant first. The head is
    /// normally the current record; superseded versions follow.
    pub async fn version_history(&self, path: &str) -> Vec<Record> {
        self.state.lock().await.versions.history(path)
    }

    /// Route a path prefix to a named strategy.
    /// Accepts `last-write-wins` as an alias of `vector-dominance`.
    pub fn set_conflict_strategy(&self, prefix: &str, strategy: &str) -> Result<()> {
        let strategy = Strategy::from_str(strategy)?;
        self.resolver.set_strategy(prefix, strategy);
        Ok(())
    }

    /// Register a custom resolver for a path prefix.
    pub fn register_conflict_resolver(&self, prefix: &str, resolver: Arc<dyn ResolveConflict>) {
        self.resolver.register_custom(prefix, resolver);
    }

    /// Force one anti-entropy cycle for a path prefix (empty = everything).
    pub async fn run_anti_entropy(&self, path: &str) -> Result<bool> {
        self.reconciler.run(path, true).await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    /// This node's ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Node IDs this replica has seen, self included.
    pub async fn known_nodes(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut nodes: Vec<String> = state.known_nodes.iter().cloned().collect();
        nodes.sort();
        nodes
    }

    /// A snapshot of the local vector clock.
    pub async fn vector_clock(&self) -> VectorClock {
        self.state.lock().await.clock.clone()
    }

    /// Health snapshot from cached internal state. No I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state.lock().await;
        let lifecycle = self.state();
        HealthCheck {
            state: lifecycle,
            security_enabled: self.wire.security_enabled(),
            peers_total: self.config.peers.len(),
            peers_verified: state.verified_peers.len(),
            known_nodes: state.known_nodes.len(),
            recent_messages: state.recent.len(),
            version_paths: state.versions.paths(),
            healthy: lifecycle == NodeState::Running,
        }
    }
}
