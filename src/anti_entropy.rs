// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull-based anti-entropy reconciliation.
//!
//! Nodes that missed updates while disconnected converge once reconnected,
//! regardless of wall clock. A cycle:
//!
//! 1. Exchange vector clocks with every peer (rate-limit exempt).
//! 2. Send each peer an `anti-entropy-request` for a path prefix.
//! 3. The peer merges our clock, scans its store, and streams the records
//!    back in batches of 50 with a 50 ms pause between batches.
//! 4. Each returned change re-enters the write pipeline flagged
//!    `antiEntropy: true`, which suppresses re-broadcast.
//! 5. A final clock exchange closes the cycle.
//!
//! # Run gating and backoff
//!
//! ```text
//! Idle --run()--> CanRun? --yes--> Running --success--> Idle (backoff↓)
//!                     |                     \--failure--> Idle (backoff↑)
//!                     \--no--> Idle (skip counted)
//! ```
//!
//! Backoff starts at 1 s and stays within [1 s, 30 s]: ×0.8 on success
//! (halved again after a long idle gap), ×2 on failure.

use crate::envelope::generate_secure_id;
use crate::error::{ReplicationError, Result};
use crate::node::SharedState;
use crate::store::ReplicaStore;
use crate::wire::{
    now_millis, AntiEntropyRequest, AntiEntropyResponse, ChangeRecord, ClockSync,
    ClockSyncResponse, Event, PutMessage, Wire,
};
use crate::writer::WriteProcessor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Records per `anti-entropy-response` batch.
const BATCH_SIZE: usize = 50;
/// Pause between batches, bounds the network burst a pull can cause.
const BATCH_PAUSE: Duration = Duration::from_millis(50);
/// Backoff clamp.
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Idle gap after which the next successful run halves the backoff.
const IDLE_THRESHOLD: Duration = Duration::from_secs(60);

/// Periodic pull-based reconciliation against the mesh.
pub struct Reconciler {
    node_id: String,
    state: Arc<Mutex<SharedState>>,
    store: Arc<dyn ReplicaStore>,
    writer: Arc<WriteProcessor>,
    wire: Arc<Wire>,
    shutting_down: Arc<AtomicBool>,
}

impl Reconciler {
    pub(crate) fn new(
        node_id: &str,
        state: Arc<Mutex<SharedState>>,
        store: Arc<dyn ReplicaStore>,
        writer: Arc<WriteProcessor>,
        wire: Arc<Wire>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            state,
            store,
            writer,
            wire,
            shutting_down,
        }
    }

    /// Run one reconciliation cycle for a path prefix (empty = everything).
    ///
    /// Returns `Ok(false)` when the run was skipped (already running, or
    /// inside the backoff window) and `force` was not set.
    pub async fn run(&self, path: &str, force: bool) -> Result<bool> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ReplicationError::Shutdown);
        }

        // Gate.
        {
            let mut state = self.state.lock().await;
            if state.sync.is_running && !force {
                state.sync.consecutive_skips += 1;
                crate::metrics::record_anti_entropy_skip("already-running");
                trace!(skips = state.sync.consecutive_skips, "Anti-entropy already running");
                return Ok(false);
            }
            if !force {
                if let Some(last_run) = state.sync.last_run {
                    if last_run.elapsed() < state.sync.backoff {
                        state.sync.consecutive_skips += 1;
                        crate::metrics::record_anti_entropy_skip("backoff");
                        trace!(
                            backoff_ms = state.sync.backoff.as_millis() as u64,
                            "Anti-entropy inside backoff window"
                        );
                        return Ok(false);
                    }
                }
            }
            state.sync.is_running = true;
        }

        let started = Instant::now();
        let outcome = self.run_cycle(path).await;

        // Release the run flag and adapt the backoff.
        {
            let mut state = self.state.lock().await;
            let was_idle = state
                .sync
                .last_run
                .map(|last| last.elapsed() > IDLE_THRESHOLD)
                .unwrap_or(false);
            state.sync.is_running = false;
            state.sync.last_run = Some(Instant::now());
            state.sync.consecutive_skips = 0;
            state.sync.backoff = match &outcome {
                Ok(()) => {
                    let mut backoff = state.sync.backoff.mul_f64(0.8);
                    if was_idle {
                        backoff /= 2;
                    }
                    backoff.clamp(MIN_BACKOFF, MAX_BACKOFF)
                }
                Err(_) => (state.sync.backoff * 2).clamp(MIN_BACKOFF, MAX_BACKOFF),
            };
        }

        crate::metrics::record_anti_entropy_run(outcome.is_ok(), started.elapsed());
        outcome.map(|_| true)
    }

    async fn run_cycle(&self, path: &str) -> Result<()> {
        let peers = self.wire.peers();
        if peers.is_empty() {
            debug!("No peers attached, skipping reconciliation");
            return Ok(());
        }

        debug!(peer_count = peers.len(), path, "Starting anti-entropy cycle");

        // Phase 1: bring causal metadata current.
        self.clock_sync_round(&peers).await;

        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ReplicationError::Shutdown);
        }

        // Phase 2: pull everyone's data for the prefix, all peers in
        // parallel.
        let clock_json = { self.state.lock().await.clock.to_json() };
        let requests = peers.iter().map(|peer_id| {
            let request = AntiEntropyRequest {
                request_id: generate_secure_id(),
                node_id: self.node_id.clone(),
                vector_clock: clock_json.clone(),
                timestamp: now_millis(),
                path: path.to_string(),
                is_anti_entropy: true,
            };
            async move {
                (
                    peer_id,
                    self.wire
                        .send(peer_id, &Event::AntiEntropyRequest(request))
                        .await,
                )
            }
        });

        let mut failures = 0usize;
        for (peer_id, result) in futures::future::join_all(requests).await {
            if let Err(e) = result {
                warn!(peer_id = %peer_id, error = %e, "Failed to send anti-entropy request");
                failures += 1;
            }
        }

        // Phase 3: final pairwise clock pass.
        self.clock_sync_round(&peers).await;

        if failures == peers.len() {
            return Err(ReplicationError::transport(
                "mesh",
                "every anti-entropy request failed",
            ));
        }
        Ok(())
    }

    /// Emit a `vector-clock-sync` to every peer in parallel. Best-effort.
    pub async fn clock_sync_round(&self, peers: &[String]) {
        let clock_json = { self.state.lock().await.clock.to_json() };
        let sync_id = generate_secure_id();
        let sends = peers.iter().map(|peer_id| {
            let sync = ClockSync::new(clock_json.clone(), &self.node_id, &sync_id);
            async move {
                (
                    peer_id,
                    self.wire.send(peer_id, &Event::VectorClockSync(sync)).await,
                )
            }
        });
        for (peer_id, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => crate::metrics::record_clock_sync("outbound"),
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Failed to send clock sync"),
            }
        }
    }

    /// Emit a clock sync to every attached peer (the short-interval task).
    pub async fn clock_sync_all(&self) {
        let peers = self.wire.peers();
        if !peers.is_empty() {
            self.clock_sync_round(&peers).await;
        }
    }

    /// Peer side: merge the requester's clock and answer with ours.
    pub async fn handle_clock_sync(&self, from: &str, sync: ClockSync) -> Result<()> {
        crate::metrics::record_clock_sync("inbound");
        let merged = {
            let mut state = self.state.lock().await;
            state.absorb_clock(&sync.node_id, &sync.vector_clock)
        };
        let response = ClockSyncResponse::new(merged.to_json(), &self.node_id, &sync.sync_id);
        self.wire
            .send(from, &Event::VectorClockSyncResponse(response))
            .await
    }

    /// Requester side: fold the peer's merged clock back in.
    pub async fn handle_clock_sync_response(&self, response: ClockSyncResponse) -> Result<()> {
        let mut state = self.state.lock().await;
        state.absorb_clock(&response.node_id, &response.vector_clock);
        Ok(())
    }

    /// Peer side of a pull: scan the prefix and stream batches back.
    pub async fn handle_request(&self, from: &str, request: AntiEntropyRequest) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.absorb_clock(&request.node_id, &request.vector_clock);
        }

        let rows = self.store.scan(&request.path).await?;
        let clock_json = { self.state.lock().await.clock.to_json() };
        let total_batches = rows.len().div_ceil(BATCH_SIZE).max(1);

        debug!(
            peer_id = %from,
            path = %request.path,
            records = rows.len(),
            total_batches,
            "Serving anti-entropy request"
        );

        let mut batches = rows.chunks(BATCH_SIZE);
        for batch_index in 0..total_batches {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(ReplicationError::Shutdown);
            }
            if batch_index > 0 {
                tokio::time::sleep(BATCH_PAUSE).await;
            }

            let changes: Vec<ChangeRecord> = batches
                .next()
                .unwrap_or(&[])
                .iter()
                .map(|(record_path, record)| ChangeRecord {
                    path: record_path.clone(),
                    value: record.value.clone(),
                    vector_clock: record.vector_clock.to_json(),
                    origin: record.origin.clone(),
                    timestamp: Some(now_millis()),
                })
                .collect();

            crate::metrics::record_anti_entropy_batch(changes.len());
            let response = AntiEntropyResponse {
                response_id: request.request_id.clone(),
                node_id: self.node_id.clone(),
                vector_clock: clock_json.clone(),
                timestamp: now_millis(),
                batch_index,
                total_batches,
                changes,
                is_anti_entropy: true,
            };
            self.wire
                .send(from, &Event::AntiEntropyResponse(response))
                .await?;
        }

        Ok(())
    }

    /// Requester side: merge the peer's clock and re-ingest every change.
    pub async fn handle_response(&self, from: &str, response: AntiEntropyResponse) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.absorb_clock(&response.node_id, &response.vector_clock);
        }

        let change_count = response.changes.len();
        for change in response.changes {
            let msg = PutMessage {
                path: change.path.clone(),
                value: change.value,
                // Synthetic, stable within this response: re-delivered
                // batches dedupe against it.
                msg_id: format!("anti-entropy-{}-{}", response.response_id, change.path),
                origin: change.origin,
                vector_clock: Some(change.vector_clock),
                visited_servers: None,
                hop_count: None,
                forwarded: None,
                anti_entropy: Some(true),
            };
            // One bad record must not halt the pull.
            if let Err(e) = self.writer.handle_put(msg).await {
                warn!(peer_id = %from, path = %change.path, error = %e, "Failed to apply pulled change");
            }
        }

        crate::metrics::record_anti_entropy_pulled(from, change_count);
        if response.batch_index + 1 == response.total_batches {
            info!(
                peer_id = %from,
                batches = response.total_batches,
                "Anti-entropy pull complete"
            );
        }
        Ok(())
    }
}
