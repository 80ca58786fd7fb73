//! Node lifecycle and shared-state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ close()                      │ (handlers registered,
//!    ↓                              ↓  intervals scheduled)
//! Stopped ←──── ShuttingDown ←── Running
//!                    ↑               │
//!                    └─── close() ───┘
//! ```
//!
//! # Shared mutable state
//!
//! [`SharedState`] is the node's primary lock: local vector clock, known
//! nodes, the recent-message dedupe set, version histories, handshake
//! bookkeeping, and anti-entropy run state all live behind one
//! `tokio::sync::Mutex`. Sub-managers hold `Arc` handles to it; nothing
//! holds the lock across store or transport I/O.

use crate::clock::VectorClock;
use crate::versions::VersionStore;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Lifecycle state of a replication node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Node created but not started.
    Created,
    /// `start()` in progress: wiring handlers and intervals.
    Starting,
    /// Serving local operations and replicating.
    Running,
    /// `close()` called; draining in-flight messages.
    ShuttingDown,
    /// Shut down cleanly. Safe to drop.
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "Created"),
            NodeState::Starting => write!(f, "Starting"),
            NodeState::Running => write!(f, "Running"),
            NodeState::ShuttingDown => write!(f, "ShuttingDown"),
            NodeState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Anti-entropy execution state.
#[derive(Debug)]
pub struct SyncState {
    /// A cycle is currently executing.
    pub is_running: bool,
    /// When the last cycle finished.
    pub last_run: Option<Instant>,
    /// Runs skipped since the last executed cycle.
    pub consecutive_skips: u32,
    /// Adaptive delay between cycles, clamped to [1 s, 30 s].
    pub backoff: Duration,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            is_running: false,
            last_run: None,
            consecutive_skips: 0,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Mutable state guarded by the node's primary lock.
pub struct SharedState {
    /// This node's vector clock.
    pub clock: VectorClock,
    /// Every node ID seen in any inbound message (plus self).
    pub known_nodes: HashSet<String>,
    /// Peers that completed the security handshake.
    pub verified_peers: HashSet<String>,
    /// Outstanding handshake challenges by peer ID.
    pub pending_challenges: HashMap<String, String>,
    /// Recently processed message IDs with first-seen times.
    pub recent: HashMap<String, Instant>,
    /// Per-path superseded-record history.
    pub versions: VersionStore,
    /// Anti-entropy run state.
    pub sync: SyncState,
}

impl SharedState {
    /// Fresh state for a node.
    pub fn new(node_id: &str, max_versions: usize) -> Self {
        let mut clock = VectorClock::new();
        clock.ensure(node_id);
        let mut known_nodes = HashSet::new();
        known_nodes.insert(node_id.to_string());
        Self {
            clock,
            known_nodes,
            verified_peers: HashSet::new(),
            pending_challenges: HashMap::new(),
            recent: HashMap::new(),
            versions: VersionStore::new(max_versions),
            sync: SyncState::default(),
        }
    }

    /// Fold a remote clock into local state: remember the sender, take the
    /// pointwise max, and keep every known node keyed in the clock.
    /// Returns the merged clock.
    pub fn absorb_clock(&mut self, from: &str, clock_json: &Value) -> VectorClock {
        self.known_nodes.insert(from.to_string());
        let remote = VectorClock::from_json(clock_json);
        for (node_id, _) in remote.iter() {
            self.known_nodes.insert(node_id.clone());
        }
        self.clock.merge(&remote);
        let known: Vec<String> = self.known_nodes.iter().cloned().collect();
        for node_id in known {
            self.clock.ensure(&node_id);
        }
        self.clock.clone()
    }
}

/// Point-in-time health snapshot. Collected from cached internal state;
/// performs no I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: NodeState,
    pub security_enabled: bool,
    pub peers_total: usize,
    pub peers_verified: usize,
    pub known_nodes: usize,
    pub recent_messages: usize,
    pub version_paths: usize,
    pub healthy: bool,
}
