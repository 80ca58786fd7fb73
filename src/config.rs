//! Configuration for a replication node.
//!
//! Configuration is passed to [`ReplicaNode::new()`](crate::ReplicaNode::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use meshkv::config::{NodeConfig, PeerConfig};
//!
//! let config = NodeConfig {
//!     node_id: "n1".into(),
//!     peers: vec![PeerConfig::for_testing("n2")],
//!     ..NodeConfig::for_testing("n1")
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! NodeConfig
//! ├── node_id: String              # This node's stable identity
//! ├── peers: Vec<PeerConfig>       # Mesh peers to replicate with
//! ├── security: SecurityConfig     # Envelope cipher and PSK
//! ├── sync: SyncConfig             # Anti-entropy, dedupe, history bounds
//! └── conflict: ConflictConfig     # Default + per-path strategies
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicaNode::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for a replication node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The identity of the local node. Stable across restarts; used as the
    /// key in vector clocks and as the tiebreak in conflict resolution.
    pub node_id: String,

    /// The mesh peers this node replicates with.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Confidentiality/integrity envelope settings.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Anti-entropy, deduplication, and history settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Conflict resolution settings.
    #[serde(default)]
    pub conflict: ConflictConfig,
}

impl NodeConfig {
    /// Create a minimal config for testing: security disabled, fast
    /// anti-entropy, no peers.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            peers: Vec::new(),
            security: SecurityConfig::disabled(),
            sync: SyncConfig::for_testing(),
            conflict: ConflictConfig::default(),
        }
    }

    /// Validate every bound. Returns `ReplicationError::Config` on the
    /// first violation.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(ReplicationError::Config("node_id must not be empty".into()));
        }
        for peer in &self.peers {
            if peer.node_id.is_empty() {
                return Err(ReplicationError::Config("peer node_id must not be empty".into()));
            }
            if peer.node_id == self.node_id {
                return Err(ReplicationError::Config(format!(
                    "peer list contains the local node '{}'",
                    self.node_id
                )));
            }
        }
        self.security.validate()?;
        self.sync.validate()?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerConfig: one entry per mesh peer
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a single mesh peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer's node ID (the transport address in an in-process mesh).
    pub node_id: String,

    /// Optional transport endpoint, carried in `identify` messages for
    /// diagnostics. The transport implementation decides whether it needs it.
    #[serde(default)]
    pub url: Option<String>,
}

impl PeerConfig {
    /// Create a peer config for testing.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            url: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SecurityConfig: envelope cipher and pre-shared key
// ═══════════════════════════════════════════════════════════════════════════════

/// Envelope settings. When enabled, every outbound peer message is wrapped
/// in an authenticated-encryption envelope and every inbound message is
/// unwrapped before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Whether the envelope is applied.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pre-shared master key, identical on every node in the cluster.
    /// Required (>= 16 chars) when `enabled`.
    #[serde(default)]
    pub master_key: Option<String>,

    /// Authenticated symmetric cipher.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// PBKDF2-SHA256 iteration count for per-message key derivation.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Derived key length in bytes. Must be >= 16. The aes-256-gcm cipher
    /// itself always consumes a 256-bit key.
    #[serde(default = "default_key_length")]
    pub key_length: usize,
}

fn default_true() -> bool {
    true
}

fn default_algorithm() -> String {
    "aes-256-gcm".to_string()
}

fn default_kdf_iterations() -> u32 {
    10_000
}

fn default_key_length() -> usize {
    32
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            master_key: None,
            algorithm: default_algorithm(),
            kdf_iterations: default_kdf_iterations(),
            key_length: default_key_length(),
        }
    }
}

impl SecurityConfig {
    /// Security disabled (plaintext mesh, for tests and trusted networks).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Enabled with the given pre-shared key.
    pub fn with_master_key(master_key: &str) -> Self {
        Self {
            enabled: true,
            master_key: Some(master_key.to_string()),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        match &self.master_key {
            None => {
                return Err(ReplicationError::Config(
                    "security.master_key is required when security is enabled".into(),
                ))
            }
            Some(key) if key.len() < 16 => {
                return Err(ReplicationError::Config(
                    "security.master_key must be at least 16 characters".into(),
                ))
            }
            Some(_) => {}
        }
        if self.algorithm != "aes-256-gcm" {
            return Err(ReplicationError::Config(format!(
                "unsupported security.algorithm '{}'",
                self.algorithm
            )));
        }
        if self.kdf_iterations < 1000 {
            return Err(ReplicationError::Config(
                "security.kdf_iterations must be >= 1000".into(),
            ));
        }
        if self.key_length < 16 {
            return Err(ReplicationError::Config(
                "security.key_length must be >= 16".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncConfig: anti-entropy and bookkeeping intervals
// ═══════════════════════════════════════════════════════════════════════════════

/// Anti-entropy and bookkeeping settings. Intervals are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Full anti-entropy cycle interval. `None` disables the periodic cycle
    /// (manual runs via `run_anti_entropy` still work). Must be >= 1000 when
    /// set.
    #[serde(default = "default_anti_entropy_interval")]
    pub anti_entropy_interval_ms: Option<u64>,

    /// Lightweight vector-clock exchange interval, keeps causal metadata
    /// current between full cycles.
    #[serde(default = "default_clock_sync_interval")]
    pub clock_sync_interval_ms: u64,

    /// Retention window for processed message IDs. Must be >= 1000.
    #[serde(default = "default_max_message_age")]
    pub max_message_age_ms: u64,

    /// How often the recent-message set is swept.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Bound on per-path version history. Must be >= 1.
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,

    /// Optional token-bucket rate limit for inbound `put` traffic.
    /// Anti-entropy frames are exempt.
    #[serde(default)]
    pub rate_limit: Option<crate::resilience::RateLimitConfig>,
}

fn default_anti_entropy_interval() -> Option<u64> {
    Some(30_000)
}

fn default_clock_sync_interval() -> u64 {
    2_000
}

fn default_max_message_age() -> u64 {
    300_000
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_max_versions() -> usize {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            anti_entropy_interval_ms: default_anti_entropy_interval(),
            clock_sync_interval_ms: default_clock_sync_interval(),
            max_message_age_ms: default_max_message_age(),
            sweep_interval_ms: default_sweep_interval(),
            max_versions: default_max_versions(),
            rate_limit: None,
        }
    }
}

impl SyncConfig {
    /// Fast intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            anti_entropy_interval_ms: None,
            clock_sync_interval_ms: 100,
            max_message_age_ms: 5_000,
            sweep_interval_ms: 1_000,
            max_versions: 10,
            rate_limit: None,
        }
    }

    /// Anti-entropy interval as a Duration, if enabled.
    pub fn anti_entropy_interval(&self) -> Option<Duration> {
        self.anti_entropy_interval_ms.map(Duration::from_millis)
    }

    /// Clock sync interval as a Duration.
    pub fn clock_sync_interval(&self) -> Duration {
        Duration::from_millis(self.clock_sync_interval_ms)
    }

    /// Message ID retention window as a Duration.
    pub fn max_message_age(&self) -> Duration {
        Duration::from_millis(self.max_message_age_ms)
    }

    /// Recent-set sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if let Some(interval) = self.anti_entropy_interval_ms {
            if interval < 1000 {
                return Err(ReplicationError::Config(
                    "sync.anti_entropy_interval_ms must be >= 1000 or null".into(),
                ));
            }
        }
        if self.max_message_age_ms < 1000 {
            return Err(ReplicationError::Config(
                "sync.max_message_age_ms must be >= 1000".into(),
            ));
        }
        if self.max_versions < 1 {
            return Err(ReplicationError::Config(
                "sync.max_versions must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConflictConfig: default + per-path strategies
// ═══════════════════════════════════════════════════════════════════════════════

/// A named conflict resolution strategy.
///
/// `last-write-wins` is accepted as a legacy alias of `vector-dominance`:
/// "last" here means causally last, never wall-clock last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    VectorDominance,
    FirstWriteWins,
    MergeFields,
    Custom,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::VectorDominance
    }
}

impl FromStr for Strategy {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vector-dominance" | "last-write-wins" => Ok(Strategy::VectorDominance),
            "first-write-wins" => Ok(Strategy::FirstWriteWins),
            "merge-fields" => Ok(Strategy::MergeFields),
            "custom" => Ok(Strategy::Custom),
            other => Err(ReplicationError::Config(format!(
                "unknown conflict strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::VectorDominance => "vector-dominance",
            Strategy::FirstWriteWins => "first-write-wins",
            Strategy::MergeFields => "merge-fields",
            Strategy::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Conflict resolution configuration.
///
/// Custom resolver *functions* are registered on the node at runtime via
/// `register_conflict_resolver`; only strategy names live in config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Strategy used when no path rule matches.
    #[serde(default)]
    pub default_strategy: Strategy,

    /// Map from path prefix to strategy name. Longest matching prefix wins.
    #[serde(default)]
    pub path_strategies: HashMap<String, Strategy>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
