//! # meshkv
//!
//! An eventually-consistent, peer-to-peer replicated key-value store with
//! hierarchical path-shaped keys. Each node holds a full local replica on
//! durable storage, accepts local reads and writes, and gossips updates to
//! a mesh of peers over a confidential, authenticated transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               ReplicaNode                                 │
//! │                                                                           │
//! │  put/get/del/scan      ┌────────────────┐      ┌───────────────────────┐  │
//! │  ──────────────────────► WriteProcessor ├─────►│ ConflictResolver      │  │
//! │                        │ (dedupe, loop  │      │ (vector-dominance,    │  │
//! │  transport ──► Wire ───► prevention)    │      │  merge-fields, ...)   │  │
//! │  (envelope)            └───────┬────────┘      └───────────┬───────────┘  │
//! │                                │ persist                   │ consults     │
//! │                        ┌───────▼────────┐      ┌───────────▼───────────┐  │
//! │                        │ ReplicaStore   │      │ VectorClock           │  │
//! │                        │ (sqlite/memory)│      │ (causality layer)     │  │
//! │                        └───────┬────────┘      └───────────────────────┘  │
//! │                                │ notify                                   │
//! │  ┌─────────────────┐   ┌───────▼────────┐      ┌───────────────────────┐  │
//! │  │ Reconciler      │   │ SubscriptionBus│      │ VersionStore          │  │
//! │  │ (anti-entropy)  │   │ (prefix fanout)│      │ (bounded history)     │  │
//! │  └─────────────────┘   └────────────────┘      └───────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Convergence
//!
//! Writes flow two ways: real-time broadcast of every committed put, and a
//! periodic pull-based anti-entropy cycle that exchanges vector clocks and
//! streams records back in bounded batches. Concurrent writes are resolved
//! by causal dominance with a deterministic origin tiebreak, so every
//! replica lands on the same record without coordination. Wall-clock time
//! is never consulted for correctness.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshkv::{MemoryStore, MeshNetwork, NodeConfig, ReplicaNode};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> meshkv::Result<()> {
//!     let net = MeshNetwork::new();
//!     let node = ReplicaNode::new(
//!         NodeConfig::for_testing("n1"),
//!         MemoryStore::new(),
//!         net.endpoint("n1"),
//!     )?;
//!     node.start().await?;
//!
//!     node.put("greetings/hello", json!({"msg": "hi"})).await?;
//!     let value = node.get("greetings/hello").await?;
//!     println!("{:?}", value);
//!
//!     node.close().await;
//!     Ok(())
//! }
//! ```

pub mod anti_entropy;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod node;
pub mod resilience;
pub mod resolver;
pub mod store;
pub mod store_sqlite;
pub mod subscriptions;
pub mod transport;
pub mod versions;
pub mod wire;
pub mod writer;

// Re-exports for convenience
pub use clock::{ClockOrdering, Dominance, NodeId, VectorClock, Winner};
pub use config::{ConflictConfig, NodeConfig, PeerConfig, SecurityConfig, Strategy, SyncConfig};
pub use envelope::{generate_secure_id, Payload, SecurityEnvelope};
pub use error::{ReplicationError, Result};
pub use node::{HealthCheck, NodeState, PutReceipt, ReplicaNode};
pub use resolver::{ConflictResolver, ResolveConflict};
pub use store::{MemoryStore, Record, ReplicaStore};
pub use store_sqlite::SqliteStore;
pub use subscriptions::{SubscriberFn, SubscriptionBus, SubscriptionId};
pub use transport::{Frame, MemoryTransport, MeshNetwork, Transport};
pub use versions::VersionStore;
pub use wire::{Event, PutMessage};
pub use writer::WriteProcessor;
