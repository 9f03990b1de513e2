//! Gossip-based dissemination of cluster state.
//!
//! Every node advertises a flat bag of string key/value pairs describing
//! itself (addresses, status, endpoint listener counts). A SWIM-like engine
//! detects peer failures and disseminates each node's bag through the
//! cluster; the [`Syncer`] translates between those flat keys and the
//! semantic operations of the network map.

/// Gossip engine tuning knobs.
pub mod config;
/// SWIM-like gossip engine with per-node key/value dissemination over UDP.
pub mod engine;
/// Error types surfaced by the gossip subsystem.
pub mod error;
/// Versioned per-node key/value state, digests and deltas.
pub mod state;
/// Bridges the network map to the gossip engine.
pub mod syncer;

pub use config::GossipConfig;
pub use engine::{GossipEngine, GossipHandle, GossipMessage, GossipStats, PeerInfo};
pub use error::GossipError;
pub use syncer::Syncer;

/// Propagates the local node's key/value state to the rest of the cluster.
///
/// Implementations version each write internally; callers only ever supply
/// the latest value and may repeat writes idempotently. Propagation is
/// asynchronous and eventually consistent.
pub trait Gossiper: Send + Sync {
    /// Adds or updates a key advertised for the local node.
    fn upsert_local(&self, key: &str, value: &str);

    /// Stops advertising a key for the local node.
    fn delete_local(&self, key: &str);
}

/// Receives membership and state callbacks for remote nodes.
///
/// The engine serializes callbacks (one at a time) and never invokes them
/// while holding its internal locks, so implementations may freely call back
/// into the engine. Deliveries are eventually consistent and may arrive out
/// of order across nodes or duplicated; implementations must be idempotent
/// for repeated `(id, key, value)` deliveries. Key callbacks already reflect
/// latest-wins semantics, the engine owns version numbering.
pub trait GossipWatcher: Send + Sync {
    /// A peer has been discovered. No state for it has arrived yet.
    fn on_join(&self, id: &str);

    /// The peer announced a voluntary departure.
    fn on_leave(&self, id: &str);

    /// The failure detector suspects the peer.
    fn on_down(&self, id: &str);

    /// The peer is reachable again after [`on_down`](GossipWatcher::on_down).
    fn on_healthy(&self, id: &str);

    /// The peer should be forgotten entirely.
    fn on_expired(&self, id: &str);

    /// One key of the peer's advertised state was delivered.
    fn on_upsert_key(&self, id: &str, key: &str, value: &str);

    /// A key was removed from the peer's advertised state.
    fn on_delete_key(&self, id: &str, key: &str);
}
