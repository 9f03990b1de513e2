//! Cluster membership and endpoint-routing core for the Tether reverse
//! proxy.
//!
//! Upstream listeners open long-lived outbound connections to any server
//! node and register endpoint identifiers; downstream requests name an
//! endpoint and are routed to whichever node currently holds a listener for
//! it. This crate provides the state that makes that answer possible on
//! every node:
//!
//! - [`netmap`]: the eventually-consistent view of all cluster nodes and
//!   their endpoint advertisements, with a reactive subscription bus.
//! - [`gossip`]: a SWIM-like engine disseminating each node's key/value
//!   state, and the [`gossip::Syncer`] bridging it to the network map.
//! - [`registry`]: bookkeeping for listeners attached to the local node.
//!
//! The proxy data path itself (HTTP front-end, request forwarding) lives in
//! the server binary and talks to this crate only through
//! [`netmap::NetworkMap`] lookups and subscriptions.

pub mod gossip;
pub mod netmap;
pub mod registry;

pub use gossip::{
    GossipConfig, GossipEngine, GossipError, GossipHandle, GossipStats, Gossiper, GossipWatcher,
    Syncer,
};
pub use netmap::{NetworkMap, NetworkMapEvent, Node, NodeStatus, Subscription};
pub use registry::{EndpointRegistry, ListenerRegistration};
