use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not enough state has been received to route to the node. Pending nodes
    /// are never exposed through network map reads and never advertised.
    Pending,
    /// Node is healthy and accepting forwarded requests.
    Active,
    /// The failure detector currently suspects the node.
    Down,
    /// Node announced a voluntary departure.
    Left,
}

impl NodeStatus {
    /// Lowercase name used for the gossip `status` key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Down => "down",
            Self::Left => "left",
        }
    }

    /// Parses an advertised `status` value. `pending` is rejected since it is
    /// never advertised.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            _ => None,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes one cluster member and the endpoints it can serve.
///
/// Node records are plain values. All mutation happens inside the network map
/// under its lock; callers only ever see copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier, unique cluster-wide and immutable for the node's
    /// lifetime.
    pub id: String,
    /// Current lifecycle status.
    pub status: NodeStatus,
    /// `host:port` other nodes use to forward proxied requests to this node.
    pub proxy_addr: String,
    /// `host:port` of the node's admin server.
    pub admin_addr: String,
    /// Registered endpoint ids mapped to the number of listeners connected
    /// for that endpoint. Entries are always >= 1; an endpoint with no
    /// listeners has no entry.
    pub endpoints: BTreeMap<String, usize>,
}

impl Node {
    /// Creates an active node with no registered endpoints.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        proxy_addr: impl Into<String>,
        admin_addr: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            status: NodeStatus::Active,
            proxy_addr: proxy_addr.into(),
            admin_addr: admin_addr.into(),
            endpoints: BTreeMap::new(),
        }
    }

    /// Whether this node has at least one listener for `endpoint`.
    #[must_use]
    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.endpoints.get(endpoint).is_some_and(|count| *count >= 1)
    }
}
