use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Gossiper, GossipWatcher};
use crate::netmap::{NetworkMap, NetworkMapEvent, Node, NodeStatus, Subscription};

const PROXY_ADDR_KEY: &str = "proxy_addr";
const ADMIN_ADDR_KEY: &str = "admin_addr";
const STATUS_KEY: &str = "status";
const ENDPOINT_KEY_PREFIX: &str = "endpoint:";

fn endpoint_key(endpoint: &str) -> String {
    format!("{ENDPOINT_KEY_PREFIX}{endpoint}")
}

enum KeyKind<'a> {
    ProxyAddr,
    AdminAddr,
    Status,
    Endpoint(&'a str),
    Unknown,
}

fn classify(key: &str) -> KeyKind<'_> {
    match key {
        PROXY_ADDR_KEY => KeyKind::ProxyAddr,
        ADMIN_ADDR_KEY => KeyKind::AdminAddr,
        STATUS_KEY => KeyKind::Status,
        _ => match key.strip_prefix(ENDPOINT_KEY_PREFIX) {
            Some(endpoint) if !endpoint.is_empty() => KeyKind::Endpoint(endpoint),
            _ => KeyKind::Unknown,
        },
    }
}

// Listener counts are advertised as positive decimal integers; zero is a
// deletion and never appears as a value.
fn parse_listeners(value: &str) -> Option<usize> {
    value.parse::<usize>().ok().filter(|count| *count >= 1)
}

// Remote node state accumulated before promotion into the network map.
#[derive(Default)]
struct PendingNode {
    proxy_addr: Option<String>,
    admin_addr: Option<String>,
    status: Option<NodeStatus>,
    endpoints: BTreeMap<String, usize>,
}

impl PendingNode {
    fn promotable(&self) -> bool {
        self.proxy_addr.is_some() && self.admin_addr.is_some()
    }

    fn into_node(self, id: &str) -> Option<Node> {
        Some(Node {
            id: id.to_string(),
            status: self.status.unwrap_or(NodeStatus::Active),
            proxy_addr: self.proxy_addr?,
            admin_addr: self.admin_addr?,
            endpoints: self.endpoints,
        })
    }
}

/// Bridges the network map and the gossip engine.
///
/// Outbound, the syncer seeds gossip with the local node's state and mirrors
/// every subsequent local change. Inbound, it folds gossip callbacks into
/// network-map mutations: remote nodes are buffered until both addresses are
/// known, then promoted atomically with whatever endpoints accumulated in the
/// meantime.
///
/// Callbacks targeting the local node's id are dropped here rather than
/// relying on the engine to suppress self-notifications, so gossip echoes can
/// never corrupt the authoritative local view.
pub struct Syncer {
    netmap: Arc<NetworkMap>,
    local_id: String,
    pending: Mutex<HashMap<String, PendingNode>>,
    subscription: Mutex<Option<Subscription>>,
}

impl Syncer {
    /// Creates a syncer around the given network map.
    #[must_use]
    pub fn new(netmap: Arc<NetworkMap>) -> Self {
        let local_id = netmap.local_id();
        Self {
            netmap,
            local_id,
            pending: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
        }
    }

    /// Seeds gossip with the local node's current state and starts mirroring
    /// local network-map changes to `gossiper`.
    pub fn sync(&self, gossiper: Arc<dyn Gossiper>) {
        let mirror = Arc::clone(&gossiper);
        let subscription = self.netmap.subscribe(move |event| match event {
            NetworkMapEvent::LocalEndpointUpdated {
                endpoint,
                listeners,
            } => {
                mirror.upsert_local(&endpoint_key(endpoint), &listeners.to_string());
            }
            NetworkMapEvent::LocalEndpointRemoved { endpoint } => {
                mirror.delete_local(&endpoint_key(endpoint));
            }
            NetworkMapEvent::LocalStatusUpdated(status) => {
                mirror.upsert_local(STATUS_KEY, status.as_str());
            }
            NetworkMapEvent::NodeUpserted(_) | NetworkMapEvent::NodeRemoved { .. } => {}
        });
        *self.subscription.lock() = Some(subscription);

        let local = self.netmap.local_node();
        gossiper.upsert_local(PROXY_ADDR_KEY, &local.proxy_addr);
        gossiper.upsert_local(ADMIN_ADDR_KEY, &local.admin_addr);
        // The default status is implied; peers assume active until told
        // otherwise.
        if local.status != NodeStatus::Active {
            gossiper.upsert_local(STATUS_KEY, local.status.as_str());
        }
        for (endpoint, listeners) in &local.endpoints {
            gossiper.upsert_local(&endpoint_key(endpoint), &listeners.to_string());
        }
    }

    fn is_local(&self, id: &str) -> bool {
        self.local_id == id
    }
}

impl GossipWatcher for Syncer {
    fn on_join(&self, id: &str) {
        if self.is_local(id) {
            return;
        }
        if self.netmap.node(id).is_some() {
            return;
        }
        debug!(node = id, "peer joined; awaiting state");
        self.pending
            .lock()
            .entry(id.to_string())
            .or_default();
    }

    fn on_leave(&self, id: &str) {
        if self.is_local(id) {
            return;
        }
        if self.pending.lock().remove(id).is_some() {
            debug!(node = id, "discarding pending peer on leave");
            return;
        }
        self.netmap.update_remote_status(id, NodeStatus::Left);
    }

    fn on_down(&self, id: &str) {
        if self.is_local(id) {
            return;
        }
        {
            let mut pending = self.pending.lock();
            if let Some(node) = pending.get_mut(id) {
                node.status = Some(NodeStatus::Down);
                return;
            }
        }
        self.netmap.update_remote_status(id, NodeStatus::Down);
    }

    fn on_healthy(&self, id: &str) {
        if self.is_local(id) {
            return;
        }
        {
            let mut pending = self.pending.lock();
            if let Some(node) = pending.get_mut(id) {
                node.status = Some(NodeStatus::Active);
                return;
            }
        }
        self.netmap.update_remote_status(id, NodeStatus::Active);
    }

    fn on_expired(&self, id: &str) {
        if self.is_local(id) {
            return;
        }
        if self.pending.lock().remove(id).is_some() {
            debug!(node = id, "discarding pending peer on expiry");
            return;
        }
        self.netmap.remove_node(id);
    }

    fn on_upsert_key(&self, id: &str, key: &str, value: &str) {
        if self.is_local(id) {
            return;
        }

        let mut pending = self.pending.lock();
        if let Some(node) = pending.get_mut(id) {
            match classify(key) {
                KeyKind::ProxyAddr => node.proxy_addr = Some(value.to_string()),
                KeyKind::AdminAddr => node.admin_addr = Some(value.to_string()),
                KeyKind::Status => match NodeStatus::from_wire(value) {
                    Some(status) => node.status = Some(status),
                    None => warn!(node = id, key, value, "ignoring unknown status value"),
                },
                KeyKind::Endpoint(endpoint) => match parse_listeners(value) {
                    Some(listeners) => {
                        node.endpoints.insert(endpoint.to_string(), listeners);
                    }
                    None => warn!(node = id, key, value, "ignoring malformed listener count"),
                },
                KeyKind::Unknown => debug!(node = id, key, "ignoring unknown key"),
            }
            if !node.promotable() {
                return;
            }
            let promoted = pending.remove(id).and_then(|node| node.into_node(id));
            drop(pending);
            if let Some(node) = promoted {
                debug!(node = id, "promoting peer into the network map");
                self.netmap.upsert_node(node);
            }
            return;
        }
        drop(pending);

        // Updates for ids that are neither pending nor visible are dropped;
        // they race a concurrent expiry and the state will be re-delivered if
        // the node comes back.
        match classify(key) {
            KeyKind::ProxyAddr => {
                if let Some(mut node) = self.netmap.node(id) {
                    node.proxy_addr = value.to_string();
                    self.netmap.upsert_node(node);
                }
            }
            KeyKind::AdminAddr => {
                if let Some(mut node) = self.netmap.node(id) {
                    node.admin_addr = value.to_string();
                    self.netmap.upsert_node(node);
                }
            }
            KeyKind::Status => match NodeStatus::from_wire(value) {
                Some(status) => self.netmap.update_remote_status(id, status),
                None => warn!(node = id, key, value, "ignoring unknown status value"),
            },
            KeyKind::Endpoint(endpoint) => match parse_listeners(value) {
                Some(listeners) => self.netmap.update_remote_endpoint(id, endpoint, listeners),
                None => warn!(node = id, key, value, "ignoring malformed listener count"),
            },
            KeyKind::Unknown => debug!(node = id, key, "ignoring unknown key"),
        }
    }

    fn on_delete_key(&self, id: &str, key: &str) {
        if self.is_local(id) {
            return;
        }

        let mut pending = self.pending.lock();
        if let Some(node) = pending.get_mut(id) {
            match classify(key) {
                KeyKind::ProxyAddr => node.proxy_addr = None,
                KeyKind::AdminAddr => node.admin_addr = None,
                KeyKind::Status => node.status = None,
                KeyKind::Endpoint(endpoint) => {
                    node.endpoints.remove(endpoint);
                }
                KeyKind::Unknown => {}
            }
            return;
        }
        drop(pending);

        match classify(key) {
            KeyKind::Endpoint(endpoint) => self.netmap.remove_remote_endpoint(id, endpoint),
            KeyKind::ProxyAddr | KeyKind::AdminAddr => {
                // Addresses are required for visible nodes; keep the last
                // known value.
                warn!(node = id, key, "ignoring deletion of required node key");
            }
            KeyKind::Status => debug!(node = id, "ignoring status deletion"),
            KeyKind::Unknown => {}
        }
    }
}
