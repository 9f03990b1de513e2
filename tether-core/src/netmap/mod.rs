//! Eventually-consistent local view of the cluster.
//!
//! The network map holds exactly one local node plus the remote nodes learned
//! through gossip, and answers the routing question "which nodes can serve
//! endpoint E?". Local mutations (endpoint attach/detach, status changes) are
//! driven by the endpoint registry and the bootstrapper; remote mutations are
//! driven exclusively by the gossip syncer. Subscribers observe every state
//! change through a callback bus.

mod node;

pub use node::{Node, NodeStatus};

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

/// State change notification delivered to network map subscribers.
#[derive(Debug, Clone)]
pub enum NetworkMapEvent {
    /// A local endpoint was registered or its listener count changed.
    LocalEndpointUpdated {
        /// Endpoint id.
        endpoint: String,
        /// New listener count (always >= 1).
        listeners: usize,
    },
    /// The last listener for a local endpoint detached.
    LocalEndpointRemoved {
        /// Endpoint id.
        endpoint: String,
    },
    /// The local node's status changed.
    LocalStatusUpdated(NodeStatus),
    /// A remote node became visible, or an already visible node changed.
    /// Carries the full new snapshot.
    NodeUpserted(Node),
    /// A remote node was removed from the map.
    NodeRemoved {
        /// Id of the removed node.
        id: String,
    },
}

type Observer = Arc<dyn Fn(&NetworkMapEvent) + Send + Sync>;

type ObserverList = Arc<Mutex<Vec<(u64, Observer)>>>;

/// Handle returned by [`NetworkMap::subscribe`]. Dropping it unsubscribes the
/// observer.
pub struct Subscription {
    observers: ObserverList,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.observers.lock().retain(|(id, _)| *id != self.id);
    }
}

struct State {
    local: Node,
    // Remote nodes keyed by id. Records below Active promotion may be stored
    // here defensively but are filtered from every read and notification.
    remotes: HashMap<String, Node>,
}

/// Authoritative local view of the cluster.
///
/// Reads take the state lock shared and return copies; mutations take it
/// exclusive. Observer notifications are dispatched after the state lock is
/// released, serialized so that subscribers see mutations for any given node
/// in the order they were applied. Observers may read the map re-entrantly
/// but must not mutate it from inside a callback.
pub struct NetworkMap {
    state: RwLock<State>,
    observers: ObserverList,
    next_observer_id: AtomicU64,
}

impl NetworkMap {
    /// Creates a network map around the given local node.
    #[must_use]
    pub fn new(local: Node) -> Self {
        Self {
            state: RwLock::new(State {
                local,
                remotes: HashMap::new(),
            }),
            observers: Arc::new(Mutex::new(Vec::new())),
            next_observer_id: AtomicU64::new(0),
        }
    }

    /// Snapshot of the local node.
    #[must_use]
    pub fn local_node(&self) -> Node {
        self.state.read().local.clone()
    }

    /// Id of the local node.
    #[must_use]
    pub fn local_id(&self) -> String {
        self.state.read().local.id.clone()
    }

    /// Snapshot of a visible node, local or remote.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<Node> {
        let state = self.state.read();
        if state.local.id == id {
            return Some(state.local.clone());
        }
        state
            .remotes
            .get(id)
            .filter(|node| node.status != NodeStatus::Pending)
            .cloned()
    }

    /// Snapshot of all visible nodes, unordered.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        let state = self.state.read();
        let mut nodes = Vec::with_capacity(state.remotes.len() + 1);
        nodes.push(state.local.clone());
        nodes.extend(
            state
                .remotes
                .values()
                .filter(|node| node.status != NodeStatus::Pending)
                .cloned(),
        );
        nodes
    }

    /// All visible nodes with at least one listener for `endpoint`, including
    /// the local node when it qualifies. Order is unspecified.
    #[must_use]
    pub fn lookup_endpoint(&self, endpoint: &str) -> Vec<Node> {
        let state = self.state.read();
        let mut nodes = Vec::new();
        if state.local.has_endpoint(endpoint) {
            nodes.push(state.local.clone());
        }
        nodes.extend(
            state
                .remotes
                .values()
                .filter(|node| node.status != NodeStatus::Pending && node.has_endpoint(endpoint))
                .cloned(),
        );
        nodes
    }

    /// Increments the local listener count for `endpoint`, inserting it at 1
    /// when absent.
    pub fn add_local_endpoint(&self, endpoint: &str) {
        self.mutate(|state| {
            let count = state
                .local
                .endpoints
                .entry(endpoint.to_string())
                .or_insert(0);
            *count += 1;
            Some(NetworkMapEvent::LocalEndpointUpdated {
                endpoint: endpoint.to_string(),
                listeners: *count,
            })
        });
    }

    /// Decrements the local listener count for `endpoint`, deleting the entry
    /// when it reaches 0. Silent no-op when the endpoint is not registered.
    pub fn remove_local_endpoint(&self, endpoint: &str) {
        self.mutate(|state| {
            let Some(count) = state.local.endpoints.get_mut(endpoint) else {
                return None;
            };
            if *count > 1 {
                *count -= 1;
                let listeners = *count;
                Some(NetworkMapEvent::LocalEndpointUpdated {
                    endpoint: endpoint.to_string(),
                    listeners,
                })
            } else {
                state.local.endpoints.remove(endpoint);
                Some(NetworkMapEvent::LocalEndpointRemoved {
                    endpoint: endpoint.to_string(),
                })
            }
        });
    }

    /// Sets the local node's status. No-op when the status is unchanged.
    pub fn set_local_status(&self, status: NodeStatus) {
        self.mutate(|state| {
            if state.local.status == status {
                return None;
            }
            state.local.status = status;
            Some(NetworkMapEvent::LocalStatusUpdated(status))
        });
    }

    /// Adds or replaces a remote node record. Used exclusively by the gossip
    /// syncer; the local id is silently ignored.
    pub fn upsert_node(&self, node: Node) {
        self.mutate(|state| {
            if state.local.id == node.id {
                return None;
            }
            let event = (node.status != NodeStatus::Pending)
                .then(|| NetworkMapEvent::NodeUpserted(node.clone()));
            state.remotes.insert(node.id.clone(), node);
            event
        });
    }

    /// Updates a remote node's status. No-op for unknown or local ids.
    pub fn update_remote_status(&self, id: &str, status: NodeStatus) {
        self.mutate(|state| {
            if state.local.id == id {
                return None;
            }
            let node = state.remotes.get_mut(id)?;
            node.status = status;
            Self::visible_snapshot(node)
        });
    }

    /// Sets a remote node's listener count for `endpoint`. No-op for unknown
    /// or local ids.
    pub fn update_remote_endpoint(&self, id: &str, endpoint: &str, listeners: usize) {
        self.mutate(|state| {
            if state.local.id == id {
                return None;
            }
            let node = state.remotes.get_mut(id)?;
            if listeners == 0 {
                node.endpoints.remove(endpoint);
            } else {
                node.endpoints.insert(endpoint.to_string(), listeners);
            }
            Self::visible_snapshot(node)
        });
    }

    /// Removes an endpoint from a remote node. No-op for unknown ids or
    /// endpoints, and for the local id.
    pub fn remove_remote_endpoint(&self, id: &str, endpoint: &str) {
        self.mutate(|state| {
            if state.local.id == id {
                return None;
            }
            let node = state.remotes.get_mut(id)?;
            node.endpoints.remove(endpoint)?;
            Self::visible_snapshot(node)
        });
    }

    /// Removes a remote node entirely. No-op for unknown or local ids.
    pub fn remove_node(&self, id: &str) {
        self.mutate(|state| {
            if state.local.id == id {
                return None;
            }
            let node = state.remotes.remove(id)?;
            (node.status != NodeStatus::Pending).then(|| NetworkMapEvent::NodeRemoved {
                id: id.to_string(),
            })
        });
    }

    /// Registers an observer invoked on every state change with the event
    /// kind and the new snapshot. The observer is unsubscribed when the
    /// returned [`Subscription`] is dropped.
    #[must_use]
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&NetworkMapEvent) + Send + Sync + 'static,
    {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(observer)));
        Subscription {
            observers: Arc::clone(&self.observers),
            id,
        }
    }

    fn visible_snapshot(node: &Node) -> Option<NetworkMapEvent> {
        (node.status != NodeStatus::Pending).then(|| NetworkMapEvent::NodeUpserted(node.clone()))
    }

    // Applies one mutation and dispatches the resulting event. The observer
    // list lock is taken before the state lock and held across dispatch so
    // notifications are delivered in mutation order; the state lock itself is
    // released before any observer runs.
    fn mutate<F>(&self, apply: F)
    where
        F: FnOnce(&mut State) -> Option<NetworkMapEvent>,
    {
        let observers = self.observers.lock();
        let event = {
            let mut state = self.state.write();
            apply(&mut state)
        };
        if let Some(event) = event {
            for (_, observer) in observers.iter() {
                let callback = &**observer;
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    warn!("network map subscriber panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn test_map() -> NetworkMap {
        NetworkMap::new(Node::new("local", "10.26.104.56:8000", "10.26.104.56:8001"))
    }

    fn remote(id: &str) -> Node {
        Node::new(id, "10.26.104.98:8000", "10.26.104.98:8001")
    }

    #[test]
    fn local_endpoint_counts_follow_adds_and_removes() {
        let map = test_map();

        map.add_local_endpoint("my-endpoint");
        map.add_local_endpoint("my-endpoint");
        map.add_local_endpoint("my-endpoint");
        assert_eq!(
            map.local_node().endpoints.get("my-endpoint").copied(),
            Some(3)
        );

        map.remove_local_endpoint("my-endpoint");
        map.remove_local_endpoint("my-endpoint");
        assert_eq!(
            map.local_node().endpoints.get("my-endpoint").copied(),
            Some(1)
        );

        map.remove_local_endpoint("my-endpoint");
        assert!(!map.local_node().endpoints.contains_key("my-endpoint"));

        // Removing below zero stays a no-op.
        map.remove_local_endpoint("my-endpoint");
        map.remove_local_endpoint("other-endpoint");
        assert!(map.local_node().endpoints.is_empty());
    }

    #[test]
    fn lookup_endpoint_returns_exactly_the_qualifying_nodes() {
        let map = test_map();
        map.add_local_endpoint("my-endpoint");

        let mut with_endpoint = remote("remote-1");
        with_endpoint.endpoints.insert("my-endpoint".to_string(), 5);
        map.upsert_node(with_endpoint);
        map.upsert_node(remote("remote-2"));

        let nodes = map.lookup_endpoint("my-endpoint");
        let mut ids: Vec<_> = nodes.iter().map(|node| node.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["local", "remote-1"]);

        assert!(map.lookup_endpoint("unknown-endpoint").is_empty());
    }

    #[test]
    fn left_nodes_remain_routable() {
        let map = test_map();
        let mut node = remote("remote-1");
        node.endpoints.insert("my-endpoint".to_string(), 1);
        map.upsert_node(node);

        map.update_remote_status("remote-1", NodeStatus::Left);

        let nodes = map.lookup_endpoint("my-endpoint");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, NodeStatus::Left);
    }

    #[test]
    fn pending_nodes_are_hidden_from_reads() {
        let map = test_map();
        let mut node = remote("remote-1");
        node.status = NodeStatus::Pending;
        node.endpoints.insert("my-endpoint".to_string(), 1);
        map.upsert_node(node);

        assert!(map.node("remote-1").is_none());
        assert_eq!(map.nodes().len(), 1);
        assert!(map.lookup_endpoint("my-endpoint").is_empty());
    }

    #[test]
    fn visible_nodes_always_carry_addresses_and_terminal_status() {
        let map = test_map();
        let mut node = remote("remote-1");
        node.status = NodeStatus::Down;
        map.upsert_node(node);
        map.upsert_node(remote("remote-2"));

        for node in map.nodes() {
            assert_ne!(node.status, NodeStatus::Pending);
            assert!(!node.proxy_addr.is_empty());
            assert!(!node.admin_addr.is_empty());
        }
    }

    #[test]
    fn remote_mutations_ignore_the_local_id() {
        let map = test_map();
        let local = map.local_node();

        map.upsert_node(Node::new("local", "10.0.0.1:1", "10.0.0.1:2"));
        map.update_remote_status("local", NodeStatus::Down);
        map.update_remote_endpoint("local", "my-endpoint", 3);
        map.remove_node("local");

        assert_eq!(map.local_node(), local);
    }

    #[test]
    fn remote_mutations_on_unknown_ids_are_noops() {
        let map = test_map();
        map.update_remote_status("ghost", NodeStatus::Down);
        map.update_remote_endpoint("ghost", "my-endpoint", 1);
        map.remove_remote_endpoint("ghost", "my-endpoint");
        map.remove_node("ghost");
        assert_eq!(map.nodes().len(), 1);
    }

    #[test]
    fn subscribers_observe_events_until_unsubscribed() {
        let map = test_map();
        let events = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&events);
        let subscription = map.subscribe(move |event| {
            recorded.lock().push(format!("{event:?}"));
        });

        map.add_local_endpoint("my-endpoint");
        map.set_local_status(NodeStatus::Left);
        assert_eq!(events.lock().len(), 2);

        drop(subscription);
        map.add_local_endpoint("my-endpoint");
        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn subscriber_panic_does_not_affect_other_subscribers() {
        let map = test_map();
        let delivered = Arc::new(AtomicUsize::new(0));

        let _panicking = map.subscribe(|_| panic!("boom"));
        let count = Arc::clone(&delivered);
        let _counting = map.subscribe(move |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });

        map.add_local_endpoint("my-endpoint");
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn status_events_fire_only_on_change() {
        let map = test_map();
        let events = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&events);
        let _subscription = map.subscribe(move |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });

        map.set_local_status(NodeStatus::Active);
        assert_eq!(events.load(Ordering::Relaxed), 0);
        map.set_local_status(NodeStatus::Down);
        assert_eq!(events.load(Ordering::Relaxed), 1);
    }
}
