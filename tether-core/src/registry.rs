//! Tracks upstream listeners attached to this node.
//!
//! Each attached listener registers the endpoint id it serves; the registry
//! keeps the network map's local endpoint counts in step so the rest of the
//! cluster learns what this node can route.

use std::sync::Arc;

use tracing::debug;

use crate::netmap::NetworkMap;

/// Registers upstream listeners as they attach to and detach from this node.
pub struct EndpointRegistry {
    netmap: Arc<NetworkMap>,
}

impl EndpointRegistry {
    /// Creates a registry feeding the given network map.
    #[must_use]
    pub fn new(netmap: Arc<NetworkMap>) -> Self {
        Self { netmap }
    }

    /// Registers one listener for `endpoint`. The local listener count is
    /// incremented immediately and decremented again when the returned
    /// registration is dropped.
    #[must_use]
    pub fn attach(&self, endpoint: &str) -> ListenerRegistration {
        debug!(endpoint, "listener attached");
        self.netmap.add_local_endpoint(endpoint);
        ListenerRegistration {
            netmap: Arc::clone(&self.netmap),
            endpoint: endpoint.to_string(),
        }
    }

    /// Number of listeners currently attached for `endpoint`.
    #[must_use]
    pub fn listeners(&self, endpoint: &str) -> usize {
        self.netmap
            .local_node()
            .endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }
}

/// Guard for one attached listener.
pub struct ListenerRegistration {
    netmap: Arc<NetworkMap>,
    endpoint: String,
}

impl ListenerRegistration {
    /// Endpoint this listener serves.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        debug!(endpoint = %self.endpoint, "listener detached");
        self.netmap.remove_local_endpoint(&self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::netmap::Node;

    fn test_registry() -> (Arc<NetworkMap>, EndpointRegistry) {
        let netmap = Arc::new(NetworkMap::new(Node::new(
            "local",
            "10.26.104.56:8000",
            "10.26.104.56:8001",
        )));
        let registry = EndpointRegistry::new(Arc::clone(&netmap));
        (netmap, registry)
    }

    #[test]
    fn listeners_for_the_same_endpoint_nest() {
        let (netmap, registry) = test_registry();

        let first = registry.attach("my-endpoint");
        let second = registry.attach("my-endpoint");
        assert_eq!(registry.listeners("my-endpoint"), 2);

        drop(first);
        assert_eq!(registry.listeners("my-endpoint"), 1);
        assert_eq!(netmap.lookup_endpoint("my-endpoint").len(), 1);

        drop(second);
        assert_eq!(registry.listeners("my-endpoint"), 0);
        assert!(netmap.lookup_endpoint("my-endpoint").is_empty());
    }

    #[test]
    fn registrations_for_distinct_endpoints_are_independent() {
        let (_netmap, registry) = test_registry();

        let first = registry.attach("endpoint-1");
        let _second = registry.attach("endpoint-2");

        drop(first);
        assert_eq!(registry.listeners("endpoint-1"), 0);
        assert_eq!(registry.listeners("endpoint-2"), 1);
    }
}
