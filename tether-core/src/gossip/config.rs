use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Gossip engine tuning knobs loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Interval between direct probes.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Timeout before a probe is treated as failed.
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Time allotted before suspected peers are treated as dead.
    #[serde(with = "humantime_serde")]
    pub suspicion_timeout: Duration,
    /// Time dead or departed peers are remembered before their state is
    /// dropped entirely.
    #[serde(with = "humantime_serde")]
    pub expiry_timeout: Duration,
    /// Number of indirect probes to request when a direct probe fails.
    pub indirect_probes: usize,
    /// Maximum membership rumors piggybacked per message.
    pub gossip_batch: usize,
    /// Maximum key/value deltas carried per message.
    pub delta_batch: usize,
    /// Maximum datagram size for gossip traffic.
    pub max_packet_size: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            ack_timeout: Duration::from_millis(600),
            suspicion_timeout: Duration::from_secs(3),
            expiry_timeout: Duration::from_secs(30),
            indirect_probes: 3,
            gossip_batch: 6,
            delta_batch: 16,
            max_packet_size: 1_400,
        }
    }
}

impl GossipConfig {
    /// Fan-out used when broadcasting rumors and state changes.
    #[must_use]
    pub fn broadcast_fanout(&self) -> usize {
        self.indirect_probes.max(3)
    }
}
