use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tether_core::GossipConfig;

/// Top-level server configuration. Loadable from a TOML file, with the
/// common fields overridable by command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Stable node identifier. Auto-generated when empty.
    pub node_id: String,
    /// Proxy listener addresses.
    pub proxy: ProxyConfig,
    /// Admin listener addresses.
    pub admin: AdminConfig,
    /// Cluster membership settings.
    pub cluster: ClusterConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Rejects configurations that cannot possibly start.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.bind_addr.is_empty() {
            bail!("proxy.bind_addr must not be empty");
        }
        if self.admin.bind_addr.is_empty() {
            bail!("admin.bind_addr must not be empty");
        }
        if self.cluster.bind_addr.is_empty() {
            bail!("cluster.bind_addr must not be empty");
        }
        Ok(())
    }
}

/// Addresses for the proxy listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Host/port the proxy listener binds to.
    pub bind_addr: String,
    /// Host/port advertised to peers for request forwarding. Derived from
    /// the bind address when unset; required when binding to an unspecified
    /// host that peers cannot reach.
    pub advertise_addr: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            advertise_addr: None,
        }
    }
}

/// Addresses for the admin listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Host/port the admin listener binds to.
    pub bind_addr: String,
    /// Host/port advertised to peers for admin access.
    pub advertise_addr: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".to_string(),
            advertise_addr: None,
        }
    }
}

/// Cluster membership settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Host/port the gossip transport binds to.
    pub bind_addr: String,
    /// Host/port advertised to peers for gossip traffic.
    pub advertise_addr: Option<String>,
    /// Addresses of existing cluster members to join. Each entry may be a
    /// `host:port` pair or a hostname resolving to one or more members;
    /// entries without a port use this node's gossip port. Members propagate
    /// membership onwards, so a subset of the cluster is enough.
    pub join: Vec<String>,
    /// Time allowed for the leave announcement to propagate during shutdown.
    #[serde(with = "humantime_serde")]
    pub leave_grace_period: Duration,
    /// Gossip engine tuning knobs.
    pub gossip: GossipConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7000".to_string(),
            advertise_addr: None,
            join: Vec::new(),
            leave_grace_period: Duration::from_secs(3),
            gossip: GossipConfig::default(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum log level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
