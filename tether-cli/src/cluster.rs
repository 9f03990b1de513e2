use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::time;
use tracing::info;
use uuid::Uuid;

use tether_core::gossip::{GossipEngine, GossipHandle, GossipWatcher, Gossiper, Syncer};
use tether_core::netmap::{NetworkMap, Node, NodeStatus};
use tether_core::registry::EndpointRegistry;

use crate::config::ServerConfig;

/// Running cluster runtime for one server node.
pub struct Cluster {
    /// Identifier assigned to the local node.
    pub node_id: String,
    /// Shared network map for routing and admin surfaces.
    pub netmap: Arc<NetworkMap>,
    /// Registry the upstream listener front-end attaches through.
    pub registry: Arc<EndpointRegistry>,
    /// Gossip engine handle for diagnostics.
    pub engine: Arc<GossipEngine>,
    handle: GossipHandle,
    leave_grace_period: Duration,
}

impl Cluster {
    /// Announces the node's departure, waits for it to propagate, then stops
    /// the gossip engine.
    pub async fn shutdown(self) {
        info!("leaving cluster");
        self.netmap.set_local_status(NodeStatus::Left);
        self.engine.leave().await;
        time::sleep(self.leave_grace_period).await;
        self.handle.shutdown().await;
    }
}

/// Wires the network map, syncer and gossip engine together per
/// configuration and joins any configured cluster members.
pub async fn bootstrap(config: &ServerConfig) -> Result<Cluster> {
    let node_id = if config.node_id.trim().is_empty() {
        format!("tether-{}", Uuid::new_v4())
    } else {
        config.node_id.clone()
    };

    let gossip_bind: SocketAddr = config
        .cluster
        .bind_addr
        .parse()
        .with_context(|| format!("invalid cluster.bind_addr '{}'", config.cluster.bind_addr))?;
    let seeds = resolve_join_addrs(&config.cluster.join, gossip_bind.port())?;

    let configured_advertise = config
        .cluster
        .advertise_addr
        .as_deref()
        .map(|addr| {
            addr.parse::<SocketAddr>()
                .with_context(|| format!("invalid cluster.advertise_addr '{addr}'"))
        })
        .transpose()?;
    let gossip_advertise = pick_advertise_addr(configured_advertise, gossip_bind, &seeds)
        .ok_or_else(|| {
            anyhow!(
                "unable to determine a reachable gossip address for bind {gossip_bind}; \
                 set cluster.advertise_addr to a host:port peers can reach"
            )
        })?;

    let proxy_addr = advertised_addr(
        &config.proxy.bind_addr,
        config.proxy.advertise_addr.as_deref(),
        gossip_advertise,
        "proxy.bind_addr",
    )?;
    let admin_addr = advertised_addr(
        &config.admin.bind_addr,
        config.admin.advertise_addr.as_deref(),
        gossip_advertise,
        "admin.bind_addr",
    )?;

    info!(
        node_id = %node_id,
        proxy_addr = %proxy_addr,
        admin_addr = %admin_addr,
        gossip_addr = %gossip_advertise,
        "starting cluster node"
    );

    let netmap = Arc::new(NetworkMap::new(Node::new(
        node_id.clone(),
        proxy_addr,
        admin_addr,
    )));
    let registry = Arc::new(EndpointRegistry::new(Arc::clone(&netmap)));
    let syncer = Arc::new(Syncer::new(Arc::clone(&netmap)));

    let (engine, handle) = GossipEngine::spawn(
        node_id.clone(),
        gossip_bind,
        Some(gossip_advertise),
        config.cluster.gossip.clone(),
        Arc::clone(&syncer) as Arc<dyn GossipWatcher>,
    )
    .await
    .context("failed to start gossip engine")?;
    syncer.sync(Arc::clone(&engine) as Arc<dyn Gossiper>);

    if seeds.is_empty() {
        info!("no cluster members configured; forming a new cluster");
    } else {
        engine.join(&seeds).await;
    }

    Ok(Cluster {
        node_id,
        netmap,
        registry,
        engine,
        handle,
        leave_grace_period: config.cluster.leave_grace_period,
    })
}

// Join entries may be socket addresses or hostnames (e.g. a headless
// service); entries without a port use this node's gossip port.
fn resolve_join_addrs(members: &[String], default_port: u16) -> Result<Vec<SocketAddr>> {
    let mut seeds = Vec::new();
    for member in members {
        if let Ok(addr) = member.parse::<SocketAddr>() {
            seeds.push(addr);
            continue;
        }
        let candidate = if member.contains(':') {
            member.clone()
        } else {
            format!("{member}:{default_port}")
        };
        let resolved = candidate
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve cluster member '{member}'"))?;
        seeds.extend(resolved);
    }
    Ok(seeds)
}

// An explicit advertise address wins, a concrete bind host speaks for
// itself, and a wildcard bind needs a routable source address towards the
// cluster. `None` means nothing reachable could be determined.
fn pick_advertise_addr(
    configured: Option<SocketAddr>,
    bind_addr: SocketAddr,
    seeds: &[SocketAddr],
) -> Option<SocketAddr> {
    configured
        .or_else(|| (!bind_addr.ip().is_unspecified()).then_some(bind_addr))
        .or_else(|| routable_host(seeds, bind_addr.port()))
        .filter(|addr| !addr.ip().is_unspecified())
}

// The kernel already knows which source address each seed would see from
// this host; connecting a throwaway UDP socket reveals it without sending
// a packet.
fn routable_host(seeds: &[SocketAddr], port: u16) -> Option<SocketAddr> {
    seeds.iter().find_map(|seed| {
        let wildcard: SocketAddr = if seed.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let probe = UdpSocket::bind(wildcard).ok()?;
        probe.connect(seed).ok()?;
        Some(SocketAddr::new(probe.local_addr().ok()?.ip(), port))
    })
}

// The host:port peers should use for one of our listeners: an explicit
// advertise address wins, a specified bind host is used as-is, and an
// unspecified bind host borrows the gossip advertise host.
fn advertised_addr(
    bind_addr: &str,
    advertise_addr: Option<&str>,
    gossip_advertise: SocketAddr,
    field: &str,
) -> Result<String> {
    if let Some(addr) = advertise_addr {
        return Ok(addr.to_string());
    }
    let bind: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid socket address for {field}: {bind_addr}"))?;
    if bind.ip().is_unspecified() {
        Ok(SocketAddr::new(gossip_advertise.ip(), bind.port()).to_string())
    } else {
        Ok(bind.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_entries_accept_explicit_and_default_ports() {
        let seeds =
            resolve_join_addrs(&["10.26.104.14:7001".to_string(), "10.26.104.75".to_string()], 7000)
                .expect("resolve");
        assert_eq!(
            seeds,
            vec![
                "10.26.104.14:7001".parse().unwrap(),
                "10.26.104.75:7000".parse().unwrap(),
            ],
        );
    }

    #[test]
    fn advertise_addr_prefers_explicit_configuration() {
        let gossip = "10.26.104.56:7000".parse().unwrap();
        let addr = advertised_addr("0.0.0.0:8000", Some("proxy.example.com:80"), gossip, "proxy")
            .expect("derive");
        assert_eq!(addr, "proxy.example.com:80");
    }

    #[test]
    fn unspecified_bind_hosts_borrow_the_gossip_host() {
        let gossip = "10.26.104.56:7000".parse().unwrap();
        let addr = advertised_addr("0.0.0.0:8000", None, gossip, "proxy").expect("derive");
        assert_eq!(addr, "10.26.104.56:8000");
    }

    #[test]
    fn specified_bind_hosts_are_advertised_directly() {
        let gossip = "10.26.104.56:7000".parse().unwrap();
        let addr = advertised_addr("10.26.104.57:8000", None, gossip, "proxy").expect("derive");
        assert_eq!(addr, "10.26.104.57:8000");
    }

    #[test]
    fn configured_advertise_addr_wins() {
        let configured = Some("10.26.104.99:7000".parse().unwrap());
        let bind = "0.0.0.0:7000".parse().unwrap();
        assert_eq!(
            pick_advertise_addr(configured, bind, &[]),
            Some("10.26.104.99:7000".parse().unwrap()),
        );
    }

    #[test]
    fn concrete_bind_hosts_advertise_themselves() {
        let bind: SocketAddr = "10.26.104.56:7000".parse().unwrap();
        assert_eq!(pick_advertise_addr(None, bind, &[]), Some(bind));
    }

    #[test]
    fn wildcard_bind_without_seeds_has_no_advertise_addr() {
        let bind = "0.0.0.0:7000".parse().unwrap();
        assert_eq!(pick_advertise_addr(None, bind, &[]), None);
    }

    #[test]
    fn wildcard_bind_borrows_the_route_towards_a_seed() {
        let bind = "0.0.0.0:7000".parse().unwrap();
        let seeds = vec!["127.0.0.1:9999".parse().unwrap()];
        assert_eq!(
            pick_advertise_addr(None, bind, &seeds),
            Some("127.0.0.1:7000".parse().unwrap()),
        );
    }
}
