use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use tether_core::gossip::GossipEngine;
use tether_core::netmap::{NetworkMap, Node};

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    /// Network map backing the cluster views.
    pub netmap: Arc<NetworkMap>,
    /// Gossip engine backing the membership stats.
    pub engine: Arc<GossipEngine>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct NodeView {
    id: String,
    status: String,
    proxy_addr: String,
    admin_addr: String,
    endpoints: BTreeMap<String, usize>,
    local: bool,
}

#[derive(Serialize)]
struct GossipStatsView {
    alive: usize,
    suspect: usize,
    dead: usize,
    left: usize,
    total: usize,
}

#[derive(Serialize)]
struct NetmapResponse {
    nodes: Vec<NodeView>,
    gossip: GossipStatsView,
}

/// Builds the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cluster/nodes", get(cluster_nodes))
        .route("/cluster/netmap", get(cluster_netmap))
        .with_state(state)
}

/// Serves the admin API until the shutdown signal fires.
pub async fn serve(
    bind_addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {bind_addr}"))?;
    info!(addr = %bind_addr, "admin server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("admin server failed")
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn cluster_nodes(State(state): State<AdminState>) -> Json<Vec<NodeView>> {
    let local_id = state.netmap.local_id();
    let mut nodes: Vec<NodeView> = state
        .netmap
        .nodes()
        .into_iter()
        .map(|node| render_node(node, &local_id))
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    Json(nodes)
}

async fn cluster_netmap(State(state): State<AdminState>) -> Json<NetmapResponse> {
    let local_id = state.netmap.local_id();
    let stats = state.engine.stats();
    let mut nodes: Vec<NodeView> = state
        .netmap
        .nodes()
        .into_iter()
        .map(|node| render_node(node, &local_id))
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    Json(NetmapResponse {
        nodes,
        gossip: GossipStatsView {
            alive: stats.alive,
            suspect: stats.suspect,
            dead: stats.dead,
            left: stats.left,
            total: stats.total(),
        },
    })
}

fn render_node(node: Node, local_id: &str) -> NodeView {
    NodeView {
        local: node.id == local_id,
        id: node.id,
        status: node.status.to_string(),
        proxy_addr: node.proxy_addr,
        admin_addr: node.admin_addr,
        endpoints: node.endpoints,
    }
}
