use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tether_cli::admin::{self, AdminState};
use tether_cli::cluster;
use tether_cli::config::ServerConfig;

#[derive(Parser)]
#[command(name = "tether", about = "Clustered reverse proxy", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a server node.
    ///
    /// The server routes requests from downstream clients to registered
    /// upstream listeners. Nodes may run as a cluster for fault tolerance
    /// and scalability; use '--join' with the addresses of existing members
    /// to join one.
    Server(ServerArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stable node identifier (auto-generated when omitted).
    #[arg(long)]
    node_id: Option<String>,

    /// Host/port to listen on for inter-node gossip traffic.
    #[arg(long)]
    gossip_bind_addr: Option<String>,

    /// Host/port to listen on for admin requests.
    #[arg(long)]
    admin_bind_addr: Option<String>,

    /// Addresses of existing cluster members to join. May be node addresses
    /// or a hostname resolving to them (e.g. a headless service); only a
    /// subset of the cluster is needed since members propagate membership.
    #[arg(long, value_delimiter = ',')]
    join: Vec<String>,

    /// Minimum log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl ServerArgs {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(addr) = self.gossip_bind_addr {
            config.cluster.bind_addr = addr;
        }
        if let Some(addr) = self.admin_bind_addr {
            config.admin.bind_addr = addr;
        }
        if !self.join.is_empty() {
            config.cluster.join = self.join;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let config = args.into_config()?;
            init_tracing(&config.log.level);
            run_server(config).await
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let admin_bind: SocketAddr = config
        .admin
        .bind_addr
        .parse()
        .with_context(|| format!("invalid admin.bind_addr: {}", config.admin.bind_addr))?;

    let cluster = cluster::bootstrap(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let admin_state = AdminState {
        netmap: Arc::clone(&cluster.netmap),
        engine: Arc::clone(&cluster.engine),
    };
    let mut admin_task = tokio::spawn(admin::serve(admin_bind, admin_state, shutdown_rx));

    tokio::select! {
        () = shutdown_signal() => info!("received shutdown signal"),
        result = &mut admin_task => {
            error!("admin server exited; shutting down");
            cluster.shutdown().await;
            return match result {
                Ok(Ok(())) => Err(anyhow!("admin server exited unexpectedly")),
                Ok(Err(err)) => Err(err),
                Err(err) => Err(err.into()),
            };
        }
    }

    cluster.shutdown().await;
    let _ = shutdown_tx.send(true);
    let _ = admin_task.await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for interrupt: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
