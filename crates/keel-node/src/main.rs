use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::sync::watch;

use keel_cluster::{ClusterMember, DistributedConfig, DistributedStore, StaticMembership};
use keel_consensus::{ConsensusConfig, KeelNode, RaftEngine};
use keel_server::{serve_client, serve_cluster, GrpcNetwork};
use keel_storage::{CacheConfig, FjallLogStorage, LocalStore, MemLogStorage, StateMachine};
use keel_types::NodeId;

#[derive(clap::Parser, Debug)]
#[command(name = "keel-node", about = "Keel replicated document store node")]
struct Cli {
    #[arg(long)]
    node_id: NodeId,
    #[arg(long, default_value = "0.0.0.0:17000")]
    client_addr: String,
    #[arg(long, default_value = "0.0.0.0:17001")]
    cluster_addr: String,
    /// Peer specs: "id=client_addr/cluster_addr", repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,
    /// Membership seed addresses, repeatable. Omit on the first node.
    #[arg(long = "seed")]
    seeds: Vec<String>,
    /// Initialize a brand-new cluster from this node and its peers.
    #[arg(long)]
    bootstrap: bool,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
    in_memory: bool,
    cache_capacity: usize,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    raft: ConsensusConfig,
    cluster: DistributedConfig,
    observability: ObservabilityConfig,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let mut figment =
        Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(config_path) = path {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    figment
        .merge(Env::prefixed("KEEL_").split("__"))
        .extract()
        .context("failed to load configuration")
}

fn init_tracing(config: &ObservabilityConfig) {
    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().with_env_filter(&config.log_level).init();
        }
        _ => {
            tracing_subscriber::fmt().pretty().with_env_filter(&config.log_level).init();
        }
    }
}

/// `"id=client_addr/cluster_addr"`
fn parse_peer(spec: &str) -> anyhow::Result<(NodeId, KeelNode)> {
    let (id, addrs) = spec
        .split_once('=')
        .with_context(|| format!("invalid peer spec '{spec}': missing '='"))?;
    let id: NodeId = id.trim().parse().with_context(|| format!("invalid peer id in '{spec}'"))?;
    let (client, cluster) =
        addrs.split_once('/').with_context(|| format!("invalid peer spec '{spec}': missing '/'"))?;
    if client.is_empty() || cluster.is_empty() {
        anyhow::bail!("invalid peer spec '{spec}': empty address");
    }
    Ok((id, KeelNode::new(client, cluster)))
}

fn shutdown_signal(mut rx: watch::Receiver<bool>) -> impl Future<Output = ()> + Send {
    async move {
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.observability);

    tracing::info!(
        node_id = cli.node_id,
        client_addr = %cli.client_addr,
        cluster_addr = %cli.cluster_addr,
        "node starting"
    );

    let client_addr: SocketAddr = cli
        .client_addr
        .parse()
        .with_context(|| format!("invalid client_addr: {}", cli.client_addr))?;
    let cluster_addr: SocketAddr = cli
        .cluster_addr
        .parse()
        .with_context(|| format!("invalid cluster_addr: {}", cli.cluster_addr))?;

    let local = KeelNode::new(cli.client_addr.clone(), cli.cluster_addr.clone());
    let mut members = BTreeMap::from([(cli.node_id, local.clone())]);
    for spec in &cli.peers {
        let (id, node) = parse_peer(spec)?;
        if id == cli.node_id {
            anyhow::bail!("peer '{spec}' reuses this node's id");
        }
        members.insert(id, node);
    }

    // Storage
    let cache = CacheConfig { capacity: config.storage.cache_capacity };
    let data_dir = cli.data_dir.clone().unwrap_or(config.storage.data_dir);
    let store = if config.storage.in_memory {
        LocalStore::in_memory(cache)
    } else {
        LocalStore::open(&data_dir.join("documents"), cache)
            .context("failed to open document store")?
    };
    let state_machine = Arc::new(StateMachine::new(store.clone()));

    // Consensus
    let network = GrpcNetwork::new();
    let engine = if config.storage.in_memory {
        let log = Arc::new(MemLogStorage::new());
        RaftEngine::start(cli.node_id, &config.raft, members.clone(), network, log, state_machine)
            .await?
    } else {
        let log = FjallLogStorage::open(&data_dir.join("raft")).context("failed to open raft log")?;
        let log = Arc::new(log);
        RaftEngine::start(cli.node_id, &config.raft, members.clone(), network, log, state_machine)
            .await?
    };
    let raft = engine.raft().clone();

    // Membership
    let to_member = |id: NodeId, node: &KeelNode| {
        ClusterMember::alive(id, node.address.clone(), node.raft_address.clone())
    };
    let peers: Vec<_> = members
        .iter()
        .filter(|(id, _)| **id != cli.node_id)
        .map(|(id, node)| to_member(*id, node))
        .collect();
    let membership = StaticMembership::new(to_member(cli.node_id, &local), peers);

    let cluster = DistributedConfig {
        bootstrap: cli.bootstrap || config.cluster.bootstrap,
        seeds: if cli.seeds.is_empty() { config.cluster.seeds.clone() } else { cli.seeds.clone() },
        apply_timeout_ms: config.raft.apply_timeout_ms,
        ..config.cluster
    };
    let db =
        Arc::new(DistributedStore::new(store, Arc::new(engine), Arc::new(membership), cluster));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        let _ = stop_tx.send(true);
    });

    let ready = {
        let db = Arc::clone(&db);
        async move { db.start().await.context("node failed to become ready") }
    };
    let served = tokio::try_join!(
        serve_client(client_addr, Arc::clone(&db), shutdown_signal(stop_rx.clone())),
        serve_cluster(cluster_addr, raft, Arc::clone(&db), shutdown_signal(stop_rx)),
        ready,
    );

    let stopped = db.shutdown().await.context("shutdown failed");
    served?;
    stopped
}
