use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use scoot_cluster::Membership;
use scoot_consensus::{recovery, Acceptor, Proposer};
use scoot_server::{serve_api, serve_cluster, ApiState};
use scoot_state::{ReplicatedLog, ScooterStateMachine};

#[derive(clap::Parser, Debug)]
#[command(name = "scoot-node", about = "Replicated scooter KV node")]
struct Cli {
    #[arg(long)]
    node_id: i64,
    /// Peer-facing listener (Paxos + recovery gRPC)
    #[arg(long, default_value = "0.0.0.0:26000")]
    cluster_addr: String,
    /// SPA-facing HTTP listener
    #[arg(long, default_value = "0.0.0.0:8080")]
    api_addr: String,
    /// Peer cluster addresses, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[arg(long, env = "ETCD_SERVER", default_value = "localhost:2379")]
    etcd_endpoint: String,
    /// Address peers should dial to reach this replica; defaults to
    /// cluster_addr
    #[arg(long)]
    advertise_addr: Option<String>,
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Debug, Deserialize)]
struct PaxosConfig {
    rpc_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RecoveryConfig {
    rpc_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct MembershipConfig {
    dial_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    paxos: PaxosConfig,
    recovery: RecoveryConfig,
    membership: MembershipConfig,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment =
        Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("SCOOT_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(config.observability.log_level.as_str())
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(config.observability.log_level.as_str())
                .init();
        }
    }

    tracing::info!(
        node_id = cli.node_id,
        cluster_addr = %cli.cluster_addr,
        api_addr = %cli.api_addr,
        peers = ?cli.peers,
        "replica starting"
    );

    let cluster_addr: SocketAddr = cli
        .cluster_addr
        .parse()
        .with_context(|| format!("invalid cluster_addr: {}", cli.cluster_addr))?;
    let api_addr: SocketAddr = cli
        .api_addr
        .parse()
        .with_context(|| format!("invalid api_addr: {}", cli.api_addr))?;

    let machine = Arc::new(ScooterStateMachine::new());
    let log = Arc::new(ReplicatedLog::new());
    let acceptor = Arc::new(Acceptor::new(machine.clone(), log.clone()));
    let proposer = Arc::new(Proposer::with_timeout(
        cli.node_id,
        cli.peers.clone(),
        acceptor.clone(),
        Duration::from_millis(config.paxos.rpc_timeout_ms),
    ));

    // The replica is useless without the coordination service; bail out
    // rather than run unannounced.
    let advertise_addr = cli
        .advertise_addr
        .clone()
        .unwrap_or_else(|| cli.cluster_addr.clone());
    let mut membership = Membership::connect(
        cli.node_id,
        advertise_addr,
        vec![cli.etcd_endpoint.clone()],
        Duration::from_secs(config.membership.dial_timeout_secs),
    )
    .await
    .context("coordination service unreachable")?;
    membership.on_leader_change(|leader_id| {
        tracing::info!(leader_id, "cluster leader changed");
    });
    membership.start().await.context("failed to register membership")?;

    let membership = Arc::new(membership);
    {
        let membership = membership.clone();
        tokio::spawn(async move {
            if let Err(err) = membership.watch().await {
                tracing::warn!(error = %err, "membership watch ended");
            }
        });
    }

    let api_state = Arc::new(ApiState {
        machine: machine.clone(),
        log: log.clone(),
        proposer,
    });
    let recovery_timeout = Duration::from_millis(config.recovery.rpc_timeout_ms);

    tokio::try_join!(
        serve_cluster(cluster_addr, acceptor, machine.clone(), log.clone()),
        async {
            recovery::recover(&cli.peers, &machine, &log, recovery_timeout).await;
            serve_api(api_addr, api_state).await
        },
    )?;

    Ok(())
}
