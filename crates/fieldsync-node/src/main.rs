use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use fieldsync_agent::NodeAgent;
use fieldsync_coordinator::{Coordinator, RetryPolicy};
use fieldsync_net::{SystemClock, UdpTransport};
use fieldsync_storage::{FjallAuditLog, FjallConfigStorage, FjallStore};
use fieldsync_types::{ConfigKey, ConfigValue, NodeId, ValueKind};

#[derive(clap::Parser, Debug)]
#[command(name = "fieldsync-node", about = "Field node configuration sync")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `node.node_id`
    #[arg(long, global = true)]
    node_id: Option<NodeId>,
    /// Overrides `storage.data_dir`
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the node agent until interrupted.
    Agent,
    /// Push one patch to nodes and wait for every node to settle.
    Push {
        /// Target node id, repeatable; defaults to every configured peer
        #[arg(long = "target")]
        targets: Vec<NodeId>,
        /// Assignments in "key=value" form, e.g. heartbeatInterval=45000
        #[arg(required = true)]
        assignments: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    node_id: NodeId,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TransportConfig {
    listen_addr: String,
    /// Peer specs in "id=addr" form
    peers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RetryConfig {
    rtt_estimate_ms: u64,
    max_backoff_ms: u64,
    max_attempts: u32,
    jitter_ms: u64,
    settle_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    node: NodeSection,
    storage: StorageConfig,
    transport: TransportConfig,
    retry: RetryConfig,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("FIELDSYNC_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    if let Some(node_id) = cli.node_id {
        config.node.node_id = node_id;
    }
    if let Some(ref data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    match cli.command {
        Command::Agent => run_agent(&config).await,
        Command::Push { targets, assignments } => push(&config, targets, &assignments).await,
    }
}

async fn run_agent(config: &Config) -> anyhow::Result<()> {
    let node_id = config.node.node_id;
    let (store, transport) = open(config).await?;
    tracing::info!(node_id, data_dir = %config.storage.data_dir.display(), "agent starting");

    let agent = NodeAgent::boot(
        node_id,
        Arc::new(FjallConfigStorage(store.clone())),
        Arc::new(FjallAuditLog::open(store).context("failed to open audit log")?),
        Arc::new(SystemClock),
    )
    .await
    .context("failed to restore configuration")?;

    let mut handle = agent.handle();
    tokio::spawn(async move {
        while let Some(cfg) = handle.changed().await {
            tracing::info!(
                heartbeat_interval_ms = cfg.heartbeat_interval_ms(),
                coordinator_timeout_ms = cfg.coordinator_timeout_ms(),
                task_timeout_ms = cfg.task_timeout_ms(),
                max_retries = cfg.max_retries(),
                autonomous_mode = cfg.autonomous_mode(),
                task_execution = cfg.task_execution(),
                "live configuration changed"
            );
        }
    });

    tokio::select! {
        res = agent.run(transport) => res.context("agent stopped")?,
        _ = tokio::signal::ctrl_c() => tracing::info!(node_id, "interrupted; shutting down"),
    }
    Ok(())
}

async fn push(config: &Config, targets: Vec<NodeId>, assignments: &[String]) -> anyhow::Result<()> {
    let fields = assignments
        .iter()
        .map(|a| parse_assignment(a))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let targets = if targets.is_empty() {
        let mut all: Vec<NodeId> = parse_peers(&config.transport.peers)?.into_keys().collect();
        all.sort_unstable();
        all
    } else {
        targets
    };
    anyhow::ensure!(!targets.is_empty(), "no target nodes given and no peers configured");

    let (store, transport) = open(config).await?;
    let audit = FjallAuditLog::open(store).context("failed to open audit log")?;
    let next_patch_id = match audit.last_event().await.context("failed to read audit log")? {
        Some((_, event)) => event
            .patch_id
            .checked_add(1)
            .context("patch id space exhausted; reset the audit log")?,
        None => 1,
    };

    let retry = &config.retry;
    let policy = RetryPolicy::from_rtt(retry.rtt_estimate_ms, retry.max_backoff_ms, retry.max_attempts)
        .with_jitter(retry.jitter_ms);
    let mut coordinator = Coordinator::new(transport, Arc::new(audit), Arc::new(SystemClock), policy)
        .with_next_patch_id(next_patch_id);

    let mut patch = coordinator.new_patch();
    for (key, value) in fields {
        patch = patch.set(key.as_str(), value);
    }
    let report = coordinator.issue(patch, &targets).await.context("failed to issue patch")?;
    tracing::info!(patch_id = report.patch_id, targets = ?targets, "waiting for acknowledgments");

    let settled = coordinator
        .run_until_settled(Duration::from_secs(retry.settle_timeout_secs))
        .await
        .context("coordinator stopped")?;

    let outcomes = coordinator.outcomes();
    for (node_id, outcome) in &outcomes {
        println!("node {node_id}: {outcome}");
    }
    let missing = outcomes.values().filter(|o| !o.is_acked()).count();
    if !settled {
        tracing::warn!(patch_id = report.patch_id, "settle timeout reached");
    }
    anyhow::ensure!(
        missing == 0,
        "{missing} of {} nodes did not apply patch {}",
        outcomes.len(),
        report.patch_id
    );
    Ok(())
}

async fn open(config: &Config) -> anyhow::Result<(Arc<FjallStore>, Arc<UdpTransport>)> {
    tokio::fs::create_dir_all(&config.storage.data_dir).await.with_context(|| {
        format!("failed to create data_dir: {}", config.storage.data_dir.display())
    })?;
    let store = FjallStore::open(&config.storage.data_dir).context("failed to open store")?;

    let listen_addr: SocketAddr = config
        .transport
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr: {}", config.transport.listen_addr))?;
    let peers = parse_peers(&config.transport.peers)?;
    let transport = UdpTransport::bind(config.node.node_id, listen_addr, peers)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    Ok((store, Arc::new(transport)))
}

fn parse_peers(specs: &[String]) -> anyhow::Result<HashMap<NodeId, SocketAddr>> {
    specs
        .iter()
        .map(|spec| {
            let (id, addr) = spec
                .split_once('=')
                .with_context(|| format!("peer spec must be id=addr: {spec}"))?;
            let id: NodeId = id.trim().parse().with_context(|| format!("invalid peer id: {spec}"))?;
            let addr: SocketAddr =
                addr.trim().parse().with_context(|| format!("invalid peer addr: {spec}"))?;
            Ok((id, addr))
        })
        .collect()
}

/// Parse `key=value` using the key's schema type. Range checks are left to
/// the node so that out-of-range pushes surface as rejections.
fn parse_assignment(raw: &str) -> anyhow::Result<(ConfigKey, ConfigValue)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("assignment must be key=value: {raw}"))?;
    let key: ConfigKey = key.trim().parse()?;
    let value = value.trim();
    let parsed = match key.spec().kind {
        ValueKind::UInt => value.parse().map(ConfigValue::UInt).map_err(anyhow::Error::from),
        ValueKind::Int => value.parse().map(ConfigValue::Int).map_err(anyhow::Error::from),
        ValueKind::Bool => value.parse().map(ConfigValue::Bool).map_err(anyhow::Error::from),
    };
    let parsed = parsed.with_context(|| format!("{key} expects {}: {value}", key.spec().kind))?;
    Ok((key, parsed))
}
