// src/bin/node.rs

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use minichain::consensus::EngineConfig;
use minichain::crypto::SignatureValidator;
use minichain::mempool::TxValidator;
use minichain::node::{Node, NodeConfig};
use minichain::rpc::{self, AppState};
use minichain::types::Address;

#[derive(Parser)]
#[command(name = "minichain-node", about = "Minimal replicated ledger node")]
struct Cli {
    /// RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8000", env = "MINICHAIN_RPC_LISTEN")]
    rpc_listen: String,

    /// P2P listen address.
    #[arg(long, default_value = "127.0.0.1:9000", env = "MINICHAIN_P2P_LISTEN")]
    p2p_listen: String,

    /// Seed peer addresses (comma-separated host:port).
    #[arg(long, env = "MINICHAIN_P2P_SEEDS", value_delimiter = ',')]
    p2p_seeds: Vec<String>,

    /// Validator address (64 hex chars).
    #[arg(
        long,
        default_value = "0101010101010101010101010101010101010101010101010101010101010101",
        env = "MINICHAIN_NODE_ID"
    )]
    node_id: String,

    /// Genesis allocations as comma-separated addr:balance pairs (hex:amount).
    #[arg(long, env = "MINICHAIN_GENESIS", value_delimiter = ',')]
    genesis: Vec<String>,

    /// Consensus round duration in milliseconds.
    #[arg(long, default_value_t = 2000, env = "MINICHAIN_ROUND_MS")]
    round_ms: u64,

    /// Transactions pulled into each proposed block.
    #[arg(long, default_value_t = 64, env = "MINICHAIN_MAX_TXS_PER_BLOCK")]
    max_txs_per_block: usize,

    /// Mempool capacity.
    #[arg(long, default_value_t = 1024, env = "MINICHAIN_MEMPOOL_CAP")]
    mempool_cap: usize,

    /// Maximum peer connections (0 = unlimited).
    #[arg(long, default_value_t = 50, env = "MINICHAIN_MAX_PEERS")]
    max_peers: usize,

    /// Reject transactions without a valid ed25519 signature.
    #[arg(long, env = "MINICHAIN_REQUIRE_SIGNED_TXS")]
    require_signed_txs: bool,
}

fn parse_genesis(entries: &[String]) -> Result<Vec<(Address, u64)>> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((addr, balance)) = entry.split_once(':') else {
            bail!("invalid genesis entry {entry:?}, want addr:balance");
        };
        let addr: Address = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("genesis address {addr:?}: {e}"))?;
        let balance: u64 = balance
            .parse()
            .with_context(|| format!("genesis balance {balance:?}"))?;
        out.push((addr, balance));
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let node_id: Address = cli
        .node_id
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid node-id: {e}"))?;
    let genesis = parse_genesis(&cli.genesis)?;

    let cfg = NodeConfig {
        node_id,
        p2p_listen: cli.p2p_listen,
        seeds: cli.p2p_seeds.into_iter().filter(|s| !s.trim().is_empty()).collect(),
        max_peers: cli.max_peers,
        mempool_capacity: cli.mempool_cap,
        engine: EngineConfig {
            round_duration: Duration::from_millis(cli.round_ms),
            max_txs_per_block: cli.max_txs_per_block,
        },
        genesis,
    };

    let tx_validator: Option<Arc<dyn TxValidator>> = cli
        .require_signed_txs
        .then(|| Arc::new(SignatureValidator) as Arc<dyn TxValidator>);
    let node = Node::start(cfg, tx_validator).await?;

    // serve RPC until ctrl-c, then stop the engine and the mesh
    let app_state = AppState { node: Arc::clone(&node) };
    let rpc_listen = cli.rpc_listen.clone();
    let mut rpc_task = tokio::spawn(async move { rpc::serve(app_state, &rpc_listen).await });

    tokio::select! {
        // an rpc failure (e.g. the listener failing to bind) is fatal
        res = &mut rpc_task => {
            node.shutdown().await;
            return match res {
                Ok(outcome) => outcome.context("rpc server exited"),
                Err(e) => Err(e).context("rpc server panicked"),
            };
        }
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    rpc_task.abort();
    node.shutdown().await;
    Ok(())
}
