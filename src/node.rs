// src/node.rs

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chain::{ChainError, ChainManager};
use crate::consensus::{
    Broadcaster, ConsensusEngine, EngineConfig, Message, SingleValidator, ValidatorSet,
};
use crate::mempool::{Mempool, MempoolError, TxValidator};
use crate::p2p::{Envelope, MessageType, PeerTransport, TransportConfig};
use crate::state::{Account, StateError, StateManager};
use crate::store::{KvStore, MemoryKv};
use crate::types::{Address, Block, Hash, Transaction};

const DEFAULT_DEV_BALANCE: u64 = 1_000_000_000;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// This node's validator address.
    pub node_id: Address,
    pub p2p_listen: String,
    pub seeds: Vec<String>,
    pub max_peers: usize,
    pub mempool_capacity: usize,
    pub engine: EngineConfig,
    /// Genesis allocations. Empty means "seed the node's own address with a
    /// large dev balance".
    pub genesis: Vec<(Address, u64)>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: Address([1; 32]),
            p2p_listen: "127.0.0.1:0".to_string(),
            seeds: Vec::new(),
            max_peers: 50,
            mempool_capacity: 1024,
            engine: EngineConfig::default(),
            genesis: Vec::new(),
        }
    }
}

// The engine talks to the mesh through this narrow seam; the transport's
// consensus handler closes over the engine. Neither owns the other.
struct P2pBroadcaster {
    transport: Arc<PeerTransport>,
}

impl Broadcaster for P2pBroadcaster {
    fn broadcast(&self, msg: &Message) -> Result<()> {
        let payload = serde_json::to_vec(msg).context("encode consensus message")?;
        self.transport
            .broadcast(&Envelope::new(MessageType::Consensus, payload, None));
        Ok(())
    }
}

/// A fully wired node: store, state, chain, mempool, transport and engine.
/// External façades (HTTP, CLI) compose the boundary methods exposed here.
pub struct Node {
    node_id: Address,
    state: Arc<StateManager>,
    chain: Arc<ChainManager>,
    mempool: Arc<Mempool>,
    transport: Arc<PeerTransport>,
    shutdown: watch::Sender<bool>,
    engine_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Build every component, register the gossip handlers, start the
    /// transport and the consensus run loop.
    pub async fn start(
        cfg: NodeConfig,
        tx_validator: Option<Arc<dyn TxValidator>>,
    ) -> Result<Arc<Self>> {
        let state_store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let chain_store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

        let state = Arc::new(StateManager::new(state_store));
        let chain = Arc::new(ChainManager::new(chain_store).context("init chain manager")?);
        let mempool = Arc::new(Mempool::new(cfg.mempool_capacity, tx_validator));

        if cfg.genesis.is_empty() {
            state
                .seed_account(cfg.node_id, DEFAULT_DEV_BALANCE, 0)
                .context("seed dev balance")?;
        } else {
            for (addr, balance) in &cfg.genesis {
                state
                    .seed_account(*addr, *balance, 0)
                    .with_context(|| format!("seed genesis account {addr}"))?;
            }
        }

        let transport = PeerTransport::new(TransportConfig {
            listen_addr: cfg.p2p_listen.clone(),
            seeds: cfg.seeds.clone(),
            max_peers: cfg.max_peers,
            ..Default::default()
        });

        let validators: Arc<dyn ValidatorSet> = Arc::new(SingleValidator::new(cfg.node_id));
        let broadcaster = Arc::new(P2pBroadcaster { transport: transport.clone() });
        let engine = Arc::new(ConsensusEngine::new(
            chain.clone(),
            mempool.clone(),
            state.clone(),
            validators,
            broadcaster,
            cfg.node_id,
            cfg.engine.clone(),
        ));

        // transactions: admit locally, then forward to everyone but the origin
        {
            let pool = mempool.clone();
            let mesh = transport.clone();
            transport.register_handler(MessageType::Tx, move |peer, payload| {
                let tx: Transaction = match serde_json::from_slice(&payload) {
                    Ok(tx) => tx,
                    Err(e) => {
                        debug!(peer = %peer.id, error = %e, "invalid tx payload");
                        return;
                    }
                };
                if let Err(e) = pool.add(tx) {
                    debug!(peer = %peer.id, error = %e, "gossiped tx rejected");
                    return;
                }
                mesh.broadcast_except(&peer.id, &Envelope::new(MessageType::Tx, payload, None));
            });
        }

        // consensus messages go straight to the engine
        {
            let engine = engine.clone();
            transport.register_handler(MessageType::Consensus, move |peer, payload| {
                match serde_json::from_slice::<Message>(&payload) {
                    Ok(msg) => engine.handle_message(msg),
                    Err(e) => debug!(peer = %peer.id, error = %e, "invalid consensus payload"),
                }
            });
        }

        transport.start().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let engine_task = tokio::spawn(engine.clone().run(shutdown_rx));
        info!(node = %cfg.node_id, "node started");

        Ok(Arc::new(Self {
            node_id: cfg.node_id,
            state,
            chain,
            mempool,
            transport,
            shutdown,
            engine_task: Mutex::new(Some(engine_task)),
        }))
    }

    pub fn node_id(&self) -> Address {
        self.node_id
    }

    /// Stamp, admit and gossip a locally submitted transaction.
    pub fn submit_transaction(&self, mut tx: Transaction) -> Result<Hash, MempoolError> {
        tx.hash = tx.compute_hash();
        self.mempool.add(tx.clone())?;
        if let Ok(payload) = serde_json::to_vec(&tx) {
            self.transport
                .broadcast(&Envelope::new(MessageType::Tx, payload, None));
        }
        Ok(tx.hash)
    }

    pub fn get_account(&self, addr: Address) -> Result<Account, StateError> {
        self.state.get_account(addr)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Block, ChainError> {
        self.chain.get_block_by_height(height)
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, ChainError> {
        self.chain.get_block_by_hash(hash)
    }

    pub fn tip(&self) -> (u64, Hash) {
        self.chain.tip()
    }

    pub fn mempool_size(&self) -> usize {
        self.mempool.size()
    }

    pub fn peer_count(&self) -> usize {
        self.transport.peer_count()
    }

    /// The bound p2p address (resolves port 0 after start).
    pub fn p2p_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Signal the engine to stop and tear the mesh down.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.engine_task.lock().expect("engine task poisoned").take() {
            let _ = task.await;
        }
        self.transport.close();
        info!(node = %self.node_id, "node stopped");
    }
}
