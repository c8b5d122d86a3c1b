// src/consensus/engine.rs

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::ChainManager;
use crate::mempool::Mempool;
use crate::state::StateManager;
use crate::types::{now_nanos, Address, Block, BlockHeader, Hash};

use super::{Broadcaster, Message, MessageKind, ValidatorSet};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub round_duration: Duration,
    pub max_txs_per_block: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { round_duration: Duration::from_secs(2), max_txs_per_block: 64 }
    }
}

// Per-height tally. Votes are counted as distinct voters per block hash so a
// repeated vote from the same validator cannot fake a quorum.
struct RoundState {
    height: u64,
    round: u64,
    votes: HashMap<Hash, HashSet<Address>>,
}

/// Leader-based round engine. A timer fires every `round_duration`; when
/// this node is the proposer for the current (height, round) it drains the
/// mempool into a candidate block, broadcasts the proposal and votes for it
/// itself. Commit happens once a strict majority of the validator set has
/// voted for one block hash.
pub struct ConsensusEngine {
    chain: Arc<ChainManager>,
    mempool: Arc<Mempool>,
    state: Arc<StateManager>,
    validators: Arc<dyn ValidatorSet>,
    broadcaster: Arc<dyn Broadcaster>,
    node_id: Address,
    cfg: EngineConfig,
    round: Mutex<RoundState>,
}

impl ConsensusEngine {
    pub fn new(
        chain: Arc<ChainManager>,
        mempool: Arc<Mempool>,
        state: Arc<StateManager>,
        validators: Arc<dyn ValidatorSet>,
        broadcaster: Arc<dyn Broadcaster>,
        node_id: Address,
        cfg: EngineConfig,
    ) -> Self {
        let (tip, _) = chain.tip();
        Self {
            chain,
            mempool,
            state,
            validators,
            broadcaster,
            node_id,
            cfg,
            round: Mutex::new(RoundState { height: tip + 1, round: 0, votes: HashMap::new() }),
        }
    }

    /// Tick until the shutdown signal flips. There is no round increment on
    /// a quiet tick: the next tick retries the same (height, round).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // first tick after one full round, not immediately
        let start = tokio::time::Instant::now() + self.cfg.round_duration;
        let mut ticker = tokio::time::interval_at(start, self.cfg.round_duration);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_round(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("consensus engine stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One proposer attempt at the current (height, round).
    pub fn run_round(&self) {
        let (height, round) = {
            let rs = self.round.lock().expect("consensus state poisoned");
            (rs.height, rs.round)
        };
        if self.validators.proposer(height, round) != self.node_id {
            return;
        }
        let (_, tip_hash) = self.chain.tip();
        self.propose_block(height, round, tip_hash);
    }

    fn propose_block(&self, height: u64, round: u64, previous_hash: Hash) {
        let transactions = self.mempool.pending(self.cfg.max_txs_per_block);
        let mut block = Block {
            header: BlockHeader {
                height,
                previous_hash,
                state_root: Hash::ZERO,
                tx_root: Hash::ZERO,
                proposer: self.node_id,
                timestamp_nanos: now_nanos(),
            },
            transactions,
        };
        block.header.tx_root = block.compute_tx_root();
        debug!(height, round, txs = block.transactions.len(), "proposing block");

        let proposal = Message {
            from: self.node_id,
            height,
            round,
            kind: MessageKind::Proposal,
            block: Some(block.clone()),
        };
        if let Err(e) = self.broadcaster.broadcast(&proposal) {
            warn!(height, round, error = %e, "proposal broadcast failed");
            return;
        }

        // our own vote goes through the same path as everyone else's
        self.handle_message(Message {
            from: self.node_id,
            height,
            round,
            kind: MessageKind::Vote,
            block: Some(block),
        });
    }

    /// Entry point for consensus messages, local and remote alike. All
    /// handling is serialized behind one mutex.
    pub fn handle_message(&self, msg: Message) {
        let mut rs = self.round.lock().expect("consensus state poisoned");

        let Some(block) = msg.block else { return };
        if msg.height != rs.height {
            debug!(got = msg.height, want = rs.height, "dropping message at wrong height");
            return;
        }

        match msg.kind {
            MessageKind::Proposal => {
                let expected = self.validators.proposer(msg.height, msg.round);
                if expected != msg.from {
                    debug!(from = %msg.from, expected = %expected, "dropping proposal from non-proposer");
                    return;
                }
                if let Err(reason) = self.validate_block(&block) {
                    debug!(height = msg.height, %reason, "rejecting proposal");
                    return;
                }
                let vote = Message {
                    from: self.node_id,
                    height: msg.height,
                    round: msg.round,
                    kind: MessageKind::Vote,
                    block: Some(block.clone()),
                };
                if let Err(e) = self.broadcaster.broadcast(&vote) {
                    warn!(height = msg.height, error = %e, "vote broadcast failed");
                }
                self.tally_vote_locked(&mut rs, self.node_id, &block);
            }
            MessageKind::Vote => {
                if !self.validators.contains(&msg.from) {
                    debug!(from = %msg.from, "dropping vote from non-validator");
                    return;
                }
                self.tally_vote_locked(&mut rs, msg.from, &block);
            }
        }
    }

    fn tally_vote_locked(&self, rs: &mut RoundState, voter: Address, block: &Block) {
        let hash = block.header.hash();
        let reached_quorum = {
            let voters = rs.votes.entry(hash).or_default();
            if !voters.insert(voter) {
                return; // repeat vote from this validator
            }
            voters.len() >= self.quorum_threshold()
        };
        if reached_quorum {
            self.commit_locked(rs, block);
        }
    }

    fn commit_locked(&self, rs: &mut RoundState, block: &Block) {
        if let Err(e) = self.state.apply_block(block) {
            error!(height = block.header.height, error = %e, "commit abandoned: state apply failed");
            return;
        }
        if let Err(e) = self.chain.add_block(block) {
            error!(height = block.header.height, error = %e, "commit abandoned: chain append failed");
            return;
        }
        for tx in &block.transactions {
            self.mempool.remove(&tx.compute_hash());
        }
        info!(height = block.header.height, txs = block.transactions.len(), "block committed");

        rs.height = block.header.height + 1;
        rs.round = 0;
        rs.votes.clear();
    }

    // Cheap pre-commit check; transaction-level validity is decided by
    // apply_block at commit time.
    fn validate_block(&self, block: &Block) -> Result<(), String> {
        let (tip, tip_hash) = self.chain.tip();
        if block.header.height != tip + 1 {
            return Err(format!("unexpected height: got {}, want {}", block.header.height, tip + 1));
        }
        if block.header.previous_hash != tip_hash {
            return Err("previous hash mismatch".to_string());
        }
        Ok(())
    }

    fn quorum_threshold(&self) -> usize {
        self.validators.size() / 2 + 1
    }

    pub fn current_height(&self) -> u64 {
        self.round.lock().expect("consensus state poisoned").height
    }
}
