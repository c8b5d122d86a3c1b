// src/consensus/mod.rs

use serde::{Deserialize, Serialize};

use crate::types::{Address, Block};

pub mod engine;
pub use engine::{ConsensusEngine, EngineConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    Proposal = 0,
    Vote = 1,
}

impl From<MessageKind> for u8 {
    fn from(k: MessageKind) -> u8 {
        k as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MessageKind::Proposal),
            1 => Ok(MessageKind::Vote),
            other => Err(format!("unknown consensus message kind {other}")),
        }
    }
}

/// A consensus protocol message. Proposals and votes both carry the full
/// block; a message without one is dropped on arrival.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub from: Address,
    pub height: u64,
    pub round: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub block: Option<Block>,
}

/// Closed set of addresses eligible to propose and vote. The proposer for a
/// given (height, round) must be deterministic across nodes.
pub trait ValidatorSet: Send + Sync {
    fn proposer(&self, height: u64, round: u64) -> Address;
    fn size(&self) -> usize;
    fn contains(&self, addr: &Address) -> bool;
}

/// Reference set: one fixed validator that always proposes.
pub struct SingleValidator {
    id: Address,
}

impl SingleValidator {
    pub fn new(id: Address) -> Self {
        Self { id }
    }
}

impl ValidatorSet for SingleValidator {
    fn proposer(&self, _height: u64, _round: u64) -> Address {
        self.id
    }

    fn size(&self) -> usize {
        1
    }

    fn contains(&self, addr: &Address) -> bool {
        *addr == self.id
    }
}

/// Ships consensus messages to the peer mesh. Delivery is best-effort.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, msg: &Message) -> anyhow::Result<()>;
}
