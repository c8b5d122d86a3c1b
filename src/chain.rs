// src/chain.rs

use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::info;

use crate::store::{KvStore, StoreError};
use crate::types::{Block, Hash};

const BLOCK_HEIGHT_PREFIX: &[u8] = b"blk:h:";
const BLOCK_HASH_PREFIX: &[u8] = b"blk:x:";
const CANONICAL_HEIGHT_KEY: &[u8] = b"chain:height";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain: unexpected block height: got {got}, want {want}")]
    UnexpectedHeight { got: u64, want: u64 },
    #[error("chain: previous hash mismatch at height {height}")]
    BadPrevHash { height: u64 },
    #[error("chain: block not found")]
    BlockNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn height_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_HEIGHT_PREFIX.len() + 8);
    key.extend_from_slice(BLOCK_HEIGHT_PREFIX);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn hash_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_HASH_PREFIX.len() + 32);
    key.extend_from_slice(BLOCK_HASH_PREFIX);
    key.extend_from_slice(hash.as_bytes());
    key
}

/// Linear block log over a [`KvStore`]. Blocks are indexed by height and by
/// header hash; the canonical height lives at a single well-known key so the
/// tip can be recovered on restart.
pub struct ChainManager {
    store: Arc<dyn KvStore>,
    tip: RwLock<(u64, Hash)>,
}

impl ChainManager {
    pub fn new(store: Arc<dyn KvStore>) -> Result<Self, ChainError> {
        let height = match store.get(CANONICAL_HEIGHT_KEY) {
            Ok(raw) => decode_height(&raw)?,
            Err(StoreError::NotFound) => 0,
            Err(e) => return Err(e.into()),
        };

        let mut tip_hash = Hash::ZERO;
        if height > 0 {
            let block = load_block(store.as_ref(), &height_key(height))?;
            tip_hash = block.header.hash();
        }

        Ok(Self { store, tip: RwLock::new((height, tip_hash)) })
    }

    /// Append the next block. The block must extend the current tip; a zero
    /// tx_root is computed and stamped before storage.
    pub fn add_block(&self, block: &Block) -> Result<(), ChainError> {
        let mut tip = self.tip.write().expect("chain tip poisoned");
        let (tip_height, tip_hash) = *tip;

        let want = tip_height + 1;
        if block.header.height != want {
            return Err(ChainError::UnexpectedHeight { got: block.header.height, want });
        }
        if want > 1 && block.header.previous_hash != tip_hash {
            return Err(ChainError::BadPrevHash { height: block.header.height });
        }

        let mut stored = block.clone();
        if stored.header.tx_root.is_zero() {
            stored.header.tx_root = stored.compute_tx_root();
        }
        let hash = stored.header.hash();

        let payload = encode_block(&stored)?;
        self.store.set(&height_key(stored.header.height), &payload)?;
        self.store.set(&hash_key(&hash), &payload)?;
        self.store
            .set(CANONICAL_HEIGHT_KEY, &stored.header.height.to_be_bytes())?;

        *tip = (stored.header.height, hash);
        info!(height = stored.header.height, hash = %hash, txs = stored.transactions.len(), "block appended");
        Ok(())
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Block, ChainError> {
        load_block(self.store.as_ref(), &height_key(height))
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, ChainError> {
        load_block(self.store.as_ref(), &hash_key(hash))
    }

    pub fn tip(&self) -> (u64, Hash) {
        *self.tip.read().expect("chain tip poisoned")
    }
}

fn load_block(store: &dyn KvStore, key: &[u8]) -> Result<Block, ChainError> {
    match store.get(key) {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Backend(format!("decode block: {e}")).into()),
        Err(StoreError::NotFound) => Err(ChainError::BlockNotFound),
        Err(e) => Err(e.into()),
    }
}

fn encode_block(block: &Block) -> Result<Vec<u8>, ChainError> {
    serde_json::to_vec(block).map_err(|e| StoreError::Backend(format!("encode block: {e}")).into())
}

fn decode_height(raw: &[u8]) -> Result<u64, ChainError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StoreError::Backend("canonical height is not 8 bytes".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use crate::types::{Address, BlockHeader, Transaction};

    fn block_at(height: u64, previous_hash: Hash) -> Block {
        Block {
            header: BlockHeader {
                height,
                previous_hash,
                state_root: Hash::ZERO,
                tx_root: Hash::ZERO,
                proposer: Address([1; 32]),
                timestamp_nanos: height,
            },
            transactions: vec![],
        }
    }

    #[test]
    fn add_block_advances_tip() {
        let chain = ChainManager::new(Arc::new(MemoryKv::new())).unwrap();
        assert_eq!(chain.tip(), (0, Hash::ZERO));

        let b1 = block_at(1, Hash::ZERO);
        chain.add_block(&b1).unwrap();

        let (height, hash) = chain.tip();
        assert_eq!(height, 1);
        assert_ne!(hash, Hash::ZERO);
    }

    #[test]
    fn rejects_wrong_height_on_fresh_chain() {
        let chain = ChainManager::new(Arc::new(MemoryKv::new())).unwrap();
        let err = chain.add_block(&block_at(2, Hash::ZERO)).unwrap_err();
        assert!(matches!(err, ChainError::UnexpectedHeight { got: 2, want: 1 }));
    }

    #[test]
    fn rejects_bad_previous_hash() {
        let chain = ChainManager::new(Arc::new(MemoryKv::new())).unwrap();
        chain.add_block(&block_at(1, Hash::ZERO)).unwrap();

        let err = chain.add_block(&block_at(2, Hash([9; 32]))).unwrap_err();
        assert!(matches!(err, ChainError::BadPrevHash { height: 2 }));
    }

    #[test]
    fn contiguous_blocks_link_by_header_hash() {
        let chain = ChainManager::new(Arc::new(MemoryKv::new())).unwrap();
        chain.add_block(&block_at(1, Hash::ZERO)).unwrap();
        let (_, tip_hash) = chain.tip();
        chain.add_block(&block_at(2, tip_hash)).unwrap();

        let b1 = chain.get_block_by_height(1).unwrap();
        let b2 = chain.get_block_by_height(2).unwrap();
        assert_eq!(b2.header.previous_hash, b1.header.hash());
    }

    #[test]
    fn zero_tx_root_is_stamped_before_storage() {
        let chain = ChainManager::new(Arc::new(MemoryKv::new())).unwrap();
        let mut b1 = block_at(1, Hash::ZERO);
        b1.transactions = vec![Transaction::new(Address([1; 32]), Address([2; 32]), 5, 0, 7)];
        chain.add_block(&b1).unwrap();

        let stored = chain.get_block_by_height(1).unwrap();
        assert_eq!(stored.header.tx_root, stored.compute_tx_root());
        assert!(!stored.header.tx_root.is_zero());
    }

    #[test]
    fn lookup_by_hash_and_missing_block() {
        let chain = ChainManager::new(Arc::new(MemoryKv::new())).unwrap();
        chain.add_block(&block_at(1, Hash::ZERO)).unwrap();

        let (_, tip_hash) = chain.tip();
        let by_hash = chain.get_block_by_hash(&tip_hash).unwrap();
        assert_eq!(by_hash.header.height, 1);

        assert!(matches!(chain.get_block_by_height(5), Err(ChainError::BlockNotFound)));
        assert!(matches!(
            chain.get_block_by_hash(&Hash([3; 32])),
            Err(ChainError::BlockNotFound)
        ));
    }

    #[test]
    fn reads_return_independent_clones() {
        let chain = ChainManager::new(Arc::new(MemoryKv::new())).unwrap();
        chain.add_block(&block_at(1, Hash::ZERO)).unwrap();

        let mut first = chain.get_block_by_height(1).unwrap();
        first.header.timestamp_nanos = 999;

        let second = chain.get_block_by_height(1).unwrap();
        assert_eq!(second.header.timestamp_nanos, 1);
    }

    #[test]
    fn tip_is_recovered_from_the_store() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let expected_tip = {
            let chain = ChainManager::new(store.clone()).unwrap();
            chain.add_block(&block_at(1, Hash::ZERO)).unwrap();
            let (_, tip_hash) = chain.tip();
            chain.add_block(&block_at(2, tip_hash)).unwrap();
            chain.tip()
        };

        let reopened = ChainManager::new(store).unwrap();
        assert_eq!(reopened.tip(), expected_tip);
    }
}
