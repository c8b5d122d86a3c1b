// src/state.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::store::{KvStore, StoreError};
use crate::types::{Address, Block, Transaction};

const ACCOUNT_PREFIX: &[u8] = b"acct:";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
}

impl Account {
    fn empty(address: Address) -> Self {
        Self { address, balance: 0, nonce: 0 }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state: nonce mismatch for {sender}: expected {expected}, got {got}")]
    NonceMismatch { sender: Address, expected: u64, got: u64 },
    #[error("state: insufficient funds for {sender}: balance {balance}, transfer {amount}")]
    InsufficientFunds { sender: Address, balance: u64, amount: u64 },
    #[error("state: account codec: {0}")]
    Decode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn account_key(addr: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(ACCOUNT_PREFIX.len() + 32);
    key.extend_from_slice(ACCOUNT_PREFIX);
    key.extend_from_slice(addr.as_bytes());
    key
}

/// Write-through account cache over a [`KvStore`]. The cache is the source
/// of truth during block execution; the store is touched only on the commit
/// path and by `seed_account`.
pub struct StateManager {
    store: Arc<dyn KvStore>,
    cache: Mutex<HashMap<Address, Account>>,
}

impl StateManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store, cache: Mutex::new(HashMap::new()) }
    }

    /// Returns a copy of the account, never a shared reference. Unknown
    /// addresses resolve to a zero-valued account.
    pub fn get_account(&self, addr: Address) -> Result<Account, StateError> {
        {
            let cache = self.cache.lock().expect("state cache poisoned");
            if let Some(acct) = cache.get(&addr) {
                return Ok(acct.clone());
            }
        }

        let acct = match self.store.get(&account_key(&addr)) {
            Ok(raw) => serde_json::from_slice::<Account>(&raw)
                .map_err(|e| StateError::Decode(format!("account {addr}: {e}")))?,
            Err(StoreError::NotFound) => Account::empty(addr),
            Err(e) => return Err(e.into()),
        };

        let mut cache = self.cache.lock().expect("state cache poisoned");
        let entry = cache.entry(addr).or_insert(acct);
        Ok(entry.clone())
    }

    /// Install an account with the given balance and nonce, bypassing the
    /// transfer rules. Used for genesis allocations.
    pub fn seed_account(&self, addr: Address, balance: u64, nonce: u64) -> Result<(), StateError> {
        let acct = Account { address: addr, balance, nonce };
        let payload = serde_json::to_vec(&acct)
            .map_err(|e| StateError::Decode(format!("account {addr}: {e}")))?;
        self.store.set(&account_key(&addr), &payload)?;
        let mut cache = self.cache.lock().expect("state cache poisoned");
        cache.insert(addr, acct);
        Ok(())
    }

    /// Apply a single transfer against the cache only.
    pub fn apply_transaction(&self, tx: &Transaction) -> Result<(), StateError> {
        let mut cache = self.cache.lock().expect("state cache poisoned");
        self.apply_tx_locked(&mut cache, tx)
    }

    /// Apply every transaction in block order, atomically. On any failure
    /// the cache is restored to its pre-call snapshot and nothing reaches
    /// the store; on success every cache entry is persisted.
    pub fn apply_block(&self, block: &Block) -> Result<(), StateError> {
        let mut cache = self.cache.lock().expect("state cache poisoned");
        let snapshot = cache.clone();

        for tx in &block.transactions {
            if let Err(e) = self.apply_tx_locked(&mut cache, tx) {
                debug!(height = block.header.height, tx = %tx.hash, "block application rolled back");
                *cache = snapshot;
                return Err(e);
            }
        }

        self.commit_locked(&cache)
    }

    fn apply_tx_locked(
        &self,
        cache: &mut HashMap<Address, Account>,
        tx: &Transaction,
    ) -> Result<(), StateError> {
        self.load_into_cache(cache, tx.from)?;
        self.load_into_cache(cache, tx.to)?;

        let sender = cache
            .entry(tx.from)
            .or_insert_with(|| Account::empty(tx.from));
        if sender.nonce != tx.nonce {
            return Err(StateError::NonceMismatch {
                sender: tx.from,
                expected: sender.nonce,
                got: tx.nonce,
            });
        }
        if sender.balance < tx.amount {
            return Err(StateError::InsufficientFunds {
                sender: tx.from,
                balance: sender.balance,
                amount: tx.amount,
            });
        }
        sender.balance -= tx.amount;
        sender.nonce += 1;

        let receiver = cache.entry(tx.to).or_insert_with(|| Account::empty(tx.to));
        receiver.balance += tx.amount;
        Ok(())
    }

    // Pull a stored account into the cache so snapshots and transfers see it.
    fn load_into_cache(
        &self,
        cache: &mut HashMap<Address, Account>,
        addr: Address,
    ) -> Result<(), StateError> {
        if cache.contains_key(&addr) {
            return Ok(());
        }
        match self.store.get(&account_key(&addr)) {
            Ok(raw) => {
                let acct = serde_json::from_slice::<Account>(&raw)
                    .map_err(|e| StateError::Decode(format!("account {addr}: {e}")))?;
                cache.insert(addr, acct);
                Ok(())
            }
            Err(StoreError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn commit_locked(&self, cache: &HashMap<Address, Account>) -> Result<(), StateError> {
        for (addr, acct) in cache {
            let payload = serde_json::to_vec(acct)
                .map_err(|e| StateError::Decode(format!("account {addr}: {e}")))?;
            self.store.set(&account_key(addr), &payload)?;
        }
        Ok(())
    }
}
