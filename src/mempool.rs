// src/mempool.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::types::{Hash, Transaction};

/// Pluggable admission predicate, invoked on every new transaction. The
/// crate ships a signature-checking reference implementation in `crypto`.
pub trait TxValidator: Send + Sync {
    fn validate(&self, tx: &Transaction) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("mempool: transaction rejected: {0}")]
    ValidatorRejected(String),
}

// Ordering key: negated timestamp so that ascending BTreeMap iteration
// yields newest-first. The hash breaks timestamp ties deterministically.
fn priority_key(tx: &Transaction) -> (i128, Hash) {
    (-(tx.timestamp_nanos as i128), tx.hash)
}

struct Inner {
    txs: HashMap<Hash, Transaction>,
    order: BTreeMap<(i128, Hash), Hash>,
}

/// Priority-ordered, capacity-bounded, deduplicated transaction buffer.
/// Newer transactions outrank older ones; at capacity the oldest entry is
/// evicted silently.
pub struct Mempool {
    max_txs: usize,
    validator: Option<Arc<dyn TxValidator>>,
    inner: Mutex<Inner>,
}

impl Mempool {
    pub fn new(max_txs: usize, validator: Option<Arc<dyn TxValidator>>) -> Self {
        Self {
            max_txs,
            validator,
            inner: Mutex::new(Inner { txs: HashMap::new(), order: BTreeMap::new() }),
        }
    }

    /// Stamp the transaction hash and insert. Re-adding a known hash is a
    /// silent success; capacity overflow silently evicts the oldest entry.
    pub fn add(&self, mut tx: Transaction) -> Result<(), MempoolError> {
        tx.hash = tx.compute_hash();

        let mut inner = self.inner.lock().expect("mempool poisoned");
        if inner.txs.contains_key(&tx.hash) {
            return Ok(());
        }

        if let Some(validator) = &self.validator {
            validator
                .validate(&tx)
                .map_err(|e| MempoolError::ValidatorRejected(e.to_string()))?;
        }

        if self.max_txs > 0 && inner.txs.len() >= self.max_txs {
            let oldest = inner.order.iter().next_back().map(|(k, v)| (*k, *v));
            if let Some((key, victim)) = oldest {
                inner.order.remove(&key);
                inner.txs.remove(&victim);
                debug!(tx = %victim, "mempool full, evicted oldest");
            }
        }

        inner.order.insert(priority_key(&tx), tx.hash);
        inner.txs.insert(tx.hash, tx);
        Ok(())
    }

    /// Up to `limit` transactions in descending priority order, without
    /// removing them. Repeated calls see the same list until something else
    /// mutates the pool.
    pub fn pending(&self, limit: usize) -> Vec<Transaction> {
        if limit == 0 {
            return Vec::new();
        }
        let inner = self.inner.lock().expect("mempool poisoned");
        inner
            .order
            .values()
            .take(limit)
            .filter_map(|hash| inner.txs.get(hash).cloned())
            .collect()
    }

    /// Drop the transaction with this hash; no-op when absent. Called by
    /// consensus for every transaction of a committed block.
    pub fn remove(&self, hash: &Hash) {
        let mut inner = self.inner.lock().expect("mempool poisoned");
        if let Some(tx) = inner.txs.remove(hash) {
            inner.order.remove(&priority_key(&tx));
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("mempool poisoned").txs.len()
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("mempool poisoned");
        inner.txs.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use anyhow::bail;

    fn make_tx(ts: u64) -> Transaction {
        Transaction::new(Address([1; 32]), Address([2; 32]), 1, 0, ts)
    }

    #[test]
    fn pending_is_newest_first() {
        let pool = Mempool::new(10, None);
        let tx1 = make_tx(1);
        let tx2 = make_tx(2);
        pool.add(tx1.clone()).unwrap();
        pool.add(tx2.clone()).unwrap();

        let pending = pool.pending(2);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], tx2);
        assert_eq!(pending[1], tx1);
    }

    #[test]
    fn add_is_idempotent() {
        let pool = Mempool::new(10, None);
        let tx = make_tx(1);
        pool.add(tx.clone()).unwrap();
        pool.add(tx).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn capacity_evicts_the_oldest() {
        let pool = Mempool::new(2, None);
        let tx1 = make_tx(1);
        let tx2 = make_tx(2);
        let tx3 = make_tx(3);
        pool.add(tx1).unwrap();
        pool.add(tx2.clone()).unwrap();
        pool.add(tx3.clone()).unwrap();

        let pending = pool.pending(3);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], tx3);
        assert_eq!(pending[1], tx2);
    }

    #[test]
    fn pending_is_non_destructive() {
        let pool = Mempool::new(10, None);
        pool.add(make_tx(1)).unwrap();
        pool.add(make_tx(2)).unwrap();

        let first = pool.pending(2);
        let second = pool.pending(2);
        assert_eq!(first, second);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn remove_deletes_entry_and_tolerates_unknown_hashes() {
        let pool = Mempool::new(10, None);
        let tx = make_tx(1);
        let hash = tx.compute_hash();
        pool.add(tx).unwrap();

        pool.remove(&hash);
        assert_eq!(pool.size(), 0);
        pool.remove(&hash); // absent: no-op
    }

    #[test]
    fn flush_empties_the_pool() {
        let pool = Mempool::new(10, None);
        pool.add(make_tx(1)).unwrap();
        pool.add(make_tx(2)).unwrap();
        pool.flush();
        assert_eq!(pool.size(), 0);
        assert!(pool.pending(5).is_empty());
    }

    struct RejectEverything;

    impl TxValidator for RejectEverything {
        fn validate(&self, _tx: &Transaction) -> anyhow::Result<()> {
            bail!("not today")
        }
    }

    #[test]
    fn validator_rejection_surfaces_and_keeps_pool_empty() {
        let pool = Mempool::new(10, Some(Arc::new(RejectEverything)));
        let err = pool.add(make_tx(1)).unwrap_err();
        assert!(matches!(err, MempoolError::ValidatorRejected(_)));
        assert!(err.to_string().contains("not today"));
        assert_eq!(pool.size(), 0);
    }
}
