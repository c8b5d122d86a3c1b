// src/crypto.rs

use anyhow::{anyhow, bail, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::codec::tx_bytes;
use crate::mempool::TxValidator;
use crate::types::{Address, Hash, Transaction};

pub fn hash_bytes_sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Transaction root: digest of the concatenation of the transaction hashes
/// in list order. Zero transactions hash the empty byte string.
pub fn tx_root(leaves: &[Hash]) -> Hash {
    let mut hasher = Sha256::new();
    for leaf in leaves {
        hasher.update(leaf.as_bytes());
    }
    Hash(hasher.finalize().into())
}

/// An address is the SHA-256 of the account's ed25519 public key.
pub fn addr_from_pubkey(pubkey: &[u8; 32]) -> Address {
    Address(hash_bytes_sha256(pubkey).0)
}

/// Sign `tx` with `key`, stamping `signature = pubkey(32) || sig(64)`.
/// The caller is responsible for `tx.from` matching the key's address.
pub fn sign_transaction(key: &SigningKey, tx: &mut Transaction) {
    let sig = key.sign(&tx_bytes(tx));
    let mut blob = Vec::with_capacity(96);
    blob.extend_from_slice(key.verifying_key().as_bytes());
    blob.extend_from_slice(&sig.to_bytes());
    tx.signature = Some(blob);
}

/// Check the transaction's signature blob: the embedded public key must hash
/// to the sender address and the ed25519 signature must cover the canonical
/// transaction pre-image.
pub fn verify_transaction(tx: &Transaction) -> Result<()> {
    let blob = tx
        .signature
        .as_deref()
        .ok_or_else(|| anyhow!("missing signature"))?;
    if blob.len() != 96 {
        bail!("signature blob must be 96 bytes, got {}", blob.len());
    }
    let mut pk_bytes = [0u8; 32];
    pk_bytes.copy_from_slice(&blob[..32]);
    if addr_from_pubkey(&pk_bytes) != tx.from {
        bail!("public key does not match sender {}", tx.from);
    }
    let pk = VerifyingKey::from_bytes(&pk_bytes).map_err(|e| anyhow!("bad public key: {e}"))?;
    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(&blob[32..]);
    let sig = Signature::from_bytes(&sig_bytes);
    pk.verify(&tx_bytes(tx), &sig)
        .map_err(|e| anyhow!("signature verification failed: {e}"))
}

/// Reference implementation of the mempool's pluggable admission predicate.
pub struct SignatureValidator;

impl TxValidator for SignatureValidator {
    fn validate(&self, tx: &Transaction) -> Result<()> {
        verify_transaction(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_nanos;

    fn keyed_tx(key: &SigningKey, to: Address, amount: u64) -> Transaction {
        let from = addr_from_pubkey(key.verifying_key().as_bytes());
        let mut tx = Transaction::new(from, to, amount, 0, now_nanos());
        sign_transaction(key, &mut tx);
        tx
    }

    #[test]
    fn empty_tx_root_matches_empty_digest() {
        assert_eq!(tx_root(&[]), hash_bytes_sha256(&[]));
    }

    #[test]
    fn tx_root_depends_on_order() {
        let a = Hash([1; 32]);
        let b = Hash([2; 32]);
        assert_ne!(tx_root(&[a, b]), tx_root(&[b, a]));
    }

    #[test]
    fn signed_transaction_verifies() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let tx = keyed_tx(&key, Address([2; 32]), 10);
        verify_transaction(&tx).expect("valid signature");
    }

    #[test]
    fn tampered_transaction_fails_verification() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let mut tx = keyed_tx(&key, Address([2; 32]), 10);
        tx.amount = 11;
        assert!(verify_transaction(&tx).is_err());
    }

    #[test]
    fn wrong_sender_fails_verification() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let mut tx = keyed_tx(&key, Address([2; 32]), 10);
        tx.from = Address([9; 32]);
        // re-sign so the signature itself is valid for the new pre-image
        sign_transaction(&key, &mut tx);
        let err = verify_transaction(&tx).unwrap_err();
        assert!(err.to_string().contains("does not match sender"));
    }
}
