// src/types.rs

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::{header_bytes, tx_bytes};
use crate::crypto::{hash_bytes_sha256, tx_root};

/// 32-byte account identifier. Equality and hashing are byte-wise.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 32]);

/// 32-byte SHA-256 digest. Rendered as lowercase hex.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

fn parse_hex32(s: &str) -> Result<[u8; 32], String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

impl Address {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Hash {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &hex::encode(self.0)[..8])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &hex::encode(self.0)[..8])
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s).map(Address)
    }
}

impl FromStr for Hash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s).map(Hash)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A signed value transfer. The cached `hash` covers {from, to, amount,
/// nonce, timestamp_nanos} only; the signature never enters the pre-image.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub amount: u64,
    pub nonce: u64,
    pub timestamp_nanos: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default)]
    pub hash: Hash,
}

impl Transaction {
    pub fn new(from: Address, to: Address, amount: u64, nonce: u64, timestamp_nanos: u64) -> Self {
        let mut tx = Self {
            from,
            to,
            amount,
            nonce,
            timestamp_nanos,
            signature: None,
            hash: Hash::ZERO,
        };
        tx.hash = tx.compute_hash();
        tx
    }

    pub fn compute_hash(&self) -> Hash {
        hash_bytes_sha256(&tx_bytes(self))
    }
}

// Two transactions are the same transaction iff their canonical hashes match.
impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.compute_hash() == other.compute_hash()
    }
}

impl Eq for Transaction {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub previous_hash: Hash,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub proposer: Address,
    pub timestamp_nanos: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        hash_bytes_sha256(&header_bytes(self))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Digest of the concatenated transaction hashes, in list order.
    /// An empty block hashes the empty byte string.
    pub fn compute_tx_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.transactions.iter().map(|tx| tx.compute_hash()).collect();
        tx_root(&hashes)
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address([b; 32])
    }

    #[test]
    fn tx_hash_is_deterministic() {
        let a = Transaction::new(addr(1), addr(2), 10, 0, 42);
        let b = Transaction::new(addr(1), addr(2), 10, 0, 42);
        assert_eq!(a.compute_hash(), b.compute_hash());
        assert_eq!(a.compute_hash(), a.compute_hash());
    }

    #[test]
    fn tx_hash_ignores_signature_and_cached_hash() {
        let mut a = Transaction::new(addr(1), addr(2), 10, 0, 42);
        let b = a.clone();
        a.signature = Some(vec![9u8; 64]);
        a.hash = Hash([0xff; 32]);
        assert_eq!(a.compute_hash(), b.compute_hash());
        assert_eq!(a, b);
    }

    #[test]
    fn tx_hash_covers_every_canonical_field() {
        let base = Transaction::new(addr(1), addr(2), 10, 0, 42);
        let variants = [
            Transaction::new(addr(3), addr(2), 10, 0, 42),
            Transaction::new(addr(1), addr(3), 10, 0, 42),
            Transaction::new(addr(1), addr(2), 11, 0, 42),
            Transaction::new(addr(1), addr(2), 10, 1, 42),
            Transaction::new(addr(1), addr(2), 10, 0, 43),
        ];
        for v in &variants {
            assert_ne!(base.compute_hash(), v.compute_hash());
        }
    }

    #[test]
    fn empty_block_tx_root_is_empty_digest() {
        let block = Block {
            header: BlockHeader {
                height: 1,
                previous_hash: Hash::ZERO,
                state_root: Hash::ZERO,
                tx_root: Hash::ZERO,
                proposer: addr(1),
                timestamp_nanos: 0,
            },
            transactions: vec![],
        };
        assert_eq!(block.compute_tx_root(), hash_bytes_sha256(&[]));
    }

    #[test]
    fn address_hex_round_trip() {
        let a = addr(0xab);
        let s = a.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(s.parse::<Address>().unwrap(), a);
        assert_eq!(format!("0x{s}").parse::<Address>().unwrap(), a);
        assert!("zz".parse::<Address>().is_err());
        assert!("ab".parse::<Address>().is_err());
    }

    #[test]
    fn hash_serde_uses_hex_strings() {
        let h = Hash([7u8; 32]);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(32)));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }
}
