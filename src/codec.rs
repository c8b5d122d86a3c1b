// src/codec.rs

use crate::types::{BlockHeader, Transaction};

pub const CODEC_VERSION: u8 = 1;
pub const DOM_TX: &[u8] = b"TX";
pub const DOM_HDR: &[u8] = b"HDR";

// --- helpers: write primitives deterministically ---

// append a u64 to a Vec<u8> in little-endian.
fn put_u64(dst: &mut Vec<u8>, x: u64) {
    dst.extend_from_slice(&x.to_le_bytes());
}

fn put_hash32(dst: &mut Vec<u8>, bytes: &[u8; 32]) {
    dst.extend_from_slice(bytes);
}

// --- public encoders used for hashing ---

/// Canonical transaction pre-image: {from, to, amount, nonce,
/// timestamp_nanos}. The signature and the cached hash stay out so that
/// signing (or re-stamping) never perturbs the digest.
pub fn tx_bytes(tx: &Transaction) -> Vec<u8> {
    let mut v = vec![CODEC_VERSION];
    v.extend_from_slice(DOM_TX);
    put_hash32(&mut v, tx.from.as_bytes());
    put_hash32(&mut v, tx.to.as_bytes());
    put_u64(&mut v, tx.amount);
    put_u64(&mut v, tx.nonce);
    put_u64(&mut v, tx.timestamp_nanos);
    v
}

/// Canonical header pre-image. Covers every header field, state_root
/// included even while proposers leave it zeroed.
pub fn header_bytes(h: &BlockHeader) -> Vec<u8> {
    let mut v = vec![CODEC_VERSION];
    v.extend_from_slice(DOM_HDR);
    put_u64(&mut v, h.height);
    put_hash32(&mut v, h.previous_hash.as_bytes());
    put_hash32(&mut v, h.state_root.as_bytes());
    put_hash32(&mut v, h.tx_root.as_bytes());
    put_hash32(&mut v, h.proposer.as_bytes());
    put_u64(&mut v, h.timestamp_nanos);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, Hash};

    #[test]
    fn tx_preimage_layout_is_stable() {
        let tx = Transaction::new(Address([1; 32]), Address([2; 32]), 3, 4, 5);
        let bytes = tx_bytes(&tx);
        assert_eq!(bytes[0], CODEC_VERSION);
        assert_eq!(&bytes[1..3], DOM_TX);
        assert_eq!(&bytes[3..35], &[1u8; 32]);
        assert_eq!(&bytes[35..67], &[2u8; 32]);
        assert_eq!(&bytes[67..75], &3u64.to_le_bytes());
        assert_eq!(&bytes[75..83], &4u64.to_le_bytes());
        assert_eq!(&bytes[83..91], &5u64.to_le_bytes());
        assert_eq!(bytes.len(), 91);
    }

    #[test]
    fn header_preimage_changes_with_any_field() {
        let base = BlockHeader {
            height: 1,
            previous_hash: Hash::ZERO,
            state_root: Hash::ZERO,
            tx_root: Hash::ZERO,
            proposer: Address([1; 32]),
            timestamp_nanos: 9,
        };
        let mut other = base.clone();
        other.state_root = Hash([1; 32]);
        assert_ne!(header_bytes(&base), header_bytes(&other));

        let mut other = base.clone();
        other.timestamp_nanos = 10;
        assert_ne!(header_bytes(&base), header_bytes(&other));
    }
}
