//! # Shared Protocol Types
//!
//! Plain data carried between the engine's components and across the wire:
//! 32-byte values (roots, anchors, keys, public keys, asset ids), the
//! structured form of a parsed ledger log, and the ledger log value model
//! itself.
//!
//! The log value model mirrors what the ledger's virtual machine records in
//! its persistent execution log: integers, byte strings, and tuples. The
//! contract crate builds and scans these; the observer matches transfers by
//! the anchors found in them.

use serde::{Deserialize, Serialize};

/// A 32-byte value: hash, Merkle root, anchor, symmetric key, Ed25519
/// public key, or asset id. The protocol deliberately uses one width for
/// all of them — every 32-byte slot in the contract is interchangeable at
/// the encoding level, and domain separation happens in the hash inputs.
pub type Hash32 = [u8; 32];

/// Renders a 32-byte value as lowercase hex for logs and file names.
pub fn hex32(h: &Hash32) -> String {
    hex::encode(h)
}

// ---------------------------------------------------------------------------
// Parsed Transfer
// ---------------------------------------------------------------------------

/// The structured form of a ledger log that contains a call into the escrow
/// contract.
///
/// The propose-phase fields are always present. The reveal-phase fields
/// appear only once the seller has merged collateral and revealed the key —
/// a partial (unsubmitted or unaccepted) transaction has `reveal: None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTransfer {
    /// Latest ledger time (ms) by which the seller must reveal the key.
    pub reveal_deadline_ms: u64,
    /// Later ledger time (ms) bounding the buyer's fraud-claim window.
    pub refund_deadline_ms: u64,
    /// Buyer's Ed25519 public key.
    pub buyer: Hash32,
    /// Merkle root over the ciphertext chunks.
    pub cipher_root: Hash32,
    /// Merkle root over the per-chunk plaintext hashes.
    pub clear_root: Hash32,
    /// The buyer's payment (the seller's collateral is equal and separate).
    pub amount: u64,
    /// Asset the payment is denominated in.
    pub asset_id: Hash32,
    /// Anchor of the buyer's escrowed value before collateral is merged.
    /// Uniquely identifies the transfer together with `clear_root`.
    pub anchor1: Hash32,
    /// Reveal-phase data, present once the seller has completed the
    /// transaction.
    pub reveal: Option<RevealData>,
}

/// Reveal-phase log contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealData {
    /// Anchor of the merged payment-plus-collateral value.
    pub anchor2: Hash32,
    /// The revealed transfer key.
    pub key: Hash32,
    /// Seller's Ed25519 public key.
    pub seller: Hash32,
    /// Output id of the escrow contract awaiting redemption.
    pub output_id: Hash32,
}

// ---------------------------------------------------------------------------
// Ledger Log Values
// ---------------------------------------------------------------------------

/// One value in the ledger's execution log.
///
/// Log entries are tuples; the first element is a one-byte marker string
/// (`"I"`, `"O"`, `"L"`, `"R"`, ...) and the second is the seed of the
/// contract that emitted the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogValue {
    Int(i64),
    Bytes(Vec<u8>),
    Tuple(Vec<LogValue>),
}

impl LogValue {
    /// Convenience constructor for a byte-string value.
    pub fn bytes(b: impl AsRef<[u8]>) -> Self {
        LogValue::Bytes(b.as_ref().to_vec())
    }

    /// The byte-string payload, if this value is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            LogValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The integer payload, if this value is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            LogValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The byte-string payload as a fixed 32-byte value, if it fits.
    pub fn as_hash32(&self) -> Option<Hash32> {
        self.as_bytes().and_then(|b| b.try_into().ok())
    }

    /// Deterministic byte encoding, used wherever a log value is hashed
    /// (snapshot ids, seeds). Tag byte, then little-endian payload:
    /// `0x00` + 8-byte int, `0x01` + LE32 length + bytes, `0x02` + LE32
    /// count + encoded elements.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            LogValue::Int(i) => {
                out.push(0x00);
                out.extend_from_slice(&i.to_le_bytes());
            }
            LogValue::Bytes(b) => {
                out.push(0x01);
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
            LogValue::Tuple(items) => {
                out.push(0x02);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_injective_across_variants() {
        // An int and its little-endian bytes must not encode identically.
        let as_int = LogValue::Int(7).encode();
        let as_bytes = LogValue::bytes(7i64.to_le_bytes()).encode();
        assert_ne!(as_int, as_bytes);
    }

    #[test]
    fn tuple_encoding_covers_nesting() {
        let flat = LogValue::Tuple(vec![LogValue::Int(1), LogValue::Int(2)]);
        let nested = LogValue::Tuple(vec![LogValue::Tuple(vec![
            LogValue::Int(1),
            LogValue::Int(2),
        ])]);
        assert_ne!(flat.encode(), nested.encode());
    }

    #[test]
    fn hash32_accessor_rejects_wrong_width() {
        assert!(LogValue::bytes([0u8; 31]).as_hash32().is_none());
        assert!(LogValue::bytes([0u8; 32]).as_hash32().is_some());
        assert!(LogValue::Int(5).as_hash32().is_none());
    }
}
