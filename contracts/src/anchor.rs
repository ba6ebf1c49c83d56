//! # Anchor Derivation
//!
//! Every value on the ledger carries a 32-byte anchor identifying that
//! particular instance of it. Merging two values hashes their anchors
//! together; splitting derives one anchor per side. The escrow contract's
//! security leans on this: the buyer's input signatures pin the exact
//! change output id, which means simulating the merges and the split here
//! must reproduce the ledger's arithmetic bit for bit.
//!
//! This module is that one shared routine. The program builder, the
//! signature-program predicate, and the expected-log prediction all call
//! into it; nothing else is allowed to re-derive an anchor.

use sha2::{Digest, Sha256};

use tessera_protocol::types::{Hash32, LogValue};

/// The ledger's domain-separated hash: `SHA256(len(func) || func || data)`.
pub fn vm_hash(func: &str, data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([func.len() as u8]);
    hasher.update(func.as_bytes());
    hasher.update(data);
    hasher.finalize().into()
}

/// A contract's seed: the hash of its program source.
pub fn contract_seed(source: &str) -> Hash32 {
    vm_hash("ContractSeed", source.as_bytes())
}

/// Folds a sequence of input anchors the way the ledger merges values:
/// each further input's anchor is prepended to the running anchor and
/// hashed. `None` for an empty set — there is no such value.
pub fn merge_anchors(anchors: &[Hash32]) -> Option<Hash32> {
    let (first, rest) = anchors.split_first()?;
    let mut acc = *first;
    for anchor in rest {
        let mut input = [0u8; 64];
        input[..32].copy_from_slice(anchor);
        input[32..].copy_from_slice(&acc);
        acc = vm_hash("Merge", &input);
    }
    Some(acc)
}

/// Anchors of the two sides of a split: the kept value and the change.
pub fn split_anchors(merged: &Hash32) -> (Hash32, Hash32) {
    (vm_hash("Split1", merged), vm_hash("Split2", merged))
}

/// The anchor of a party's spendable value after merging its reserved
/// inputs and peeling off change: `(value_anchor, change_anchor)`.
///
/// With no change the merged anchor is used directly — no split happens.
pub fn value_and_change_anchors(
    input_anchors: &[Hash32],
    has_change: bool,
) -> Option<(Hash32, Option<Hash32>)> {
    let merged = merge_anchors(input_anchors)?;
    if has_change {
        let (value, change) = split_anchors(&merged);
        Some((value, Some(change)))
    } else {
        Some((merged, None))
    }
}

/// Anchor of the escrowed payment-plus-collateral value: the contract
/// merges the seller's collateral into the buyer's escrowed payment.
pub fn merged_escrow_anchor(collateral_anchor: &Hash32, anchor1: &Hash32) -> Hash32 {
    let mut input = [0u8; 64];
    input[..32].copy_from_slice(collateral_anchor);
    input[32..].copy_from_slice(anchor1);
    vm_hash("Merge", &input)
}

/// Output id of a contract snapshot: the hash of the contract tuple's
/// deterministic encoding.
pub fn snapshot_output_id(snapshot: &LogValue) -> Hash32 {
    vm_hash("SnapshotID", &snapshot.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(byte: u8) -> Hash32 {
        [byte; 32]
    }

    #[test]
    fn vm_hash_separates_functions() {
        assert_ne!(vm_hash("Merge", b"data"), vm_hash("Split1", b"data"));
    }

    #[test]
    fn vm_hash_length_prefix_prevents_sliding() {
        // ("ab", "c") and ("a", "bc") must not collide.
        assert_ne!(vm_hash("ab", b"c"), vm_hash("a", b"bc"));
    }

    #[test]
    fn merge_of_single_anchor_is_identity() {
        assert_eq!(merge_anchors(&[anchor(1)]), Some(anchor(1)));
    }

    #[test]
    fn merge_is_order_dependent() {
        let ab = merge_anchors(&[anchor(1), anchor(2)]).unwrap();
        let ba = merge_anchors(&[anchor(2), anchor(1)]).unwrap();
        assert_ne!(ab, ba);
    }

    #[test]
    fn merge_folds_left() {
        // merge([a, b, c]) must equal merge([merge([a, b]), c]) built by
        // hand, matching the ledger's pairwise merging of a spend sequence.
        let ab = merge_anchors(&[anchor(1), anchor(2)]).unwrap();
        let mut input = [0u8; 64];
        input[..32].copy_from_slice(&anchor(3));
        input[32..].copy_from_slice(&ab);
        let expected = vm_hash("Merge", &input);
        assert_eq!(merge_anchors(&[anchor(1), anchor(2), anchor(3)]), Some(expected));
    }

    #[test]
    fn empty_merge_is_none() {
        assert_eq!(merge_anchors(&[]), None);
    }

    #[test]
    fn split_sides_differ() {
        let (a, b) = split_anchors(&anchor(7));
        assert_ne!(a, b);
    }

    #[test]
    fn no_change_skips_the_split() {
        let anchors = [anchor(1), anchor(2)];
        let merged = merge_anchors(&anchors).unwrap();
        let (value, change) = value_and_change_anchors(&anchors, false).unwrap();
        assert_eq!(value, merged);
        assert!(change.is_none());

        let (value_split, change_split) = value_and_change_anchors(&anchors, true).unwrap();
        assert_ne!(value_split, merged);
        assert!(change_split.is_some());
    }

    #[test]
    fn snapshot_id_tracks_content() {
        let a = LogValue::Tuple(vec![LogValue::bytes("C"), LogValue::Int(1)]);
        let b = LogValue::Tuple(vec![LogValue::bytes("C"), LogValue::Int(2)]);
        assert_ne!(snapshot_output_id(&a), snapshot_output_id(&b));
    }
}
