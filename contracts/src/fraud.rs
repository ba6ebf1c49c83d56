//! # Fraud-Proof Verification
//!
//! The check the ledger's refund clause performs, written down once and
//! reused off-chain: the buyer's driver runs it before submitting a
//! claim-refund transaction (a claim that would fail on-chain is not worth
//! the fee), and the test suite holds the refund-exclusivity law against
//! it.
//!
//! A refund claim is valid iff, at one index, the chunk the seller
//! committed in the cipher tree decrypts under the revealed key to
//! something *other* than the committed clear hash — with both membership
//! proofs binding the chunk and the hash to the same position under the
//! signed roots.

use tessera_protocol::chunk::{clear_hash, decrypt_chunk};
use tessera_protocol::merkle::{indexed_leaf, Proof};
use tessera_protocol::types::Hash32;

/// Verifies a refund claim exactly as the on-chain clause does.
///
/// Checks, in order:
/// 1. the cipher proof binds `cipher_chunk` at `index` under `cipher_root`;
/// 2. the clear proof binds `committed_clear_hash` at `index` under
///    `clear_root`;
/// 3. decrypting the chunk under `(key, index)` and re-hashing yields
///    something different from the committed clear hash.
///
/// All three must hold: without (1) and (2) the buyer could fabricate a
/// mismatch from data the seller never signed; without (3) there is no
/// fraud to prove.
#[allow(clippy::too_many_arguments)]
pub fn verify_refund_claim(
    key: &Hash32,
    index: u64,
    cipher_chunk: &[u8],
    committed_clear_hash: &Hash32,
    cipher_proof: &Proof,
    clear_proof: &Proof,
    cipher_root: &Hash32,
    clear_root: &Hash32,
) -> bool {
    if !cipher_proof.verify(&indexed_leaf(index, cipher_chunk), cipher_root) {
        return false;
    }
    if !clear_proof.verify(&indexed_leaf(index, committed_clear_hash), clear_root) {
        return false;
    }
    let plaintext = decrypt_chunk(key, index, cipher_chunk);
    clear_hash(index, &plaintext) != *committed_clear_hash
}
