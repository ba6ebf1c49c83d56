//! # Interleaved Merkle Engine
//!
//! Streaming binary Merkle trees over SHA-256, plus inclusion proofs for a
//! single indexed leaf.
//!
//! Leaf hashing and interior hashing use distinct prefix bytes (`0x00` and
//! `0x01`) so a leaf can never be confused with an interior node. Pairing
//! goes left to right; when a level holds an odd node it is promoted
//! unchanged to the next level, so the tree shape is a stable function of
//! the leaf count alone.
//!
//! The transfer protocol maintains two trees in lockstep — one over the
//! per-chunk clear hashes, one over the ciphertext chunks — through
//! [`InterleavedBuilder`]. Because both trees see the same leaf count in the
//! same order, a proof for leaf `i` in one tree has exactly the same shape
//! (sibling count and orientations) as the proof for leaf `i` in the other.
//! The refund verifier depends on that: it walks both proofs with one loop.
//!
//! Builders are streaming with an O(log n) frontier. Nothing here buffers
//! the leaf set; proof generation is a second pass over the chunk stores.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::chunk::put_uvarint;
use crate::types::Hash32;

/// Prefix byte for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;

/// Prefix byte for interior-node hashes.
const INTERIOR_PREFIX: u8 = 0x01;

/// Errors from tree construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    /// Leaves must arrive in strict index order.
    #[error("leaf index out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    /// Proof target beyond the number of leaves fed to the builder.
    #[error("proof target {target} not reached: tree has {leaves} leaves")]
    TargetOutOfRange { target: u64, leaves: u64 },
}

/// `SHA256(0x00 || data)`.
pub fn leaf_hash(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

/// `SHA256(0x01 || left || right)`.
pub fn interior_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([INTERIOR_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

// ---------------------------------------------------------------------------
// Proofs
// ---------------------------------------------------------------------------

/// One sibling on the path from a leaf to the root.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProofStep {
    /// The sibling subtree's hash.
    pub hash: Hash32,
    /// True when the sibling sits to the left of the running subtree.
    pub is_left: bool,
}

/// An inclusion proof: siblings ordered from the leaf upward, root-proximal
/// last. Rendering into ledger program input reverses the order, because
/// the on-chain verifier pops root-proximal first.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Proof {
    pub steps: Vec<ProofStep>,
}

impl Proof {
    /// Recomputes the root from `leaf_data` and checks it against `root`.
    pub fn verify(&self, leaf_data: &[u8], root: &Hash32) -> bool {
        let mut current = leaf_hash(leaf_data);
        for step in &self.steps {
            current = if step.is_left {
                interior_hash(&step.hash, &current)
            } else {
                interior_hash(&current, &step.hash)
            };
        }
        current == *root
    }

    /// Tree depth along this leaf's path.
    pub fn depth(&self) -> usize {
        self.steps.len()
    }
}

// ---------------------------------------------------------------------------
// Streaming Root Builder
// ---------------------------------------------------------------------------

/// Streaming root computation with an O(log n) frontier.
///
/// Slot `k` of the frontier, when occupied, holds the root of a complete
/// subtree of `2^k` leaves. Adding a leaf fills slot 0; a collision at any
/// slot combines the two subtrees and carries the result upward, exactly
/// like binary addition.
#[derive(Debug, Default, Clone)]
pub struct RootBuilder {
    frontier: Vec<Option<Hash32>>,
    leaves: u64,
}

impl RootBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves added so far.
    pub fn len(&self) -> u64 {
        self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.leaves == 0
    }

    /// Adds the next leaf (raw leaf data, hashed internally).
    pub fn add_leaf(&mut self, data: &[u8]) {
        self.add_leaf_hash(leaf_hash(data));
    }

    /// Adds the next leaf by its already-computed leaf hash.
    pub fn add_leaf_hash(&mut self, mut hash: Hash32) {
        self.leaves += 1;
        for slot in self.frontier.iter_mut() {
            match slot.take() {
                Some(left) => hash = interior_hash(&left, &hash),
                None => {
                    *slot = Some(hash);
                    return;
                }
            }
        }
        self.frontier.push(Some(hash));
    }

    /// Folds the frontier into the root. An odd subtree at a lower level is
    /// promoted unchanged until it meets the next occupied level, where it
    /// pairs as the right child.
    pub fn finish(self) -> Hash32 {
        let mut acc: Option<Hash32> = None;
        for slot in self.frontier.into_iter().flatten() {
            acc = Some(match acc {
                None => slot,
                Some(right) => interior_hash(&slot, &right),
            });
        }
        // The empty tree never occurs in a transfer (a file has at least
        // one chunk); degenerate value kept total for the builder API.
        acc.unwrap_or_else(|| leaf_hash(&[]))
    }
}

// ---------------------------------------------------------------------------
// Streaming Proof Builder
// ---------------------------------------------------------------------------

/// Streaming proof generation for a single target leaf.
///
/// Same frontier discipline as [`RootBuilder`], with each subtree tagged by
/// whether it contains the target. Every combine that touches the target's
/// subtree records the sibling; promotions record nothing, matching the
/// carry rule.
#[derive(Debug)]
pub struct ProofBuilder {
    target: u64,
    next: u64,
    frontier: Vec<Option<(Hash32, bool)>>,
    steps: Vec<ProofStep>,
}

impl ProofBuilder {
    pub fn new(target: u64) -> Self {
        Self {
            target,
            next: 0,
            frontier: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Adds the next leaf in index order.
    pub fn add_leaf(&mut self, data: &[u8]) {
        let contains = self.next == self.target;
        self.next += 1;
        let mut node = (leaf_hash(data), contains);
        for slot in self.frontier.iter_mut() {
            match slot.take() {
                Some(left) => {
                    node = Self::combine(&mut self.steps, left, node);
                }
                None => {
                    *slot = Some(node);
                    return;
                }
            }
        }
        self.frontier.push(Some(node));
    }

    fn combine(
        steps: &mut Vec<ProofStep>,
        left: (Hash32, bool),
        right: (Hash32, bool),
    ) -> (Hash32, bool) {
        if right.1 {
            steps.push(ProofStep {
                hash: left.0,
                is_left: true,
            });
        } else if left.1 {
            steps.push(ProofStep {
                hash: right.0,
                is_left: false,
            });
        }
        (interior_hash(&left.0, &right.0), left.1 || right.1)
    }

    /// Completes the pass and returns the proof together with the root it
    /// verifies against.
    pub fn finish(mut self) -> Result<(Proof, Hash32), MerkleError> {
        if self.target >= self.next {
            return Err(MerkleError::TargetOutOfRange {
                target: self.target,
                leaves: self.next,
            });
        }
        let mut acc: Option<(Hash32, bool)> = None;
        for slot in self.frontier.into_iter().flatten() {
            acc = Some(match acc {
                None => slot,
                Some(right) => Self::combine(&mut self.steps, slot, right),
            });
        }
        let (root, _) = acc.expect("target bound check guarantees at least one leaf");
        Ok((Proof { steps: self.steps }, root))
    }
}

// ---------------------------------------------------------------------------
// Interleaved Builder
// ---------------------------------------------------------------------------

/// Builds the clear-hash tree and the cipher-chunk tree in lockstep.
///
/// Each leaf is the chunk index as a uvarint followed by the payload: the
/// 32-byte clear hash in one tree, the ciphertext chunk in the other. The
/// index prefix domain-separates positions; the lockstep feed guarantees
/// identical topology.
#[derive(Debug, Default)]
pub struct InterleavedBuilder {
    clear: RootBuilder,
    cipher: RootBuilder,
    next: u64,
}

impl InterleavedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunk triples consumed.
    pub fn len(&self) -> u64 {
        self.next
    }

    pub fn is_empty(&self) -> bool {
        self.next == 0
    }

    /// Feeds the triple for chunk `index`. Indices must be consecutive from
    /// zero.
    pub fn add(
        &mut self,
        index: u64,
        clear_hash: &Hash32,
        cipher_chunk: &[u8],
    ) -> Result<(), MerkleError> {
        if index != self.next {
            return Err(MerkleError::OutOfOrder {
                expected: self.next,
                got: index,
            });
        }
        self.next += 1;
        self.clear.add_leaf(&indexed_leaf(index, clear_hash));
        self.cipher.add_leaf(&indexed_leaf(index, cipher_chunk));
        Ok(())
    }

    /// Returns `(clear_root, cipher_root)`.
    pub fn finish(self) -> (Hash32, Hash32) {
        (self.clear.finish(), self.cipher.finish())
    }
}

/// The leaf byte layout shared by both trees: `uvarint(index) || payload`.
pub fn indexed_leaf(index: u64, payload: &[u8]) -> Vec<u8> {
    let mut leaf = Vec::with_capacity(crate::config::MAX_UVARINT_LENGTH + payload.len());
    put_uvarint(&mut leaf, index);
    leaf.extend_from_slice(payload);
    leaf
}
