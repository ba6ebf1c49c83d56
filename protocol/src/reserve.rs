//! # Fund Reservations
//!
//! The funds source is an external collaborator: the engine asks it to hold
//! an ordered set of unspent outputs totalling at least the required amount,
//! then either consumes the hold in a finalized transaction or cancels it.
//! Nothing in between — a reservation is revocable exactly once.
//!
//! [`ReservationBook`] enforces the exactly-once rule across the process:
//! every reservation is tracked in a sled tree, each state change is a
//! single atomic compare-and-swap, and a second commit or a commit after a
//! cancel is an error rather than a silent no-op.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use parking_lot::Mutex;
use std::sync::Arc;

use crate::types::Hash32;

/// Errors from the reservation layer.
#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("unknown reservation {0}")]
    Unknown(String),

    #[error("reservation {0} already tracked")]
    AlreadyTracked(String),

    #[error("reservation {0} already committed")]
    AlreadyCommitted(String),

    #[error("reservation {0} already cancelled")]
    AlreadyCancelled(String),

    #[error("reservation store error: {0}")]
    Db(#[from] sled::Error),

    #[error("reservation record corrupt: {0}")]
    Codec(String),
}

// ---------------------------------------------------------------------------
// Reservation Interfaces
// ---------------------------------------------------------------------------

/// One unspent output held by a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub amount: u64,
    pub asset_id: Hash32,
    /// Anchor identifying this value instance on the ledger. Consumed by
    /// the contract builder's merge/split derivation.
    pub anchor: Hash32,
}

/// A hold on funds, alive until consumed by a finalized transaction or
/// cancelled.
pub trait Reservation: Send + std::fmt::Debug {
    /// The held outputs, in the order the spend program consumes them.
    fn utxos(&self) -> &[Utxo];

    /// Amount by which the held outputs exceed the requirement.
    fn change(&self) -> u64;

    /// Releases the hold, returning the outputs to the source.
    fn cancel(self: Box<Self>) -> Result<(), ReserveError>;
}

/// A source of reservations.
pub trait Reserver {
    fn reserve(
        &self,
        amount: u64,
        asset_id: &Hash32,
        expiry_ms: u64,
    ) -> Result<Box<dyn Reservation>, ReserveError>;
}

// ---------------------------------------------------------------------------
// In-Memory Reserver
// ---------------------------------------------------------------------------

/// A minimal in-memory funds source. Drives tests and local development;
/// a deployment points the engine at a real wallet instead.
#[derive(Debug, Clone, Default)]
pub struct MemoryReserver {
    pool: Arc<Mutex<Vec<Utxo>>>,
}

impl MemoryReserver {
    pub fn new(utxos: Vec<Utxo>) -> Self {
        Self {
            pool: Arc::new(Mutex::new(utxos)),
        }
    }

    /// Total funds currently available for `asset_id`.
    pub fn available(&self, asset_id: &Hash32) -> u64 {
        self.pool
            .lock()
            .iter()
            .filter(|u| u.asset_id == *asset_id)
            .map(|u| u.amount)
            .sum()
    }
}

impl Reserver for MemoryReserver {
    fn reserve(
        &self,
        amount: u64,
        asset_id: &Hash32,
        _expiry_ms: u64,
    ) -> Result<Box<dyn Reservation>, ReserveError> {
        let mut pool = self.pool.lock();
        let mut held = Vec::new();
        let mut total: u64 = 0;
        let mut i = 0;
        while i < pool.len() && total < amount {
            if pool[i].asset_id == *asset_id {
                let utxo = pool.remove(i);
                total += utxo.amount;
                held.push(utxo);
            } else {
                i += 1;
            }
        }
        if total < amount {
            // Put the partial hold back before failing.
            pool.extend(held);
            let available = pool
                .iter()
                .filter(|u| u.asset_id == *asset_id)
                .map(|u| u.amount)
                .sum();
            return Err(ReserveError::InsufficientFunds {
                required: amount,
                available,
            });
        }
        Ok(Box::new(MemoryReservation {
            pool: Arc::clone(&self.pool),
            utxos: held,
            change: total - amount,
        }))
    }
}

#[derive(Debug)]
struct MemoryReservation {
    pool: Arc<Mutex<Vec<Utxo>>>,
    utxos: Vec<Utxo>,
    change: u64,
}

impl Reservation for MemoryReservation {
    fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    fn change(&self) -> u64 {
        self.change
    }

    fn cancel(self: Box<Self>) -> Result<(), ReserveError> {
        self.pool.lock().extend(self.utxos);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reservation Book
// ---------------------------------------------------------------------------

/// Lifecycle of a tracked reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Held,
    Committed,
    Cancelled,
}

/// Sled-backed tracker enforcing commit-or-cancel-exactly-once.
#[derive(Debug, Clone)]
pub struct ReservationBook {
    tree: sled::Tree,
}

impl ReservationBook {
    pub fn open(db: &sled::Db) -> Result<Self, ReserveError> {
        Ok(Self {
            tree: db.open_tree("reservations")?,
        })
    }

    /// Starts tracking a new reservation in the `Held` state.
    pub fn hold(&self, id: &str) -> Result<(), ReserveError> {
        let encoded = encode_state(ReservationState::Held)?;
        match self
            .tree
            .compare_and_swap(id.as_bytes(), None::<&[u8]>, Some(encoded))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(ReserveError::AlreadyTracked(id.to_string())),
        }
    }

    /// Marks a held reservation as consumed by a finalized transaction.
    pub fn commit(&self, id: &str) -> Result<(), ReserveError> {
        self.transition(id, ReservationState::Committed)
    }

    /// Marks a held reservation as cancelled.
    pub fn cancel(&self, id: &str) -> Result<(), ReserveError> {
        self.transition(id, ReservationState::Cancelled)
    }

    pub fn state(&self, id: &str) -> Result<Option<ReservationState>, ReserveError> {
        self.tree
            .get(id.as_bytes())?
            .map(|raw| decode_state(&raw))
            .transpose()
    }

    fn transition(&self, id: &str, target: ReservationState) -> Result<(), ReserveError> {
        loop {
            let current = self.tree.get(id.as_bytes())?;
            let state = match &current {
                Some(raw) => decode_state(raw)?,
                None => return Err(ReserveError::Unknown(id.to_string())),
            };
            match state {
                ReservationState::Held => {}
                ReservationState::Committed => {
                    return Err(ReserveError::AlreadyCommitted(id.to_string()))
                }
                ReservationState::Cancelled => {
                    return Err(ReserveError::AlreadyCancelled(id.to_string()))
                }
            }
            let next = encode_state(target)?;
            // Atomic per update; a losing race re-reads and re-checks.
            match self
                .tree
                .compare_and_swap(id.as_bytes(), current.as_deref(), Some(next))?
            {
                Ok(()) => {
                    self.tree.flush()?;
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
    }
}

fn encode_state(state: ReservationState) -> Result<Vec<u8>, ReserveError> {
    bincode::serialize(&state).map_err(|e| ReserveError::Codec(e.to_string()))
}

fn decode_state(raw: &[u8]) -> Result<ReservationState, ReserveError> {
    bincode::deserialize(raw).map_err(|e| ReserveError::Codec(e.to_string()))
}

/// Test and devnet helper: a pool of equal-value outputs with distinct
/// anchors derived from a label.
pub fn seeded_pool(label: &str, asset_id: &Hash32, amounts: &[u64]) -> Vec<Utxo> {
    use sha2::{Digest, Sha256};
    amounts
        .iter()
        .enumerate()
        .map(|(i, &amount)| {
            let mut hasher = Sha256::new();
            hasher.update(label.as_bytes());
            hasher.update((i as u64).to_le_bytes());
            Utxo {
                amount,
                asset_id: *asset_id,
                anchor: hasher.finalize().into(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hex32;

    fn asset() -> Hash32 {
        [0xaa; 32]
    }

    #[test]
    fn reserve_collects_outputs_in_order_with_change() {
        let reserver = MemoryReserver::new(seeded_pool("t", &asset(), &[60, 50, 27]));
        let reservation = reserver.reserve(100, &asset(), 0).unwrap();
        assert_eq!(reservation.utxos().len(), 2);
        assert_eq!(reservation.change(), 10);
        assert_eq!(reserver.available(&asset()), 27);
    }

    #[test]
    fn exact_amount_has_zero_change() {
        let reserver = MemoryReserver::new(seeded_pool("t", &asset(), &[100]));
        let reservation = reserver.reserve(100, &asset(), 0).unwrap();
        assert_eq!(reservation.change(), 0);
    }

    #[test]
    fn cancel_returns_outputs_to_pool() {
        let reserver = MemoryReserver::new(seeded_pool("t", &asset(), &[60, 50]));
        let reservation = reserver.reserve(100, &asset(), 0).unwrap();
        assert_eq!(reserver.available(&asset()), 0);
        reservation.cancel().unwrap();
        assert_eq!(reserver.available(&asset()), 110);
    }

    #[test]
    fn insufficient_funds_leaves_pool_intact() {
        let reserver = MemoryReserver::new(seeded_pool("t", &asset(), &[60, 50]));
        let err = reserver.reserve(200, &asset(), 0).unwrap_err();
        assert!(matches!(
            err,
            ReserveError::InsufficientFunds {
                required: 200,
                available: 110
            }
        ));
        assert_eq!(reserver.available(&asset()), 110);
    }

    #[test]
    fn other_assets_are_not_touched() {
        let mut pool = seeded_pool("a", &asset(), &[100]);
        pool.extend(seeded_pool("b", &[0xbb; 32], &[500]));
        let reserver = MemoryReserver::new(pool);
        let reservation = reserver.reserve(100, &asset(), 0).unwrap();
        assert_eq!(reservation.utxos().len(), 1);
        assert_eq!(reserver.available(&[0xbb; 32]), 500);
    }

    #[test]
    fn book_commit_is_exactly_once() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let book = ReservationBook::open(&db).unwrap();

        book.hold("r1").unwrap();
        assert_eq!(book.state("r1").unwrap(), Some(ReservationState::Held));

        book.commit("r1").unwrap();
        assert_eq!(book.state("r1").unwrap(), Some(ReservationState::Committed));

        assert!(matches!(
            book.commit("r1"),
            Err(ReserveError::AlreadyCommitted(_))
        ));
        assert!(matches!(
            book.cancel("r1"),
            Err(ReserveError::AlreadyCommitted(_))
        ));
    }

    #[test]
    fn book_cancel_is_exactly_once() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let book = ReservationBook::open(&db).unwrap();

        book.hold("r2").unwrap();
        book.cancel("r2").unwrap();
        assert!(matches!(
            book.cancel("r2"),
            Err(ReserveError::AlreadyCancelled(_))
        ));
        assert!(matches!(
            book.commit("r2"),
            Err(ReserveError::AlreadyCancelled(_))
        ));
    }

    #[test]
    fn book_rejects_duplicate_hold_and_unknown_ids() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let book = ReservationBook::open(&db).unwrap();

        book.hold("r3").unwrap();
        assert!(matches!(
            book.hold("r3"),
            Err(ReserveError::AlreadyTracked(_))
        ));
        assert!(matches!(
            book.commit("missing"),
            Err(ReserveError::Unknown(_))
        ));
    }

    #[test]
    fn seeded_pool_anchors_are_distinct() {
        let pool = seeded_pool("label", &asset(), &[1, 1, 1]);
        assert_ne!(pool[0].anchor, pool[1].anchor);
        assert_ne!(pool[1].anchor, pool[2].anchor);
        assert_eq!(hex32(&pool[0].anchor).len(), 64);
    }
}
