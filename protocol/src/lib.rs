// Copyright (c) 2026 Tessera Contributors. MIT License.
// See LICENSE for details.

//! # Tessera Protocol — Core Library
//!
//! Tessera is a fair-exchange content delivery protocol: a buyer wants a
//! file whose plaintext has a known Merkle root, a seller wants payment,
//! and neither trusts the other or a third party. A transaction-validating
//! ledger enforces atomicity. Exactly one of three things happens:
//!
//! 1. The buyer gets correct plaintext and the seller gets paid.
//! 2. The seller reveals a bad key, the buyer proves one bad chunk
//!    on-chain, and walks away with the payment *and* the seller's
//!    collateral.
//! 3. The buyer never challenges in time, and the seller reclaims both.
//!
//! This crate is the protocol engine. The contract programs that the
//! ledger executes live in the companion `tessera-contracts` crate; HTTP
//! and the CLI live in the node binary.
//!
//! ## Modules
//!
//! - **chunk** — Stream-cipher chunk codec and indexed clear hashes.
//! - **merkle** — Streaming interleaved Merkle trees and inclusion proofs.
//! - **transfer** — Buyer/seller streaming pipeline and decryption pass.
//! - **store** — Fixed-record chunk stores, the unit of persistence.
//! - **reserve** — Fund reservations, revocable exactly once.
//! - **observer** — Ledger polling, ledger time, callback dispatch.
//! - **session** — Per-party state machines and the error taxonomy.
//! - **config** — Protocol constants.
//! - **types** — Shared plain data: 32-byte values, parsed logs.
//!
//! ## Design stance
//!
//! Hashing is SHA-256 end to end — not because it is fashionable, but
//! because the ledger's refund verifier recomputes every hash this crate
//! produces, and one hash function shared by all parties is the whole
//! trick. State machines are explicit enums driven by events; the I/O
//! lives at the edges. If it touches money, it has tests.

pub mod chunk;
pub mod config;
pub mod merkle;
pub mod observer;
pub mod reserve;
pub mod session;
pub mod store;
pub mod transfer;
pub mod types;
