//! # Tessera Contracts
//!
//! The ledger-facing half of the protocol: construction of the escrow
//! contract programs and parsing of their execution logs.
//!
//! Four transactions make up a transfer's on-chain life:
//!
//! 1. **Propose payment** — the buyer escrows the payment under the
//!    contract, binding the clear root, cipher root, amount, asset, and
//!    both deadlines. Input signatures pin the log layout, so no
//!    alternative contract body can be substituted.
//! 2. **Reveal key** — the seller validates the proposal, merges equal
//!    collateral, and calls the contract with the transfer key.
//! 3. **Claim payment** — after the refund deadline, the seller redeems
//!    payment plus collateral unconditionally.
//! 4. **Claim refund** — before the refund deadline, the buyer redeems
//!    both by proving a single bad chunk: two Merkle inclusion proofs and
//!    a cipher chunk whose decryption under the revealed key disagrees
//!    with the committed clear hash.
//!
//! Programs are ledger assembly source. Assembling, executing, and
//! validating them is the ledger toolchain's concern; this crate owns the
//! text, the log layout, and every derived identifier (seeds, anchors,
//! output ids) — each derivation in exactly one place.
//!
//! - **script** — The contract sources and their seeds.
//! - **anchor** — Merge/split/snapshot hash derivations.
//! - **program** — The four transaction builders and proposal validation.
//! - **log** — Positional log scanning and log prediction.
//! - **fraud** — The refund clause's check, reusable off-chain.

pub mod anchor;
pub mod fraud;
pub mod log;
pub mod program;
pub mod script;
