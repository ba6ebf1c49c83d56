//! # Contract Program Builders
//!
//! Constructs the four transaction programs of a transfer's life: the
//! buyer's propose-payment, the seller's reveal-key completion, and the two
//! redemption transactions (claim-payment and claim-refund). Programs are
//! ledger assembly source; assembling and executing them is the ledger
//! toolchain's business, not ours.
//!
//! The propose program's security pattern deserves a note. Each consumed
//! input carries a deferred signature program that runs *after* the escrow
//! contract has populated the transaction log, and verifies that the log
//! holds exactly the deadlines, roots, amount, and asset the buyer signed
//! off on — plus, when change exists, the deterministically derived change
//! output id. A counterparty who substitutes any alternative contract body
//! invalidates every input signature at once.

use std::fmt::Write as _;

use thiserror::Error;

use tessera_protocol::chunk::uvarint;
use tessera_protocol::merkle::Proof;
use tessera_protocol::reserve::Reservation;
use tessera_protocol::types::{hex32, Hash32, LogValue, ParsedTransfer};

use crate::anchor::{merged_escrow_anchor, snapshot_output_id, value_and_change_anchors};
use crate::log::{escrow_log_position, ChangeRecord};
use crate::script::{
    ESCROW_SEED, ESCROW_SOURCE, PAY_TO_PUBKEY_SEED, PAY_TO_PUBKEY_SOURCE, REDEMPTION_SOURCE,
};

/// Errors from program construction and proposal validation.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("reservation holds no outputs")]
    EmptyReservation,

    #[error("signing failed: {0}")]
    Sign(String),

    #[error("cannot parse payment proposal")]
    UnparsedProposal,

    /// The proposal's committed parameters differ from what this party
    /// agreed to. Fatal for the transfer.
    #[error("proposal mismatch: {field} is {got}, want {want}")]
    ParamMismatch {
        field: &'static str,
        got: String,
        want: String,
    },
}

/// Produces a signature over a message, typically Ed25519 under the
/// party's key. Implemented for closures.
pub trait Signer {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ProgramError>;
}

impl<F> Signer for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, ProgramError>,
{
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ProgramError> {
        self(message)
    }
}

// ---------------------------------------------------------------------------
// Propose Payment
// ---------------------------------------------------------------------------

/// Terms of a proposed transfer, fixed before any program is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposeParams {
    pub buyer: Hash32,
    pub amount: u64,
    pub asset_id: Hash32,
    pub clear_root: Hash32,
    pub cipher_root: Hash32,
    pub reveal_deadline_ms: u64,
    pub refund_deadline_ms: u64,
}

/// A built propose-payment program, with the derived identifiers the
/// driver needs without re-executing it.
#[derive(Debug, Clone)]
pub struct Proposal {
    /// Ledger assembly source of the partial transaction.
    pub source: String,
    /// Anchor of the escrowed payment; identifies this transfer on the
    /// ledger together with the clear root.
    pub anchor1: Hash32,
    /// The change run this program produces, if any.
    pub change: Option<ChangeRecord>,
    /// Input anchors in spend order, for log prediction.
    pub input_anchors: Vec<Hash32>,
}

/// Builds the partial transaction in which the buyer escrows payment under
/// the contract, parameterized by `params`, consuming the reservation's
/// outputs and signing each with `signer`.
pub fn propose_payment(
    params: &ProposeParams,
    reservation: &dyn Reservation,
    signer: &dyn Signer,
) -> Result<Proposal, ProgramError> {
    let utxos = reservation.utxos();
    if utxos.is_empty() {
        return Err(ProgramError::EmptyReservation);
    }
    let change = reservation.change();
    let input_anchors: Vec<Hash32> = utxos.iter().map(|u| u.anchor).collect();
    let (anchor1, change_anchor) = value_and_change_anchors(&input_anchors, change > 0)
        .ok_or(ProgramError::EmptyReservation)?;

    // Where the escrow contract's log entries start, given what the spends
    // and the change emit before it.
    let escrow_pos = escrow_log_position(utxos.len(), change > 0);

    let change_record = change_anchor.map(|anchor| {
        let snapshot = pay_snapshot(&params.buyer, change, &params.asset_id, &anchor);
        (change, anchor, snapshot_output_id(&snapshot))
    });

    // The deferred predicate every input signs: inspect the log after the
    // contract has run and hold it to the signed terms.
    let mut sigprog = String::from("[\n");
    if let Some((_, _, output_id)) = &change_record {
        let _ = writeln!(sigprog, "{} peeklog untuple", escrow_pos - 1);
        sigprog.push_str("3 eq verify\n");
        let _ = writeln!(sigprog, "x'{}' eq verify", hex32(output_id));
        sigprog.push_str("drop\n'O' eq verify\n");
    }
    let _ = writeln!(sigprog, "{escrow_pos} peeklog untuple");
    sigprog.push_str("4 eq verify\n3 roll 'R' eq verify\n");
    let _ = writeln!(sigprog, "2 roll x'{}' eq verify", hex32(&ESCROW_SEED));
    let _ = writeln!(sigprog, "{} eq verify", params.reveal_deadline_ms);
    sigprog.push_str("0 eq verify\n");

    let checks: [(usize, String); 6] = [
        (1, params.refund_deadline_ms.to_string()),
        (2, format!("x'{}'", hex32(&params.buyer))),
        (3, format!("x'{}'", hex32(&params.cipher_root))),
        (4, format!("x'{}'", hex32(&params.clear_root))),
        (5, params.amount.to_string()),
        (6, format!("x'{}'", hex32(&params.asset_id))),
    ];
    for (offset, literal) in checks {
        let _ = writeln!(sigprog, "{} peeklog untuple drop", escrow_pos + offset);
        let _ = writeln!(sigprog, "{literal} eq verify");
        sigprog.push_str("drop drop\n");
    }
    sigprog.push_str("] yield\n");

    // Spend each reserved output, merging the values as we go. Every
    // signature covers the predicate plus the input's own anchor, so no
    // signature transplants between inputs.
    let mut source = String::new();
    for (i, utxo) in utxos.iter().enumerate() {
        let mut message = Vec::with_capacity(sigprog.len() + 32);
        message.extend_from_slice(sigprog.as_bytes());
        message.extend_from_slice(&utxo.anchor);
        let signature = signer.sign(&message)?;

        source.push_str("'' put\n");
        let _ = writeln!(
            source,
            "{} input call",
            pay_snapshot_literal(&params.buyer, utxo.amount, &params.asset_id, &utxo.anchor)
        );
        source.push_str("get\n"); // deferred sigcheck to the contract stack
        let _ = writeln!(source, "x'{}' put", hex::encode(&signature));
        let _ = writeln!(source, "x'{}' put", hex::encode(sigprog.as_bytes()));
        source.push_str("call\n");
        source.push_str("get get 1 roll put\n"); // keep the value, re-defer the predicate
        if i > 0 {
            source.push_str("merge\n");
        }
    }

    if let Some((amount, _, _)) = &change_record {
        let _ = writeln!(source, "{amount} split");
        source.push_str("'' put\n'' put\nput\n");
        let _ = writeln!(source, "{{x'{}'}} put", hex32(&params.buyer));
        source.push_str("1 put\n");
        let _ = writeln!(
            source,
            "x'{}' contract call",
            hex::encode(PAY_TO_PUBKEY_SOURCE.as_bytes())
        );
    }

    // Instantiate the escrow contract and hand it the payment plus the
    // commitments, outermost argument first.
    let _ = writeln!(
        source,
        "x'{}' contract",
        hex::encode(ESCROW_SOURCE.as_bytes())
    );
    source.push_str("1 roll\nput\n");
    let _ = writeln!(source, "x'{}' put", hex32(&params.clear_root));
    let _ = writeln!(source, "x'{}' put", hex32(&params.cipher_root));
    let _ = writeln!(source, "x'{}' put", hex32(&params.buyer));
    let _ = writeln!(source, "{} put", params.refund_deadline_ms);
    let _ = writeln!(source, "{} put", params.reveal_deadline_ms);
    source.push_str("call\nget\n");

    // Now that the contract has populated the log, run the deferred
    // predicates.
    for _ in 0..utxos.len() {
        source.push_str("get call\n");
    }

    Ok(Proposal {
        source,
        anchor1,
        change: change_record,
        input_anchors,
    })
}

// ---------------------------------------------------------------------------
// Reveal Key
// ---------------------------------------------------------------------------

/// The terms a seller expects a proposal to commit to. Compared field by
/// field against the parsed proposal before any collateral is signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedTerms {
    pub amount: u64,
    pub asset_id: Hash32,
    pub clear_root: Hash32,
    pub cipher_root: Hash32,
    pub reveal_deadline_ms: u64,
    pub refund_deadline_ms: u64,
}

/// A completed reveal-key transaction with its derived identifiers.
#[derive(Debug, Clone)]
pub struct RevealTx {
    /// Full transaction source: the buyer's proposal with the seller's
    /// completion appended.
    pub source: String,
    /// Anchor of the merged payment-plus-collateral value.
    pub anchor2: Hash32,
    /// Output id of the escrow contract awaiting redemption.
    pub output_id: Hash32,
}

/// Completes a payment proposal: validates the parsed commitments against
/// `want`, merges seller collateral, and calls the contract with the
/// seller identity and the transfer key.
#[allow(clippy::too_many_arguments)]
pub fn reveal_key(
    proposal_source: &str,
    parsed: &ParsedTransfer,
    want: &ExpectedTerms,
    seller: &Hash32,
    key: &Hash32,
    reservation: &dyn Reservation,
    signer: &dyn Signer,
) -> Result<RevealTx, ProgramError> {
    validate_proposal(parsed, want)?;

    let utxos = reservation.utxos();
    if utxos.is_empty() {
        return Err(ProgramError::EmptyReservation);
    }
    let change = reservation.change();
    let collateral_anchors: Vec<Hash32> = utxos.iter().map(|u| u.anchor).collect();
    let (collateral_anchor, change_anchor) =
        value_and_change_anchors(&collateral_anchors, change > 0)
            .ok_or(ProgramError::EmptyReservation)?;
    let anchor2 = merged_escrow_anchor(&collateral_anchor, &parsed.anchor1);

    let mut completion = String::new();
    for (i, utxo) in utxos.iter().enumerate() {
        completion.push_str("'' put\n");
        let _ = writeln!(
            completion,
            "{} input call",
            pay_snapshot_literal(seller, utxo.amount, &parsed.asset_id, &utxo.anchor)
        );
        completion.push_str("get get 1 roll put\n");
        if i > 0 {
            completion.push_str("merge\n");
        }
    }
    if let Some(anchor) = &change_anchor {
        let _ = writeln!(completion, "{change} split");
        completion.push_str("'' put\n'' put\nput\n");
        let _ = writeln!(completion, "{{x'{}'}} put", hex32(seller));
        completion.push_str("1 put\n");
        let _ = writeln!(
            completion,
            "x'{}' contract call",
            hex::encode(PAY_TO_PUBKEY_SOURCE.as_bytes())
        );
        // The change side of the split carries this derived anchor.
        tracing::debug!(change_anchor = %hex32(anchor), "seller change output");
    }

    // Peel the exact collateral off the merged value, hand the contract
    // the seller identity and the key, and finalize.
    let _ = writeln!(completion, "{} split", want.amount);
    let _ = writeln!(completion, "x'{}' put", hex32(seller));
    let _ = writeln!(completion, "x'{}' put", hex32(key));
    completion.push_str("put\nswap\ncall\nfinalize\n");

    let mut source = String::with_capacity(proposal_source.len() + completion.len());
    source.push_str(proposal_source);
    source.push_str(&completion);

    // Seller inputs sign the finished transaction id; the deferred checks
    // run once the id is fixed.
    let txid = crate::anchor::vm_hash("TxID", source.as_bytes());
    let sigprog = format!("x'{}' txid eq verify\n", hex32(&txid));
    for utxo in utxos.iter().rev() {
        let mut message = Vec::with_capacity(sigprog.len() + 32);
        message.extend_from_slice(sigprog.as_bytes());
        message.extend_from_slice(&utxo.anchor);
        let signature = signer.sign(&message)?;
        let _ = writeln!(
            source,
            "get x'{}' put x'{}' put call",
            hex::encode(&signature),
            hex::encode(sigprog.as_bytes())
        );
    }

    let redeem = Redeem {
        refund_deadline_ms: parsed.refund_deadline_ms,
        buyer: parsed.buyer,
        seller: *seller,
        amount: 2 * parsed.amount,
        asset_id: parsed.asset_id,
        anchor2,
        cipher_root: parsed.cipher_root,
        clear_root: parsed.clear_root,
        key: *key,
    };

    Ok(RevealTx {
        source,
        anchor2,
        output_id: escrow_output_id(&redeem),
    })
}

fn validate_proposal(parsed: &ParsedTransfer, want: &ExpectedTerms) -> Result<(), ProgramError> {
    fn mismatch(field: &'static str, got: String, want: String) -> ProgramError {
        ProgramError::ParamMismatch { field, got, want }
    }
    if parsed.reveal_deadline_ms != want.reveal_deadline_ms {
        return Err(mismatch(
            "reveal deadline",
            parsed.reveal_deadline_ms.to_string(),
            want.reveal_deadline_ms.to_string(),
        ));
    }
    if parsed.refund_deadline_ms != want.refund_deadline_ms {
        return Err(mismatch(
            "refund deadline",
            parsed.refund_deadline_ms.to_string(),
            want.refund_deadline_ms.to_string(),
        ));
    }
    if parsed.cipher_root != want.cipher_root {
        return Err(mismatch(
            "cipher root",
            hex32(&parsed.cipher_root),
            hex32(&want.cipher_root),
        ));
    }
    if parsed.clear_root != want.clear_root {
        return Err(mismatch(
            "clear root",
            hex32(&parsed.clear_root),
            hex32(&want.clear_root),
        ));
    }
    if parsed.amount != want.amount {
        return Err(mismatch(
            "amount",
            parsed.amount.to_string(),
            want.amount.to_string(),
        ));
    }
    if parsed.asset_id != want.asset_id {
        return Err(mismatch(
            "asset id",
            hex32(&parsed.asset_id),
            hex32(&want.asset_id),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Redemption
// ---------------------------------------------------------------------------

/// Everything needed to rehydrate the escrow output, whether the seller is
/// claiming payment or the buyer a refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redeem {
    pub refund_deadline_ms: u64,
    pub buyer: Hash32,
    pub seller: Hash32,
    /// Payment plus collateral — twice the buyer's payment.
    pub amount: u64,
    pub asset_id: Hash32,
    /// Anchor of the value tuple holding payment plus collateral.
    pub anchor2: Hash32,
    pub cipher_root: Hash32,
    pub clear_root: Hash32,
    pub key: Hash32,
}

impl Redeem {
    /// Builds redemption data from a fully parsed (revealed) transfer.
    pub fn from_parsed(parsed: &ParsedTransfer) -> Option<Self> {
        let reveal = parsed.reveal.as_ref()?;
        Some(Self {
            refund_deadline_ms: parsed.refund_deadline_ms,
            buyer: parsed.buyer,
            seller: reveal.seller,
            amount: 2 * parsed.amount,
            asset_id: parsed.asset_id,
            anchor2: reveal.anchor2,
            cipher_root: parsed.cipher_root,
            clear_root: parsed.clear_root,
            key: reveal.key,
        })
    }
}

/// The escrow output's snapshot tuple, shared by the output-id derivation
/// and the rehydrating `input` literal. Field order is consensus.
fn escrow_snapshot(r: &Redeem) -> LogValue {
    LogValue::Tuple(vec![
        LogValue::bytes("C"),
        LogValue::bytes(*ESCROW_SEED),
        LogValue::bytes(REDEMPTION_SOURCE.as_bytes()),
        LogValue::Tuple(vec![
            LogValue::bytes("Z"),
            LogValue::Int(r.refund_deadline_ms as i64),
        ]),
        LogValue::Tuple(vec![LogValue::bytes("S"), LogValue::bytes(r.buyer)]),
        LogValue::Tuple(vec![
            LogValue::bytes("V"),
            LogValue::Int(r.amount as i64),
            LogValue::bytes(r.asset_id),
            LogValue::bytes(r.anchor2),
        ]),
        LogValue::Tuple(vec![LogValue::bytes("S"), LogValue::bytes(r.cipher_root)]),
        LogValue::Tuple(vec![LogValue::bytes("S"), LogValue::bytes(r.clear_root)]),
        LogValue::Tuple(vec![LogValue::bytes("S"), LogValue::bytes(r.key)]),
        LogValue::Tuple(vec![LogValue::bytes("S"), LogValue::bytes(r.seller)]),
    ])
}

/// Output id of the escrow contract awaiting redemption.
pub fn escrow_output_id(r: &Redeem) -> Hash32 {
    snapshot_output_id(&escrow_snapshot(r))
}

fn escrow_snapshot_literal(r: &Redeem) -> String {
    format!(
        "{{'C', x'{seed}', x'{prog}', {{'Z', {refund}}}, {{'S', x'{buyer}'}}, \
         {{'V', {amount}, x'{asset}', x'{anchor2}'}}, {{'S', x'{cipher}'}}, \
         {{'S', x'{clear}'}}, {{'S', x'{key}'}}, {{'S', x'{seller}'}}}}",
        seed = hex32(&ESCROW_SEED),
        prog = hex::encode(REDEMPTION_SOURCE.as_bytes()),
        refund = r.refund_deadline_ms,
        buyer = hex32(&r.buyer),
        amount = r.amount,
        asset = hex32(&r.asset_id),
        anchor2 = hex32(&r.anchor2),
        cipher = hex32(&r.cipher_root),
        clear = hex32(&r.clear_root),
        key = hex32(&r.key),
        seller = hex32(&r.seller),
    )
}

/// Seller-claims-payment transaction: rehydrate the escrow output, call
/// selector `0`, finalize. Valid only after the refund deadline.
pub fn claim_payment(r: &Redeem) -> String {
    let mut source = String::new();
    let _ = writeln!(source, "{} input", escrow_snapshot_literal(r));
    source.push_str("0 put call\nget finalize\n");
    source
}

/// Buyer-claims-refund transaction: rehydrate the escrow output and call
/// selector `1` with the fraud proof — both inclusion proofs, the
/// committed clear hash, the cipher chunk, and the varint-encoded index.
/// Valid only before the refund deadline.
pub fn claim_refund(
    r: &Redeem,
    index: u64,
    cipher_chunk: &[u8],
    clear_hash: &Hash32,
    cipher_proof: &Proof,
    clear_proof: &Proof,
) -> String {
    let mut source = String::new();
    let _ = writeln!(source, "{} input", escrow_snapshot_literal(r));
    let _ = writeln!(source, "{}", render_proof(cipher_proof));
    source.push_str("put\n");
    let _ = writeln!(source, "{}", render_proof(clear_proof));
    source.push_str("put\n");
    let _ = writeln!(source, "x'{}' put", hex32(clear_hash));
    let _ = writeln!(source, "x'{}' put", hex::encode(cipher_chunk));
    let _ = writeln!(source, "x'{}' put", hex::encode(uvarint(index)));
    source.push_str("1 put call\nget finalize\n");
    source
}

/// Renders a proof as ledger program input. The on-wire proof is ordered
/// leaf to root; the verifier pops root-proximal first, so rendering
/// reverses it.
fn render_proof(proof: &Proof) -> String {
    let mut out = String::from("{");
    for (i, step) in proof.steps.iter().rev().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(
            out,
            "x'{}', {}",
            hex32(&step.hash),
            if step.is_left { 1 } else { 0 }
        );
    }
    out.push('}');
    out
}

// ---------------------------------------------------------------------------
// Shared Literals
// ---------------------------------------------------------------------------

/// The standard pay-to-pubkey snapshot tuple, used for the change output id
/// and for rehydrating spendable inputs.
fn pay_snapshot(owner: &Hash32, amount: u64, asset_id: &Hash32, anchor: &Hash32) -> LogValue {
    LogValue::Tuple(vec![
        LogValue::bytes("C"),
        LogValue::bytes(*PAY_TO_PUBKEY_SEED),
        LogValue::bytes(PAY_TO_PUBKEY_SOURCE.as_bytes()),
        LogValue::Tuple(vec![LogValue::bytes("S"), LogValue::bytes(owner)]),
        LogValue::Tuple(vec![
            LogValue::bytes("V"),
            LogValue::Int(amount as i64),
            LogValue::bytes(asset_id),
            LogValue::bytes(anchor),
        ]),
    ])
}

fn pay_snapshot_literal(owner: &Hash32, amount: u64, asset_id: &Hash32, anchor: &Hash32) -> String {
    format!(
        "{{'C', x'{seed}', x'{prog}', {{'S', x'{owner}'}}, {{'V', {amount}, x'{asset}', x'{anchor}'}}}}",
        seed = hex32(&PAY_TO_PUBKEY_SEED),
        prog = hex::encode(PAY_TO_PUBKEY_SOURCE.as_bytes()),
        owner = hex32(owner),
        amount = amount,
        asset = hex32(asset_id),
        anchor = hex32(anchor),
    )
}
