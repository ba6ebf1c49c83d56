//! End-to-end scenarios for the Tessera fair-exchange protocol.
//!
//! These tests run both parties' engines against each other with a
//! scripted ledger: seller-side streaming, buyer-side verification and
//! decryption, contract program construction, log parsing, observer
//! dispatch, and the session state machines — the whole transfer, minus
//! real HTTP and a real chain. Ledger blocks are fed to the observers
//! directly, carrying the execution logs a validating chain would have
//! recorded.
//!
//! Each test stands alone with its own stores, observers, and funds.
//! Chunk size is 8 bytes throughout so multi-chunk trees stay small
//! enough to reason about by hand.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use tessera_contracts::anchor::value_and_change_anchors;
use tessera_contracts::fraud::verify_refund_claim;
use tessera_contracts::log::{expected_propose_log, expected_reveal_log, scan_log, ChangeRecord};
use tessera_contracts::program::{
    self, ExpectedTerms, ProgramError, Proposal, ProposeParams, Redeem,
};
use tessera_protocol::chunk::{clear_hash, encrypt_chunk, uvarint};
use tessera_protocol::merkle::{indexed_leaf, InterleavedBuilder, Proof, ProofBuilder};
use tessera_protocol::observer::{
    Block, CommittedTx, LedgerClient, Observer, ObserverError, TxEvent,
};
use tessera_protocol::reserve::{seeded_pool, MemoryReserver, Reservation, Reserver};
use tessera_protocol::session::{
    BuyerAction, BuyerEvent, BuyerSession, BuyerState, DeadlineKind, SellerAction, SellerEvent,
    SellerSession, SellerState,
};
use tessera_protocol::store::{ChunkStore, MemChunkStore};
use tessera_protocol::transfer::{self, TransferError};
use tessera_protocol::types::{Hash32, ParsedTransfer, RevealData};

const CHUNK_SIZE: usize = 8;
const REVEAL_MS: u64 = 10_000;
const REFUND_MS: u64 = 20_000;
const AMOUNT: u64 = 100;

const BUYER_PK: Hash32 = [0xb1; 32];
const SELLER_PK: Hash32 = [0x5e; 32];
const ASSET: Hash32 = [0xa5; 32];
const KEY: Hash32 = [0x42; 32];

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// The observers poll through this in production; here blocks are pushed
/// into `process_block` directly, so the client never answers.
struct ScriptedChain;

#[async_trait]
impl LedgerClient for ScriptedChain {
    async fn latest_height(&self) -> Result<u64, ObserverError> {
        Ok(0)
    }
    async fn block(&self, _height: u64) -> Result<Block, ObserverError> {
        Err(ObserverError::Client("scripted chain".into()))
    }
    async fn submit(&self, _program: &[u8]) -> Result<(), ObserverError> {
        Ok(())
    }
}

fn make_observer() -> Observer<ScriptedChain> {
    let db = sled::Config::new().temporary(true).open().unwrap();
    Observer::new(
        ScriptedChain,
        &db,
        Arc::new(|tx: &CommittedTx| scan_log(&tx.log)),
        std::time::Duration::from_millis(10),
    )
    .unwrap()
}

fn block(height: u64, timestamp_ms: u64, logs: Vec<Vec<tessera_protocol::types::LogValue>>) -> Block {
    Block {
        height,
        timestamp_ms,
        txs: logs
            .into_iter()
            .map(|log| CommittedTx {
                program: b"tx".to_vec(),
                log,
            })
            .collect(),
    }
}

fn signer(_: &[u8]) -> Result<Vec<u8>, ProgramError> {
    Ok(vec![0xab; 64])
}

/// Serves `plaintext` the way a seller would, optionally corrupting the
/// keystream at one chunk while keeping the honest clear hashes — the
/// malicious-seller shape whose clear root still matches the real file.
fn serve_wire(plaintext: &[u8], corrupt: Option<usize>) -> (Vec<u8>, Hash32, Hash32) {
    let mut wire = Vec::new();
    let mut builder = InterleavedBuilder::new();
    for (i, chunk) in plaintext.chunks(CHUNK_SIZE).enumerate() {
        let index = i as u64;
        let hash = clear_hash(index, chunk);
        let mut cipher = encrypt_chunk(&KEY, index, chunk);
        if corrupt == Some(i) {
            cipher[0] ^= 0xff;
        }
        wire.extend_from_slice(&uvarint(cipher.len() as u64));
        wire.extend_from_slice(&cipher);
        wire.extend_from_slice(&hash);
        builder.add(index, &hash, &cipher).unwrap();
    }
    let (clear_root, cipher_root) = builder.finish();
    (wire, clear_root, cipher_root)
}

#[derive(Debug)]
struct BuyerStores {
    hashes: MemChunkStore,
    chunks: MemChunkStore,
}

async fn buyer_receive(
    wire: &[u8],
    expected_clear_root: &Hash32,
) -> Result<(Hash32, BuyerStores), TransferError> {
    let mut hashes = MemChunkStore::new(32);
    let mut chunks = MemChunkStore::new(CHUNK_SIZE);
    let mut stream = wire;
    let cipher_root = transfer::receive(
        &mut stream,
        CHUNK_SIZE,
        expected_clear_root,
        &mut hashes,
        &mut chunks,
    )
    .await?;
    Ok((cipher_root, BuyerStores { hashes, chunks }))
}

fn propose_params(clear_root: Hash32, cipher_root: Hash32) -> ProposeParams {
    ProposeParams {
        buyer: BUYER_PK,
        amount: AMOUNT,
        asset_id: ASSET,
        clear_root,
        cipher_root,
        reveal_deadline_ms: REVEAL_MS,
        refund_deadline_ms: REFUND_MS,
    }
}

fn expected_terms(p: &ProposeParams) -> ExpectedTerms {
    ExpectedTerms {
        amount: p.amount,
        asset_id: p.asset_id,
        clear_root: p.clear_root,
        cipher_root: p.cipher_root,
        reveal_deadline_ms: p.reveal_deadline_ms,
        refund_deadline_ms: p.refund_deadline_ms,
    }
}

fn parsed_from(p: &ProposeParams, anchor1: Hash32) -> ParsedTransfer {
    ParsedTransfer {
        reveal_deadline_ms: p.reveal_deadline_ms,
        refund_deadline_ms: p.refund_deadline_ms,
        buyer: p.buyer,
        cipher_root: p.cipher_root,
        clear_root: p.clear_root,
        amount: p.amount,
        asset_id: p.asset_id,
        anchor1,
        reveal: None,
    }
}

/// Runs the seller's validation and completion over a proposal, returning
/// the completed transfer as a validating chain would log it.
fn seller_completes(
    proposal: &Proposal,
    params: &ProposeParams,
    collateral: &dyn Reservation,
) -> (ParsedTransfer, Vec<tessera_protocol::types::LogValue>) {
    let parsed = parsed_from(params, proposal.anchor1);
    let reveal = program::reveal_key(
        &proposal.source,
        &parsed,
        &expected_terms(params),
        &SELLER_PK,
        &KEY,
        collateral,
        &signer,
    )
    .expect("proposal should validate");

    let mut completed = parsed.clone();
    completed.reveal = Some(RevealData {
        anchor2: reveal.anchor2,
        key: KEY,
        seller: SELLER_PK,
        output_id: reveal.output_id,
    });
    let collateral_anchors: Vec<Hash32> = collateral.utxos().iter().map(|u| u.anchor).collect();
    let log = expected_reveal_log(
        &completed,
        &proposal.input_anchors,
        proposal.change.as_ref(),
        &collateral_anchors,
        None,
    );
    (completed, log)
}

fn fraud_proofs(stores: &BuyerStores, index: u64) -> (Proof, Proof, Vec<u8>, Hash32) {
    let mut cipher_builder = ProofBuilder::new(index);
    let mut clear_builder = ProofBuilder::new(index);
    for i in 0..stores.chunks.len() {
        cipher_builder.add_leaf(&indexed_leaf(i, &stores.chunks.get(i).unwrap()));
        clear_builder.add_leaf(&indexed_leaf(i, &stores.hashes.get(i).unwrap()));
    }
    let (cipher_proof, _) = cipher_builder.finish().unwrap();
    let (clear_proof, _) = clear_builder.finish().unwrap();
    let chunk = stores.chunks.get(index).unwrap();
    let hash: Hash32 = stores.hashes.get(index).unwrap().try_into().unwrap();
    (cipher_proof, clear_proof, chunk, hash)
}

/// Registers a buyer-style transfer watch that stashes the delivered
/// event.
fn watch(observer: &Observer<ScriptedChain>, anchor1: Hash32) -> Arc<Mutex<Option<TxEvent>>> {
    let slot = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    observer.watch_transfer(anchor1, REFUND_MS, move |event| {
        *sink.lock() = Some(event);
    });
    slot
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_delivers_plaintext_and_pays_seller() {
    let plaintext = b"0123456789ABCDEF"; // two chunks
    let (wire, clear_root, cipher_root) = serve_wire(plaintext, None);

    // Buyer: receive and verify the stream.
    let (got_cipher_root, stores) = buyer_receive(&wire, &clear_root).await.unwrap();
    assert_eq!(got_cipher_root, cipher_root);

    let mut buyer = BuyerSession::new("t", REVEAL_MS, REFUND_MS);
    buyer.on_event(BuyerEvent::RequestSent).unwrap();
    let actions = buyer
        .on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
        .unwrap();
    assert_eq!(actions, vec![BuyerAction::SubmitProposal]);

    // Buyer: build and "post" the proposal.
    let params = propose_params(clear_root, cipher_root);
    let reserver = MemoryReserver::new(seeded_pool("buyer", &ASSET, &[AMOUNT]));
    let reservation = reserver.reserve(AMOUNT, &ASSET, REVEAL_MS).unwrap();
    let proposal = program::propose_payment(&params, reservation.as_ref(), &signer).unwrap();
    buyer.on_event(BuyerEvent::ProposalSubmitted).unwrap();

    // Seller: validate, bind collateral, reveal.
    let mut seller = SellerSession::new("t", REVEAL_MS, REFUND_MS);
    seller.on_event(SellerEvent::ServeStarted).unwrap();
    seller.on_event(SellerEvent::StreamServed).unwrap();
    let seller_reserver = MemoryReserver::new(seeded_pool("seller", &ASSET, &[AMOUNT]));
    let collateral = seller_reserver.reserve(AMOUNT, &ASSET, REFUND_MS).unwrap();
    let (completed, reveal_log) = seller_completes(&proposal, &params, collateral.as_ref());
    assert_eq!(
        seller
            .on_event(SellerEvent::ProposalReceived { valid: true })
            .unwrap(),
        vec![SellerAction::SubmitReveal]
    );
    seller.on_event(SellerEvent::RevealSubmitted).unwrap();

    // The reveal lands on the ledger before the deadline; both observers
    // see it.
    let buyer_observer = make_observer();
    let seller_observer = make_observer();
    let reveal_slot = watch(&buyer_observer, proposal.anchor1);
    let seller_slot = watch(&seller_observer, proposal.anchor1);
    let reveal_block = block(1, 9_000, vec![reveal_log]);
    buyer_observer.process_block(&reveal_block).unwrap();
    seller_observer.process_block(&reveal_block).unwrap();

    let event = reveal_slot.lock().take().expect("buyer watch fired");
    assert_eq!(event.parsed, completed);
    let reveal = event.parsed.reveal.clone().unwrap();

    // Buyer: decrypt and verify every chunk.
    let actions = buyer
        .on_event(BuyerEvent::RevealObserved {
            key: reveal.key,
            ledger_time_ms: event.ledger_time_ms,
        })
        .unwrap();
    assert_eq!(actions, vec![BuyerAction::Decrypt { key: KEY }]);
    let mut out = Vec::new();
    transfer::decrypt(&mut out, &KEY, &stores.hashes, &stores.chunks)
        .await
        .unwrap();
    assert_eq!(out, plaintext);
    buyer
        .on_event(BuyerEvent::DecryptFinished { bad_index: None, now_ms: 9_100 })
        .unwrap();
    assert_eq!(buyer.state(), BuyerState::Done);

    // Seller: wait out the refund window, then claim.
    let seller_event = seller_slot.lock().take().expect("seller watch fired");
    assert_eq!(
        seller
            .on_event(SellerEvent::RevealConfirmed {
                ledger_time_ms: seller_event.ledger_time_ms,
            })
            .unwrap(),
        vec![SellerAction::ScheduleClaim]
    );
    let fired = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&fired);
    seller_observer.enqueue_deadline(REFUND_MS, move |at| *sink.lock() = Some(at));
    seller_observer
        .process_block(&block(2, REFUND_MS, vec![]))
        .unwrap();
    let at_ms = fired.lock().take().expect("claim timer fired");

    let actions = seller
        .on_event(SellerEvent::DeadlineFired { kind: DeadlineKind::Refund, at_ms })
        .unwrap();
    assert_eq!(actions, vec![SellerAction::SubmitClaim]);
    let redeem = Redeem::from_parsed(&completed).unwrap();
    assert_eq!(redeem.amount, 2 * AMOUNT);
    let claim = program::claim_payment(&redeem);
    assert!(claim.contains("0 put call"));

    seller.on_event(SellerEvent::PaymentClaimed).unwrap();
    assert_eq!(seller.state(), SellerState::Paid);
}

#[tokio::test]
async fn silent_buyer_releases_reservation_and_seller_walks_away() {
    let (wire, clear_root, _) = serve_wire(b"0123456789ABCDEF", None);
    let (_, _stores) = buyer_receive(&wire, &clear_root).await.unwrap();

    let reserver = MemoryReserver::new(seeded_pool("buyer", &ASSET, &[AMOUNT]));
    let reservation = reserver.reserve(AMOUNT, &ASSET, REVEAL_MS).unwrap();
    assert_eq!(reserver.available(&ASSET), 0);

    // The buyer goes silent after receiving the stream: no proposal is
    // ever posted.
    let mut buyer = BuyerSession::new("t", REVEAL_MS, REFUND_MS);
    buyer.on_event(BuyerEvent::RequestSent).unwrap();

    let observer = make_observer();
    let fired = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&fired);
    observer.enqueue_deadline(REVEAL_MS, move |at| *sink.lock() = Some(at));
    observer.process_block(&block(1, REVEAL_MS, vec![])).unwrap();
    let at_ms = fired.lock().take().unwrap();

    let actions = buyer
        .on_event(BuyerEvent::DeadlineFired { kind: DeadlineKind::Reveal, at_ms })
        .unwrap();
    assert!(actions.contains(&BuyerAction::CancelReservation));
    assert_eq!(buyer.state(), BuyerState::Aborted);
    assert!(!buyer.is_committed());

    // Executing the action restores the buyer's funds untouched.
    reservation.cancel().unwrap();
    assert_eq!(reserver.available(&ASSET), AMOUNT);

    // The seller saw no proposal and never bound collateral.
    let mut seller = SellerSession::new("t", REVEAL_MS, REFUND_MS);
    seller.on_event(SellerEvent::ServeStarted).unwrap();
    seller.on_event(SellerEvent::StreamServed).unwrap();
    seller
        .on_event(SellerEvent::DeadlineFired { kind: DeadlineKind::Reveal, at_ms: REVEAL_MS })
        .unwrap();
    assert_eq!(seller.state(), SellerState::Aborted);
}

#[tokio::test]
async fn malicious_seller_one_bad_chunk_loses_collateral() {
    let plaintext = b"0123456789ABCDEF";
    // Chunk 1's keystream is corrupted; the clear hashes (and so the clear
    // root) still describe the honest plaintext.
    let (wire, clear_root, cipher_root) = serve_wire(plaintext, Some(1));
    {
        let (_, honest_root, _) = serve_wire(plaintext, None);
        assert_eq!(clear_root, honest_root);
    }

    // The stream itself verifies: the fraud is only visible after reveal.
    let (got_cipher_root, stores) = buyer_receive(&wire, &clear_root).await.unwrap();
    assert_eq!(got_cipher_root, cipher_root);

    let mut buyer = BuyerSession::new("t", REVEAL_MS, REFUND_MS);
    buyer.on_event(BuyerEvent::RequestSent).unwrap();
    buyer
        .on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
        .unwrap();

    let params = propose_params(clear_root, cipher_root);
    let reserver = MemoryReserver::new(seeded_pool("buyer", &ASSET, &[AMOUNT]));
    let reservation = reserver.reserve(AMOUNT, &ASSET, REVEAL_MS).unwrap();
    let proposal = program::propose_payment(&params, reservation.as_ref(), &signer).unwrap();
    buyer.on_event(BuyerEvent::ProposalSubmitted).unwrap();

    let seller_reserver = MemoryReserver::new(seeded_pool("seller", &ASSET, &[AMOUNT]));
    let collateral = seller_reserver.reserve(AMOUNT, &ASSET, REFUND_MS).unwrap();
    let (completed, reveal_log) = seller_completes(&proposal, &params, collateral.as_ref());

    let observer = make_observer();
    let slot = watch(&observer, proposal.anchor1);
    observer.process_block(&block(1, 9_000, vec![reveal_log])).unwrap();
    let event = slot.lock().take().unwrap();
    buyer
        .on_event(BuyerEvent::RevealObserved {
            key: KEY,
            ledger_time_ms: event.ledger_time_ms,
        })
        .unwrap();

    // Decryption halts at the corrupted chunk.
    let mut out = Vec::new();
    let err = transfer::decrypt(&mut out, &KEY, &stores.hashes, &stores.chunks)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::BadClearHash { index: 1 }));

    let actions = buyer
        .on_event(BuyerEvent::DecryptFinished { bad_index: Some(1), now_ms: 9_200 })
        .unwrap();
    assert!(actions.contains(&BuyerAction::ClaimRefund { bad_index: 1 }));

    // The fraud proof verifies exactly as the refund clause will.
    let (cipher_proof, clear_proof, bad_chunk, committed_hash) = fraud_proofs(&stores, 1);
    assert!(verify_refund_claim(
        &KEY,
        1,
        &bad_chunk,
        &committed_hash,
        &cipher_proof,
        &clear_proof,
        &cipher_root,
        &clear_root,
    ));

    // Refund exclusivity: the honest chunk at index 0 proves nothing.
    let (p0, c0, chunk0, hash0) = fraud_proofs(&stores, 0);
    assert!(!verify_refund_claim(
        &KEY, 0, &chunk0, &hash0, &p0, &c0, &cipher_root, &clear_root,
    ));

    let redeem = Redeem::from_parsed(&completed).unwrap();
    let claim = program::claim_refund(&redeem, 1, &bad_chunk, &committed_hash, &cipher_proof, &clear_proof);
    assert!(claim.contains("1 put call"));

    buyer.on_event(BuyerEvent::RefundAccepted).unwrap();
    assert_eq!(buyer.state(), BuyerState::Refunded);
    // The redeemed value is payment plus collateral.
    assert_eq!(redeem.amount, 2 * AMOUNT);
}

#[tokio::test]
async fn wrong_root_aborts_with_no_funds_committed() {
    // The seller serves different content than requested.
    let (wire, _actual_root, _) = serve_wire(b"the wrong file entirely!", None);
    let (_, requested_root, _) = serve_wire(b"0123456789ABCDEF", None);

    let err = buyer_receive(&wire, &requested_root).await.unwrap_err();
    assert!(matches!(err, TransferError::ClearRootMismatch { .. }));

    let reserver = MemoryReserver::new(seeded_pool("buyer", &ASSET, &[AMOUNT]));
    let reservation = reserver.reserve(AMOUNT, &ASSET, REVEAL_MS).unwrap();

    let mut buyer = BuyerSession::new("t", REVEAL_MS, REFUND_MS);
    buyer.on_event(BuyerEvent::RequestSent).unwrap();
    let actions = buyer
        .on_event(BuyerEvent::StreamComplete { clear_root_ok: false })
        .unwrap();
    assert!(actions.contains(&BuyerAction::CancelReservation));
    assert_eq!(buyer.state(), BuyerState::Aborted);
    assert!(!buyer.is_committed());

    reservation.cancel().unwrap();
    assert_eq!(reserver.available(&ASSET), AMOUNT);
}

#[tokio::test]
async fn seller_late_reveal_expires_the_transfer() {
    let (wire, clear_root, cipher_root) = serve_wire(b"0123456789ABCDEF", None);
    let (_, _stores) = buyer_receive(&wire, &clear_root).await.unwrap();

    let mut buyer = BuyerSession::new("t", REVEAL_MS, REFUND_MS);
    buyer.on_event(BuyerEvent::RequestSent).unwrap();
    buyer
        .on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
        .unwrap();

    let params = propose_params(clear_root, cipher_root);
    let reserver = MemoryReserver::new(seeded_pool("buyer", &ASSET, &[AMOUNT]));
    let reservation = reserver.reserve(AMOUNT, &ASSET, REVEAL_MS).unwrap();
    let proposal = program::propose_payment(&params, reservation.as_ref(), &signer).unwrap();
    buyer.on_event(BuyerEvent::ProposalSubmitted).unwrap();

    // No reveal transaction ever lands. Ledger time crosses the deadline
    // and the deadline timer fires; the watch stays silent.
    let observer = make_observer();
    let slot = watch(&observer, proposal.anchor1);
    let fired = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&fired);
    observer.enqueue_deadline(REVEAL_MS, move |at| *sink.lock() = Some(at));
    observer
        .process_block(&block(1, REVEAL_MS + 1, vec![]))
        .unwrap();

    assert!(slot.lock().is_none());
    let at_ms = fired.lock().take().unwrap();
    buyer
        .on_event(BuyerEvent::DeadlineFired { kind: DeadlineKind::Reveal, at_ms })
        .unwrap();
    assert_eq!(buyer.state(), BuyerState::Expired);

    // The escrow output's expiry clause makes the funds reclaimable on
    // the ledger; locally the transfer is over and committed funds are
    // the ledger's to return.
    assert!(buyer.is_committed());
}

#[tokio::test]
async fn change_output_id_is_deterministic_and_survives_parsing() {
    let (wire, clear_root, cipher_root) = serve_wire(b"0123456789ABCDEF", None);
    let (_, _stores) = buyer_receive(&wire, &clear_root).await.unwrap();

    // Inputs total AMOUNT + 37, forcing a change output.
    let reserver = MemoryReserver::new(seeded_pool("buyer", &ASSET, &[60, 77]));
    let reservation = reserver.reserve(AMOUNT, &ASSET, REVEAL_MS).unwrap();
    assert_eq!(reservation.change(), 37);

    let params = propose_params(clear_root, cipher_root);
    let proposal = program::propose_payment(&params, reservation.as_ref(), &signer).unwrap();

    // The recorded change anchor must match the shared merge/split
    // derivation over the same inputs.
    let (expected_anchor1, expected_change_anchor) =
        value_and_change_anchors(&proposal.input_anchors, true).unwrap();
    let (change_amount, change_anchor, change_output_id) =
        proposal.change.expect("change must be recorded");
    assert_eq!(proposal.anchor1, expected_anchor1);
    assert_eq!(change_amount, 37);
    assert_eq!(change_anchor, expected_change_anchor.unwrap());

    // The signature predicate pins the derived output id: tampering with
    // the contract body would shift the log and break every signature.
    assert!(proposal.source.contains(&hex::encode(
        format!("x'{}' eq verify", hex::encode(change_output_id)).as_bytes()
    )));

    // Parse/build bijection, change case: predicting the log of this
    // proposal and scanning it back recovers the committed parameters.
    let parsed = parsed_from(&params, proposal.anchor1);
    let change: ChangeRecord = (change_amount, change_anchor, change_output_id);
    let log = expected_propose_log(&parsed, &proposal.input_anchors, Some(&change));
    assert_eq!(scan_log(&log), Some(parsed));
}
