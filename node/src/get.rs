//! # Buyer Driver
//!
//! Drives one transfer end to end: request the content, verify the stream
//! against the requested clear root, escrow payment, wait for the key (or
//! the deadline), decrypt and check every chunk, and settle — happily or
//! through a fraud proof.
//!
//! The [`BuyerSession`] machine owns the decisions; this driver owns the
//! I/O. Observer callbacks and the cancellation signal funnel into one
//! event loop so the machine sees a single ordered stream of events.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use ed25519_dalek::Signer as _;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use tessera_contracts::fraud::verify_refund_claim;
use tessera_contracts::program::{self, ProgramError, ProposeParams, Redeem};
use tessera_protocol::config::{
    CHUNK_SIZE, HASH_LENGTH, LEDGER_POLL_INTERVAL, REFUND_SUBMIT_MARGIN_MS, SUBMIT_BACKOFF,
    SUBMIT_RETRIES, TRANSFER_ID_HEADER,
};
use tessera_protocol::merkle::{indexed_leaf, Proof, ProofBuilder};
use tessera_protocol::observer::{Observer, TxEvent};
use tessera_protocol::reserve::{
    seeded_pool, MemoryReserver, Reservation, ReservationBook, Reserver,
};
use tessera_protocol::session::{
    BuyerAction, BuyerEvent, BuyerSession, BuyerState, DeadlineKind,
};
use tessera_protocol::store::{ChunkStore, FileChunkStore};
use tessera_protocol::transfer::{self, TransferError};
use tessera_protocol::types::{hex32, Hash32, ParsedTransfer};

use crate::cli::{parse_duration, parse_funds, parse_hash32, GetArgs};
use crate::keyfile;
use crate::ledger::{escrow_log_parser, HttpLedger};

/// Everything the event loop needs in one place.
struct Driver {
    session: BuyerSession,
    observer: Observer<HttpLedger>,
    reservation: Option<Box<dyn Reservation>>,
    reservation_id: String,
    book: ReservationBook,
    hashes: Option<FileChunkStore>,
    chunks: Option<FileChunkStore>,
    output_path: PathBuf,
    refund_deadline_ms: u64,
    /// The reveal transaction's parsed log, kept for refund construction.
    revealed: Option<ParsedTransfer>,
}

/// Messages funneled into the event loop.
enum DriverMsg {
    Session(BuyerEvent),
    RevealTx(TxEvent),
}

/// Runs the buyer until the transfer reaches a terminal state.
pub async fn run(args: GetArgs) -> Result<()> {
    let clear_root = parse_hash32(&args.hash).context("parsing --hash")?;
    let asset_id = parse_hash32(&args.asset).context("parsing --asset")?;
    let reveal_in = parse_duration(&args.reveal).context("parsing --reveal")?;
    let refund_in = parse_duration(&args.refund).context("parsing --refund")?;
    let keypair = keyfile::load(&args.key_file)?;
    let buyer: Hash32 = keypair.verifying_key().to_bytes();

    let db = sled::open(&args.db)
        .with_context(|| format!("opening state db {}", args.db.display()))?;
    let ledger = HttpLedger::new(&args.ledger);
    let observer = Observer::new(
        ledger.clone(),
        &db,
        escrow_log_parser(),
        LEDGER_POLL_INTERVAL,
    )?;
    let book = ReservationBook::open(&db)?;
    let reserver = MemoryReserver::new(seeded_pool(
        &hex32(&buyer),
        &asset_id,
        &parse_funds(&args.funds)?,
    ));

    let cancel = CancellationToken::new();
    {
        let observer = observer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { observer.run(cancel).await });
    }
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::warn!("interrupt received, cancelling transfer");
            cancel.cancel();
        });
    }

    tracing::info!("waiting for ledger time");
    let now = observer.wait_for_ledger_time(&cancel).await?;
    let reveal_deadline_ms = now + reveal_in.as_millis() as u64;
    let refund_deadline_ms = reveal_deadline_ms + refund_in.as_millis() as u64;
    if let (Some(reveal_at), Some(refund_at)) = (
        chrono::DateTime::from_timestamp_millis(reveal_deadline_ms as i64),
        chrono::DateTime::from_timestamp_millis(refund_deadline_ms as i64),
    ) {
        tracing::info!(
            reveal = %reveal_at.to_rfc3339(),
            refund = %refund_at.to_rfc3339(),
            "deadlines resolved against ledger time"
        );
    }

    // Hold funds before asking for the stream; the request names deadlines
    // the reservation must survive.
    let reservation = reserver.reserve(args.amount, &asset_id, reveal_deadline_ms)?;
    let reservation_id = format!("payment-{}", hex32(&clear_root));
    book.hold(&reservation_id)?;

    tracing::info!(
        clear_root = %hex32(&clear_root),
        amount = args.amount,
        reveal_deadline_ms,
        refund_deadline_ms,
        "requesting content"
    );
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/request", args.server.trim_end_matches('/')))
        .form(&[
            ("clearroot", args.hash.clone()),
            ("amount", args.amount.to_string()),
            ("assetid", args.asset.clone()),
            ("revealdeadline", reveal_deadline_ms.to_string()),
            ("refunddeadline", refund_deadline_ms.to_string()),
        ])
        .send()
        .await;

    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            let _ = book.cancel(&reservation_id);
            let _ = reservation.cancel();
            bail!("seller refused the request: {}", response.status());
        }
        Err(e) => {
            let _ = book.cancel(&reservation_id);
            let _ = reservation.cancel();
            return Err(e).context("posting /request");
        }
    };
    let transfer_id = response
        .headers()
        .get(TRANSFER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .context("response is missing the transfer id header")?;

    let mut session = BuyerSession::new(transfer_id.clone(), reveal_deadline_ms, refund_deadline_ms);
    session.on_event(BuyerEvent::RequestSent)?;

    let mut hashes = FileChunkStore::create(
        args.dir.join(format!("hashes-{transfer_id}")),
        HASH_LENGTH,
    )?;
    let mut chunks = FileChunkStore::create(
        args.dir.join(format!("chunks-{transfer_id}")),
        CHUNK_SIZE,
    )?;

    tracing::info!(transfer_id, "storing cipher chunks and clear hashes");
    let mut stream = StreamReader::new(Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    ));
    let received = transfer::receive(&mut stream, CHUNK_SIZE, &clear_root, &mut hashes, &mut chunks)
        .await;

    let mut driver = Driver {
        session,
        observer,
        reservation: Some(reservation),
        reservation_id,
        book,
        hashes: Some(hashes),
        chunks: Some(chunks),
        output_path: args.dir.join(hex32(&clear_root)),
        refund_deadline_ms,
        revealed: None,
    };

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<DriverMsg>();

    let cipher_root = match received {
        Ok(cipher_root) => {
            let actions = driver
                .session
                .on_event(BuyerEvent::StreamComplete { clear_root_ok: true })?;
            debug_assert_eq!(actions, vec![BuyerAction::SubmitProposal]);
            cipher_root
        }
        Err(TransferError::ClearRootMismatch { got, want }) => {
            tracing::error!(
                transfer_id,
                got = %hex32(&got),
                want = %hex32(&want),
                "seller committed to the wrong content"
            );
            let actions = driver
                .session
                .on_event(BuyerEvent::StreamComplete { clear_root_ok: false })?;
            driver.apply_actions(actions, &msg_tx).await?;
            bail!("transfer aborted: clear root mismatch (no funds committed)");
        }
        Err(e) => {
            let actions = driver.session.on_event(BuyerEvent::Cancelled)?;
            driver.apply_actions(actions, &msg_tx).await?;
            return Err(e).context("receiving chunk stream");
        }
    };

    // Build and sign the proposal, register for the outcome, then commit.
    let propose_params = ProposeParams {
        buyer,
        amount: args.amount,
        asset_id,
        clear_root,
        cipher_root,
        reveal_deadline_ms,
        refund_deadline_ms,
    };
    let signer = {
        let keypair = keypair.clone();
        move |message: &[u8]| -> Result<Vec<u8>, ProgramError> {
            Ok(keypair.sign(message).to_bytes().to_vec())
        }
    };
    let proposal = program::propose_payment(
        &propose_params,
        driver
            .reservation
            .as_deref()
            .expect("reservation held until commitment"),
        &signer,
    )?;
    tracing::info!(
        transfer_id,
        anchor1 = %hex32(&proposal.anchor1),
        "payment proposal built"
    );

    {
        let msg_tx = msg_tx.clone();
        driver.observer.watch_transfer(
            proposal.anchor1,
            refund_deadline_ms,
            move |event| {
                let _ = msg_tx.send(DriverMsg::RevealTx(event));
            },
        );
    }
    {
        let msg_tx = msg_tx.clone();
        driver
            .observer
            .enqueue_deadline(reveal_deadline_ms, move |at_ms| {
                let _ = msg_tx.send(DriverMsg::Session(BuyerEvent::DeadlineFired {
                    kind: DeadlineKind::Reveal,
                    at_ms,
                }));
            });
    }

    tracing::info!(transfer_id, "proposing payment");
    let posted = client
        .post(format!(
            "{}/propose-payment",
            args.server.trim_end_matches('/')
        ))
        .header(TRANSFER_ID_HEADER, &transfer_id)
        .body(proposal.source.clone().into_bytes())
        .send()
        .await;

    // From this point funds are committed, perhaps even on error.
    match posted {
        Ok(response) if response.status() == reqwest::StatusCode::NO_CONTENT => {
            driver.session.on_event(BuyerEvent::ProposalSubmitted)?;
            driver.book.commit(&driver.reservation_id)?;
        }
        Ok(response) => {
            tracing::warn!(transfer_id, status = %response.status(), "unexpected proposal status");
            driver.session.on_event(BuyerEvent::ProposalPostFailed)?;
        }
        Err(e) => {
            tracing::warn!(transfer_id, "sending proposal: {e}");
            driver.session.on_event(BuyerEvent::ProposalPostFailed)?;
        }
    }

    tracing::info!(transfer_id, "awaiting key or reveal deadline");
    while !driver.session.state().is_terminal() {
        let msg = tokio::select! {
            _ = cancel.cancelled() => DriverMsg::Session(BuyerEvent::Cancelled),
            msg = msg_rx.recv() => match msg {
                Some(msg) => msg,
                None => DriverMsg::Session(BuyerEvent::Cancelled),
            },
        };
        let event = match msg {
            DriverMsg::Session(event) => event,
            DriverMsg::RevealTx(tx) => {
                let Some(reveal) = tx.parsed.reveal.clone() else {
                    continue; // a bare proposal echo, not the completion
                };
                driver.revealed = Some(tx.parsed);
                BuyerEvent::RevealObserved {
                    key: reveal.key,
                    ledger_time_ms: tx.ledger_time_ms,
                }
            }
        };
        let actions = driver.session.on_event(event)?;
        driver.apply_actions(actions, &msg_tx).await?;
    }

    match driver.session.state() {
        BuyerState::Done => {
            tracing::info!(transfer_id, output = %driver.output_path.display(), "complete");
            Ok(())
        }
        BuyerState::Refunded => {
            tracing::info!(transfer_id, "refund claimed: payment and collateral recovered");
            Ok(())
        }
        BuyerState::Aborted => bail!("transfer aborted"),
        BuyerState::Expired => bail!("reveal deadline passed; escrow reverts to the buyer"),
        BuyerState::Lost => bail!("fraud detected but the refund window closed"),
        state => bail!("transfer ended in unexpected state {state:?}"),
    }
}

impl Driver {
    /// Executes the actions a transition produced.
    async fn apply_actions(
        &mut self,
        actions: Vec<BuyerAction>,
        msg_tx: &mpsc::UnboundedSender<DriverMsg>,
    ) -> Result<()> {
        for action in actions {
            match action {
                BuyerAction::SubmitProposal => {
                    // Built and posted by the main driver flow; nothing to
                    // do here.
                }
                BuyerAction::CancelReservation => {
                    if let Some(reservation) = self.reservation.take() {
                        reservation.cancel()?;
                        self.book.cancel(&self.reservation_id)?;
                        tracing::info!("reservation cancelled");
                    }
                }
                BuyerAction::Decrypt { key } => {
                    let event = self.decrypt(&key).await?;
                    let _ = msg_tx.send(DriverMsg::Session(event));
                }
                BuyerAction::ClaimRefund { bad_index } => {
                    let event = self.claim_refund(bad_index).await?;
                    let _ = msg_tx.send(DriverMsg::Session(event));
                }
                BuyerAction::Unregister => {
                    // Observer registrations expire with the refund
                    // deadline; nothing to tear down early.
                }
                BuyerAction::RemoveStores => {
                    if let Some(store) = self.hashes.take() {
                        store.remove()?;
                    }
                    if let Some(store) = self.chunks.take() {
                        store.remove()?;
                    }
                }
                BuyerAction::KeepStores => {
                    if let (Some(hashes), Some(chunks)) = (&self.hashes, &self.chunks) {
                        tracing::info!(
                            hashes = %hashes.path().display(),
                            chunks = %chunks.path().display(),
                            "keeping chunk stores for recovery"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs the decryption pass; a hash mismatch becomes a session event,
    /// not an error.
    async fn decrypt(&mut self, key: &Hash32) -> Result<BuyerEvent> {
        let (hashes, chunks) = (
            self.hashes.as_ref().context("hash store already removed")?,
            self.chunks.as_ref().context("chunk store already removed")?,
        );
        tracing::info!(output = %self.output_path.display(), "decrypting content");
        let mut out = tokio::fs::File::create(&self.output_path)
            .await
            .with_context(|| format!("creating {}", self.output_path.display()))?;

        let now_ms = self.observer.now_ms()?;
        match transfer::decrypt(&mut out, key, hashes, chunks).await {
            Ok(()) => Ok(BuyerEvent::DecryptFinished {
                bad_index: None,
                now_ms,
            }),
            Err(TransferError::BadClearHash { index }) => {
                tracing::warn!(index, "decryption failed; preparing refund claim");
                // The partial output is garbage; the stores stay.
                let _ = tokio::fs::remove_file(&self.output_path).await;
                Ok(BuyerEvent::DecryptFinished {
                    bad_index: Some(index),
                    now_ms,
                })
            }
            Err(e) => Err(e).context("decrypting content"),
        }
    }

    /// Builds, locally verifies, and submits the claim-refund transaction.
    async fn claim_refund(&mut self, bad_index: u64) -> Result<BuyerEvent> {
        let parsed = self
            .revealed
            .as_ref()
            .context("refund without an observed reveal")?;
        let redeem =
            Redeem::from_parsed(parsed).context("reveal data missing from parsed transfer")?;
        let (hashes, chunks) = (
            self.hashes.as_ref().context("hash store already removed")?,
            self.chunks.as_ref().context("chunk store already removed")?,
        );

        let (cipher_proof, clear_proof, cipher_chunk, committed_hash) =
            build_fraud_proofs(hashes, chunks, bad_index)?;

        // A claim the ledger would reject is not worth submitting; this
        // mirrors the on-chain clause exactly.
        if !verify_refund_claim(
            &redeem.key,
            bad_index,
            &cipher_chunk,
            &committed_hash,
            &cipher_proof,
            &clear_proof,
            &redeem.cipher_root,
            &redeem.clear_root,
        ) {
            bail!("refund claim failed local verification");
        }

        let claim = program::claim_refund(
            &redeem,
            bad_index,
            &cipher_chunk,
            &committed_hash,
            &cipher_proof,
            &clear_proof,
        );
        tracing::info!(bad_index, "submitting refund claim");
        self.observer
            .submit_with_retry(
                claim.as_bytes(),
                SUBMIT_RETRIES,
                SUBMIT_BACKOFF,
                Some(self.refund_deadline_ms.saturating_sub(REFUND_SUBMIT_MARGIN_MS)),
            )
            .await?;
        Ok(BuyerEvent::RefundAccepted)
    }
}

/// Second pass over the chunk stores: inclusion proofs for `index` in both
/// trees, plus the disputed cipher chunk and its committed clear hash.
fn build_fraud_proofs(
    hashes: &FileChunkStore,
    chunks: &FileChunkStore,
    index: u64,
) -> Result<(Proof, Proof, Vec<u8>, Hash32)> {
    let mut cipher_builder = ProofBuilder::new(index);
    let mut clear_builder = ProofBuilder::new(index);
    for i in 0..chunks.len() {
        let cipher = chunks.get(i)?;
        let hash = hashes.get(i)?;
        cipher_builder.add_leaf(&indexed_leaf(i, &cipher));
        clear_builder.add_leaf(&indexed_leaf(i, &hash));
    }
    let (cipher_proof, _) = cipher_builder.finish()?;
    let (clear_proof, _) = clear_builder.finish()?;

    let cipher_chunk = chunks.get(index)?;
    let committed_hash: Hash32 = hashes
        .get(index)?
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("stored clear hash {index} is not 32 bytes"))?;
    Ok((cipher_proof, clear_proof, cipher_chunk, committed_hash))
}
