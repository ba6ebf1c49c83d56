//! # Seller Server
//!
//! The seller's HTTP surface and driver. Two endpoints:
//!
//! | Method | Path               | Description                              |
//! |--------|--------------------|------------------------------------------|
//! | POST   | `/request`         | Start a transfer; response body is the   |
//! |        |                    | chunk stream, `X-Tedd-Transfer-Id` names |
//! |        |                    | the transfer                             |
//! | POST   | `/propose-payment` | Submit the buyer's payment proposal;     |
//! |        |                    | `204 No Content` on acceptance           |
//!
//! The handlers feed the per-transfer [`SellerSession`] state machine and
//! execute the actions it returns; everything after the proposal — reveal
//! confirmation, the refund window, claiming payment — is driven by
//! observer callbacks against ledger time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Router};
use ed25519_dalek::{Signer as _, SigningKey};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use tessera_contracts::program::{self, ExpectedTerms, ProgramError, Redeem};
use tessera_protocol::chunk::clear_hash;
use tessera_protocol::config::{
    CHUNK_SIZE, LEDGER_POLL_INTERVAL, SUBMIT_BACKOFF, SUBMIT_RETRIES, TRANSFER_ID_HEADER,
};
use tessera_protocol::merkle::{indexed_leaf, RootBuilder};
use tessera_protocol::observer::Observer;
use tessera_protocol::reserve::{seeded_pool, MemoryReserver, ReservationBook, Reserver};
use tessera_protocol::session::{DeadlineKind, SellerAction, SellerEvent, SellerSession};
use tessera_protocol::transfer;
use tessera_protocol::types::{hex32, Hash32};

use crate::cli::{parse_funds, parse_hash32, ServeArgs};
use crate::keyfile;
use crate::ledger::{escrow_log_parser, HttpLedger};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct SellerTransfer {
    session: SellerSession,
    key: Hash32,
    reveal_deadline_ms: u64,
    refund_deadline_ms: u64,
    cipher_root: Option<Hash32>,
    redeem: Option<Redeem>,
}

struct Inner {
    content: PathBuf,
    clear_root: Hash32,
    price: u64,
    asset_id: Hash32,
    keypair: SigningKey,
    seller_pubkey: Hash32,
    ledger: HttpLedger,
    observer: Observer<HttpLedger>,
    reserver: MemoryReserver,
    book: ReservationBook,
    transfers: Mutex<HashMap<String, Arc<Mutex<SellerTransfer>>>>,
}

/// Shared application state; cheap to clone into handlers and callbacks.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

/// Builds the seller router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/request", post(request_handler))
        .route("/propose-payment", post(propose_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// /request
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RequestForm {
    clearroot: String,
    amount: u64,
    assetid: String,
    revealdeadline: u64,
    refunddeadline: u64,
}

async fn request_handler(
    State(state): State<AppState>,
    Form(form): Form<RequestForm>,
) -> Response {
    let inner = &state.inner;

    let Ok(clear_root) = parse_hash32(&form.clearroot) else {
        return bad_request("clearroot is not 32 bytes of hex");
    };
    let Ok(asset_id) = parse_hash32(&form.assetid) else {
        return bad_request("assetid is not 32 bytes of hex");
    };
    if clear_root != inner.clear_root {
        return bad_request("no content with that clear root");
    }
    if form.amount != inner.price || asset_id != inner.asset_id {
        return bad_request("amount or asset does not match the offer");
    }
    let now = match inner.observer.now_ms() {
        Ok(now) => now,
        Err(_) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "ledger time not yet known").into_response()
        }
    };
    if form.revealdeadline <= now || form.refunddeadline <= form.revealdeadline {
        return bad_request("deadlines are not in the future, in order");
    }

    let transfer_id = Uuid::new_v4().to_string();
    let mut key = [0u8; 32];
    {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut key);
    }

    let mut session = SellerSession::new(
        transfer_id.clone(),
        form.revealdeadline,
        form.refunddeadline,
    );
    if session.on_event(SellerEvent::ServeStarted).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "session error").into_response();
    }
    let record = Arc::new(Mutex::new(SellerTransfer {
        session,
        key,
        reveal_deadline_ms: form.revealdeadline,
        refund_deadline_ms: form.refunddeadline,
        cipher_root: None,
        redeem: None,
    }));
    inner
        .transfers
        .lock()
        .insert(transfer_id.clone(), Arc::clone(&record));

    // If no valid proposal shows up before the reveal deadline, the
    // transfer dies quietly.
    {
        let state = state.clone();
        let transfer_id = transfer_id.clone();
        inner
            .observer
            .enqueue_deadline(form.revealdeadline, move |at_ms| {
                drive_seller(
                    &state,
                    &transfer_id,
                    SellerEvent::DeadlineFired {
                        kind: DeadlineKind::Reveal,
                        at_ms,
                    },
                );
            });
    }

    let mut content = match tokio::fs::File::open(&inner.content).await {
        Ok(file) => file,
        Err(e) => {
            tracing::error!("opening content file: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "content unavailable").into_response();
        }
    };

    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    {
        let state = state.clone();
        let transfer_id = transfer_id.clone();
        tokio::spawn(async move {
            match transfer::serve(&mut content, &mut writer, CHUNK_SIZE, &key).await {
                Ok((clear_root, cipher_root)) => {
                    debug_assert_eq!(clear_root, state.inner.clear_root);
                    if let Some(record) = state.inner.transfers.lock().get(&transfer_id) {
                        record.lock().cipher_root = Some(cipher_root);
                    }
                    drive_seller(&state, &transfer_id, SellerEvent::StreamServed);
                    tracing::info!(
                        transfer_id,
                        cipher_root = %hex32(&cipher_root),
                        "chunk stream served"
                    );
                }
                Err(e) => {
                    // The buyer hung up or the disk failed; either way this
                    // transfer is over.
                    tracing::warn!(transfer_id, "serving chunk stream failed: {e}");
                    drive_seller(&state, &transfer_id, SellerEvent::Cancelled);
                }
            }
        });
    }

    tracing::info!(transfer_id, amount = form.amount, "transfer started");
    Response::builder()
        .status(StatusCode::OK)
        .header(TRANSFER_ID_HEADER, transfer_id)
        .body(Body::from_stream(ReaderStream::new(reader)))
        .expect("static response construction")
}

fn bad_request(msg: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

// ---------------------------------------------------------------------------
// /propose-payment
// ---------------------------------------------------------------------------

async fn propose_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inner = &state.inner;

    let Some(transfer_id) = headers
        .get(TRANSFER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return bad_request("missing transfer id header");
    };
    let Some(record) = inner.transfers.lock().get(&transfer_id).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown transfer").into_response();
    };

    let Ok(proposal_source) = std::str::from_utf8(&body) else {
        drive_seller(&state, &transfer_id, SellerEvent::ProposalReceived { valid: false });
        return bad_request("proposal is not a program");
    };

    // Execute the proposal in inspection mode and read the committed
    // parameters out of its log.
    let parsed = match inner.ledger.inspect(&body).await {
        Ok(Some(log)) => tessera_contracts::log::scan_log(&log),
        Ok(None) => None,
        Err(e) => {
            tracing::error!(transfer_id, "inspecting proposal: {e}");
            return (StatusCode::BAD_GATEWAY, "ledger unavailable").into_response();
        }
    };
    let Some(parsed) = parsed else {
        tracing::warn!(transfer_id, "proposal log has no escrow call");
        drive_seller(&state, &transfer_id, SellerEvent::ProposalReceived { valid: false });
        return bad_request("cannot parse payment proposal");
    };

    let (want, key) = {
        let record = record.lock();
        let Some(cipher_root) = record.cipher_root else {
            return (StatusCode::CONFLICT, "chunk stream still in flight").into_response();
        };
        (
            ExpectedTerms {
                amount: inner.price,
                asset_id: inner.asset_id,
                clear_root: inner.clear_root,
                cipher_root,
                reveal_deadline_ms: record.reveal_deadline_ms,
                refund_deadline_ms: record.refund_deadline_ms,
            },
            record.key,
        )
    };

    // Collateral: the same amount the buyer escrowed.
    let reservation = match inner
        .reserver
        .reserve(inner.price, &inner.asset_id, want.refund_deadline_ms)
    {
        Ok(reservation) => reservation,
        Err(e) => {
            tracing::error!(transfer_id, "reserving collateral: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, "collateral unavailable").into_response();
        }
    };
    let reservation_id = format!("collateral-{transfer_id}");
    if let Err(e) = inner.book.hold(&reservation_id) {
        tracing::error!(transfer_id, "tracking reservation: {e}");
        let _ = reservation.cancel();
        return (StatusCode::INTERNAL_SERVER_ERROR, "reservation tracking").into_response();
    }

    let keypair = inner.keypair.clone();
    let signer = move |message: &[u8]| -> Result<Vec<u8>, ProgramError> {
        Ok(keypair.sign(message).to_bytes().to_vec())
    };

    let reveal = match program::reveal_key(
        proposal_source,
        &parsed,
        &want,
        &inner.seller_pubkey,
        &key,
        reservation.as_ref(),
        &signer,
    ) {
        Ok(reveal) => reveal,
        Err(e) => {
            tracing::warn!(transfer_id, "rejecting proposal: {e}");
            let _ = inner.book.cancel(&reservation_id);
            let _ = reservation.cancel();
            drive_seller(&state, &transfer_id, SellerEvent::ProposalReceived { valid: false });
            return bad_request("proposal does not match the offered terms");
        }
    };

    drive_seller(&state, &transfer_id, SellerEvent::ProposalReceived { valid: true });

    if let Err(e) = inner
        .observer
        .submit_with_retry(reveal.source.as_bytes(), SUBMIT_RETRIES, SUBMIT_BACKOFF, None)
        .await
    {
        tracing::error!(transfer_id, "submitting reveal transaction: {e}");
        let _ = inner.book.cancel(&reservation_id);
        let _ = reservation.cancel();
        drive_seller(&state, &transfer_id, SellerEvent::Cancelled);
        return (StatusCode::BAD_GATEWAY, "reveal submission failed").into_response();
    }
    // Consumed by the finalized transaction.
    if let Err(e) = inner.book.commit(&reservation_id) {
        tracing::error!(transfer_id, "marking reservation committed: {e}");
    }

    {
        let mut record = record.lock();
        record.redeem = Some(Redeem {
            refund_deadline_ms: parsed.refund_deadline_ms,
            buyer: parsed.buyer,
            seller: inner.seller_pubkey,
            amount: 2 * parsed.amount,
            asset_id: parsed.asset_id,
            anchor2: reveal.anchor2,
            cipher_root: parsed.cipher_root,
            clear_root: parsed.clear_root,
            key,
        });
    }
    drive_seller(&state, &transfer_id, SellerEvent::RevealSubmitted);

    // Wait for the reveal to land, then sit out the refund window.
    {
        let state = state.clone();
        let transfer_id = transfer_id.clone();
        inner.observer.watch_transfer(
            parsed.anchor1,
            want.refund_deadline_ms,
            move |event| {
                if event.parsed.reveal.is_some() {
                    drive_seller(
                        &state,
                        &transfer_id,
                        SellerEvent::RevealConfirmed {
                            ledger_time_ms: event.ledger_time_ms,
                        },
                    );
                }
            },
        );
    }

    tracing::info!(transfer_id, "proposal accepted, reveal submitted");
    StatusCode::NO_CONTENT.into_response()
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Applies one event to a transfer's session and executes the resulting
/// actions. Callbacks re-enter here, so the record lock is never held
/// across an action.
fn drive_seller(state: &AppState, transfer_id: &str, event: SellerEvent) {
    let Some(record) = state.inner.transfers.lock().get(transfer_id).cloned() else {
        return;
    };
    let actions = {
        let mut record = record.lock();
        match record.session.on_event(event) {
            Ok(actions) => actions,
            Err(e) => {
                tracing::error!(transfer_id, "seller session error: {e}");
                return;
            }
        }
    };

    for action in actions {
        match action {
            SellerAction::SubmitReveal => {
                // Handled inline by the proposal handler, which owns the
                // reservation and the proposal source.
            }
            SellerAction::ScheduleClaim => {
                let refund_deadline_ms = record.lock().refund_deadline_ms;
                let observer = state.inner.observer.clone();
                let state = state.clone();
                let transfer_id = transfer_id.to_string();
                observer.enqueue_deadline(refund_deadline_ms, move |at_ms| {
                    drive_seller(
                        &state,
                        &transfer_id,
                        SellerEvent::DeadlineFired {
                            kind: DeadlineKind::Refund,
                            at_ms,
                        },
                    );
                });
            }
            SellerAction::SubmitClaim => {
                let Some(redeem) = record.lock().redeem.clone() else {
                    tracing::error!(transfer_id, "claim scheduled without redeem data");
                    continue;
                };
                let claim = program::claim_payment(&redeem);
                let state = state.clone();
                let transfer_id = transfer_id.to_string();
                tokio::spawn(async move {
                    match state
                        .inner
                        .observer
                        .submit_with_retry(
                            claim.as_bytes(),
                            SUBMIT_RETRIES,
                            SUBMIT_BACKOFF,
                            None,
                        )
                        .await
                    {
                        Ok(()) => {
                            tracing::info!(transfer_id, "payment claimed");
                            drive_seller(&state, &transfer_id, SellerEvent::PaymentClaimed);
                        }
                        Err(e) => {
                            // A rejection after the refund deadline means
                            // the output is gone: the buyer proved fraud
                            // and took it.
                            tracing::warn!(transfer_id, "claim rejected: {e}");
                            drive_seller(&state, &transfer_id, SellerEvent::RefundObserved);
                        }
                    }
                });
            }
            SellerAction::Unregister => {
                // Watches and timers expire on their own; per-transfer
                // registrations are pruned by ledger time.
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Hashes the content file into its clear root, returning the chunk count.
fn content_clear_root(path: &std::path::Path) -> anyhow::Result<(Hash32, u64)> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening content file {}", path.display()))?;
    let mut builder = RootBuilder::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut index: u64 = 0;
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let hash = clear_hash(index, &buf[..filled]);
        builder.add_leaf(&indexed_leaf(index, &hash));
        index += 1;
        if filled < CHUNK_SIZE {
            break;
        }
    }
    anyhow::ensure!(index > 0, "content file {} is empty", path.display());
    Ok((builder.finish(), index))
}

/// Runs the seller node until interrupted.
pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let keypair = keyfile::load(&args.key_file)?;
    let seller_pubkey: Hash32 = keypair.verifying_key().to_bytes();
    let asset_id = parse_hash32(&args.asset).context("parsing --asset")?;
    let (clear_root, chunks) = content_clear_root(&args.content)?;

    tracing::info!(
        content = %args.content.display(),
        clear_root = %hex32(&clear_root),
        chunks,
        price = args.amount,
        "offering content"
    );

    let db = sled::open(&args.db)
        .with_context(|| format!("opening state db {}", args.db.display()))?;
    let ledger = HttpLedger::new(&args.ledger);
    let observer = Observer::new(
        ledger.clone(),
        &db,
        escrow_log_parser(),
        LEDGER_POLL_INTERVAL,
    )?;
    let reserver = MemoryReserver::new(seeded_pool(
        &hex32(&seller_pubkey),
        &asset_id,
        &parse_funds(&args.funds)?,
    ));
    let book = ReservationBook::open(&db)?;

    let cancel = CancellationToken::new();
    {
        let observer = observer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { observer.run(cancel).await });
    }

    let state = AppState {
        inner: Arc::new(Inner {
            content: args.content,
            clear_root,
            price: args.amount,
            asset_id,
            keypair,
            seller_pubkey,
            ledger,
            observer,
            reserver,
            book,
            transfers: Mutex::new(HashMap::new()),
        }),
    };

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    tracing::info!("seller listening on {}", args.addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(crate::shutdown_signal())
        .await
        .context("serving")?;

    cancel.cancel();
    Ok(())
}
