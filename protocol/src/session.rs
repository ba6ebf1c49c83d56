//! # Session State Machines
//!
//! One state machine per party, driving a transfer from request to
//! settlement. The machines are pure: they react to input events with state
//! transitions and a list of actions for the driver to execute, and they
//! never touch the network, the disk, or the clock. State lives in an
//! explicit enum, not in the shape of a call chain.
//!
//! The error taxonomy lives here too. Lower layers report what went wrong;
//! only the session layer decides what terminates a transfer. The one
//! deliberately asymmetric rule is the commitment point: once the proposal
//! has been posted, transport failures stop being fatal — funds may be
//! committed, and the ledger outcome is dispositive, so the machine stays
//! put and waits for the observer.

use thiserror::Error;

use crate::observer::ObserverError;
use crate::reserve::ReserveError;
use crate::store::StoreError;
use crate::transfer::TransferError;
use crate::types::Hash32;

/// Which contract deadline a timer refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    Reveal,
    Refund,
}

// ---------------------------------------------------------------------------
// Error Taxonomy
// ---------------------------------------------------------------------------

/// Transfer-terminating (or, for `CommitmentHazard`, explicitly
/// non-terminating) failures, classified by kind.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad flags, unreadable key file. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP or stream I/O failure before the commitment point. The
    /// transfer is abandoned and the reservation cancelled.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed chunk stream, unparseable proposal, or a parameter
    /// mismatch. Abort without committing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure after the proposal was posted. Not terminal: funds may be
    /// committed, so the session awaits the ledger outcome.
    #[error("post-commitment failure, awaiting ledger outcome: {0}")]
    CommitmentHazard(String),

    /// Decryption disproved the seller's commitment at this chunk.
    #[error("fraud detected at chunk {index}")]
    FraudDetected { index: u64 },

    /// A deadline passed without the required action.
    #[error("{kind:?} deadline expired at ledger time {now_ms}")]
    DeadlineExpired { kind: DeadlineKind, now_ms: u64 },

    /// The ledger rejected a submission past all retries.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// An event arrived that the current state cannot accept.
    #[error("unexpected event in state {state}: {event}")]
    UnexpectedEvent { state: String, event: String },
}

impl From<TransferError> for SessionError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::BadClearHash { index } => SessionError::FraudDetected { index },
            TransferError::ClearRootMismatch { .. }
            | TransferError::MalformedRecord { .. }
            | TransferError::EmptyStream
            | TransferError::CorruptHashRecord { .. }
            | TransferError::Merkle(_) => SessionError::Protocol(e.to_string()),
            TransferError::TruncatedStream | TransferError::Io(_) | TransferError::Store(_) => {
                SessionError::Transport(e.to_string())
            }
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Transport(e.to_string())
    }
}

impl From<ObserverError> for SessionError {
    fn from(e: ObserverError) -> Self {
        SessionError::Ledger(e.to_string())
    }
}

impl From<ReserveError> for SessionError {
    fn from(e: ReserveError) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Buyer
// ---------------------------------------------------------------------------

/// Buyer-side transfer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyerState {
    /// Nothing sent yet.
    Idle,
    /// Request posted, reservation held, stream incoming.
    Requested,
    /// Stream verified against the clear root; proposal in flight or
    /// awaiting the key reveal.
    Proposed,
    /// Key observed; chunks being decrypted and checked.
    Decrypting,
    /// Fraud detected; refund claim in flight.
    Refunding,
    /// Terminal: plaintext delivered, payment stands.
    Done,
    /// Terminal: fraud proven, payment plus collateral recovered.
    Refunded,
    /// Terminal: aborted before commitment; no funds at risk.
    Aborted,
    /// Terminal: reveal deadline passed; the contract returns the escrow.
    Expired,
    /// Terminal: fraud detected but the refund window closed first.
    Lost,
}

impl BuyerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuyerState::Done
                | BuyerState::Refunded
                | BuyerState::Aborted
                | BuyerState::Expired
                | BuyerState::Lost
        )
    }
}

/// Inputs to the buyer machine.
#[derive(Debug, Clone)]
pub enum BuyerEvent {
    /// `/request` posted and the reservation held.
    RequestSent,
    /// The chunk stream closed; `clear_root_ok` is the root comparison.
    StreamComplete { clear_root_ok: bool },
    /// The proposal POST returned success.
    ProposalSubmitted,
    /// The proposal POST failed after the body was sent. Funds may be
    /// committed regardless.
    ProposalPostFailed,
    /// The observer matched a reveal transaction for this transfer.
    RevealObserved { key: Hash32, ledger_time_ms: u64 },
    /// A deadline timer fired at the given ledger time.
    DeadlineFired { kind: DeadlineKind, at_ms: u64 },
    /// Decryption finished; `bad_index` carries the first mismatch.
    DecryptFinished { bad_index: Option<u64>, now_ms: u64 },
    /// The refund claim was accepted by the ledger.
    RefundAccepted,
    /// User interrupt or fatal local error.
    Cancelled,
}

impl BuyerEvent {
    fn name(&self) -> &'static str {
        match self {
            BuyerEvent::RequestSent => "RequestSent",
            BuyerEvent::StreamComplete { .. } => "StreamComplete",
            BuyerEvent::ProposalSubmitted => "ProposalSubmitted",
            BuyerEvent::ProposalPostFailed => "ProposalPostFailed",
            BuyerEvent::RevealObserved { .. } => "RevealObserved",
            BuyerEvent::DeadlineFired { .. } => "DeadlineFired",
            BuyerEvent::DecryptFinished { .. } => "DecryptFinished",
            BuyerEvent::RefundAccepted => "RefundAccepted",
            BuyerEvent::Cancelled => "Cancelled",
        }
    }
}

/// Outputs of the buyer machine, executed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuyerAction {
    /// Build and POST the payment proposal.
    SubmitProposal,
    /// Release the reservation (never emitted after commitment).
    CancelReservation,
    /// Run the decryption pass with the revealed key.
    Decrypt { key: Hash32 },
    /// Build and submit the refund claim for this chunk.
    ClaimRefund { bad_index: u64 },
    /// Drop observer registrations for this transfer.
    Unregister,
    /// Delete the per-transfer chunk stores (clean completion only).
    RemoveStores,
    /// Keep the chunk stores on disk for recovery or proof construction.
    KeepStores,
}

/// The buyer's per-transfer state machine.
#[derive(Debug)]
pub struct BuyerSession {
    transfer_id: String,
    reveal_deadline_ms: u64,
    refund_deadline_ms: u64,
    state: BuyerState,
    committed: bool,
}

impl BuyerSession {
    pub fn new(transfer_id: impl Into<String>, reveal_deadline_ms: u64, refund_deadline_ms: u64) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            reveal_deadline_ms,
            refund_deadline_ms,
            state: BuyerState::Idle,
            committed: false,
        }
    }

    pub fn state(&self) -> BuyerState {
        self.state
    }

    /// True once the proposal has been posted — from then on the ledger
    /// outcome, not local errors, decides the transfer.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Feeds one event; returns the actions the driver must execute.
    ///
    /// Duplicate or stale deliveries (an observer replay, a deadline racing
    /// an accepted reveal) are absorbed silently; events that are illegal
    /// for the current state return [`SessionError::UnexpectedEvent`].
    pub fn on_event(&mut self, event: BuyerEvent) -> Result<Vec<BuyerAction>, SessionError> {
        use BuyerAction as A;
        use BuyerEvent as E;
        use BuyerState as S;

        if self.state.is_terminal() {
            tracing::debug!(
                transfer_id = %self.transfer_id,
                state = ?self.state,
                event = event.name(),
                "event after terminal state ignored"
            );
            return Ok(vec![]);
        }

        let (next, actions) = match (self.state, &event) {
            (S::Idle, E::RequestSent) => (S::Requested, vec![]),

            (S::Requested, E::StreamComplete { clear_root_ok: true }) => {
                (S::Proposed, vec![A::SubmitProposal])
            }
            // Wrong content committed by the seller: walk away before any
            // funds move.
            (S::Requested, E::StreamComplete { clear_root_ok: false }) => {
                (S::Aborted, vec![A::CancelReservation, A::KeepStores])
            }
            // Buyer never proposed and the window closed.
            (S::Requested, E::DeadlineFired { kind: DeadlineKind::Reveal, .. }) => {
                (S::Aborted, vec![A::CancelReservation, A::Unregister, A::KeepStores])
            }

            (S::Proposed, E::ProposalSubmitted) => {
                self.committed = true;
                (S::Proposed, vec![])
            }
            (S::Proposed, E::ProposalPostFailed) => {
                // The bytes left this process; assume the worst.
                self.committed = true;
                tracing::warn!(
                    transfer_id = %self.transfer_id,
                    "proposal POST failed; funds may be committed, awaiting ledger outcome"
                );
                (S::Proposed, vec![])
            }
            (S::Proposed, E::RevealObserved { key, ledger_time_ms })
                if *ledger_time_ms <= self.reveal_deadline_ms =>
            {
                (S::Decrypting, vec![A::Decrypt { key: *key }])
            }
            // A reveal past the deadline is no reveal at all.
            (S::Proposed, E::RevealObserved { .. }) => (S::Proposed, vec![]),
            (S::Proposed, E::DeadlineFired { kind: DeadlineKind::Reveal, .. }) => {
                // The contract's expiry clause returns the escrowed funds;
                // locally there is only cleanup.
                (S::Expired, vec![A::Unregister, A::KeepStores])
            }

            (S::Decrypting, E::DecryptFinished { bad_index: None, .. }) => {
                (S::Done, vec![A::Unregister, A::RemoveStores])
            }
            (S::Decrypting, E::DecryptFinished { bad_index: Some(i), now_ms }) => {
                if *now_ms < self.refund_deadline_ms {
                    (S::Refunding, vec![A::ClaimRefund { bad_index: *i }, A::KeepStores])
                } else {
                    (S::Lost, vec![A::Unregister, A::KeepStores])
                }
            }
            // The reveal already won its race; a trailing deadline tick is
            // noise.
            (S::Decrypting, E::DeadlineFired { kind: DeadlineKind::Reveal, .. }) => {
                (S::Decrypting, vec![])
            }
            (S::Decrypting, E::RevealObserved { .. }) => (S::Decrypting, vec![]),

            (S::Refunding, E::RefundAccepted) => (S::Refunded, vec![A::Unregister]),
            (S::Refunding, E::DeadlineFired { kind: DeadlineKind::Refund, .. }) => {
                (S::Lost, vec![A::Unregister, A::KeepStores])
            }

            (_, E::Cancelled) => {
                let mut actions = vec![A::Unregister, A::KeepStores];
                if !self.committed {
                    actions.insert(0, A::CancelReservation);
                }
                (S::Aborted, actions)
            }

            (state, event) => {
                return Err(SessionError::UnexpectedEvent {
                    state: format!("{state:?}"),
                    event: event.name().to_string(),
                })
            }
        };

        if next != self.state {
            tracing::info!(
                transfer_id = %self.transfer_id,
                from = ?self.state,
                to = ?next,
                committed = self.committed,
                "buyer transition"
            );
        }
        self.state = next;
        Ok(actions)
    }
}

// ---------------------------------------------------------------------------
// Seller
// ---------------------------------------------------------------------------

/// Seller-side transfer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellerState {
    Idle,
    /// Streaming ciphertext to the buyer.
    Serving,
    /// Stream done; waiting for the payment proposal.
    AwaitingProposal,
    /// Proposal validated; reveal-key transaction in flight.
    Revealing,
    /// Reveal confirmed; waiting out the buyer's challenge window.
    AwaitingRefundWindow,
    /// Refund window closed; claim-payment in flight.
    ClaimingPayment,
    /// Terminal: payment and collateral recovered.
    Paid,
    /// Terminal: transfer failed (invalid proposal, missed reveal, or a
    /// proven fraud claim against us).
    Aborted,
}

impl SellerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SellerState::Paid | SellerState::Aborted)
    }
}

/// Inputs to the seller machine.
#[derive(Debug, Clone)]
pub enum SellerEvent {
    ServeStarted,
    /// The chunk stream finished with these computed roots.
    StreamServed,
    /// A proposal arrived; `valid` is the outcome of parameter validation.
    ProposalReceived { valid: bool },
    RevealSubmitted,
    /// The observer saw the completed reveal transaction.
    RevealConfirmed { ledger_time_ms: u64 },
    DeadlineFired { kind: DeadlineKind, at_ms: u64 },
    /// The buyer proved fraud on-chain; payment and collateral are gone.
    RefundObserved,
    PaymentClaimed,
    Cancelled,
}

impl SellerEvent {
    fn name(&self) -> &'static str {
        match self {
            SellerEvent::ServeStarted => "ServeStarted",
            SellerEvent::StreamServed => "StreamServed",
            SellerEvent::ProposalReceived { .. } => "ProposalReceived",
            SellerEvent::RevealSubmitted => "RevealSubmitted",
            SellerEvent::RevealConfirmed { .. } => "RevealConfirmed",
            SellerEvent::DeadlineFired { .. } => "DeadlineFired",
            SellerEvent::RefundObserved => "RefundObserved",
            SellerEvent::PaymentClaimed => "PaymentClaimed",
            SellerEvent::Cancelled => "Cancelled",
        }
    }
}

/// Outputs of the seller machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SellerAction {
    /// Reserve collateral, build the reveal-key transaction, submit it.
    SubmitReveal,
    /// Register a deadline timer for the end of the refund window.
    ScheduleClaim,
    /// Build and submit the claim-payment transaction.
    SubmitClaim,
    /// Drop observer registrations for this transfer.
    Unregister,
}

/// The seller's per-transfer state machine.
#[derive(Debug)]
pub struct SellerSession {
    transfer_id: String,
    reveal_deadline_ms: u64,
    refund_deadline_ms: u64,
    state: SellerState,
}

impl SellerSession {
    pub fn new(transfer_id: impl Into<String>, reveal_deadline_ms: u64, refund_deadline_ms: u64) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            reveal_deadline_ms,
            refund_deadline_ms,
            state: SellerState::Idle,
        }
    }

    pub fn state(&self) -> SellerState {
        self.state
    }

    pub fn on_event(&mut self, event: SellerEvent) -> Result<Vec<SellerAction>, SessionError> {
        use SellerAction as A;
        use SellerEvent as E;
        use SellerState as S;

        if self.state.is_terminal() {
            tracing::debug!(
                transfer_id = %self.transfer_id,
                state = ?self.state,
                event = event.name(),
                "event after terminal state ignored"
            );
            return Ok(vec![]);
        }

        let (next, actions) = match (self.state, &event) {
            (S::Idle, E::ServeStarted) => (S::Serving, vec![]),
            (S::Serving, E::StreamServed) => (S::AwaitingProposal, vec![]),

            (S::AwaitingProposal, E::ProposalReceived { valid: true }) => {
                (S::Revealing, vec![A::SubmitReveal])
            }
            (S::AwaitingProposal, E::ProposalReceived { valid: false }) => {
                (S::Aborted, vec![A::Unregister])
            }
            // No proposal before the reveal deadline: nothing was ever at
            // stake, walk away.
            (S::AwaitingProposal, E::DeadlineFired { kind: DeadlineKind::Reveal, .. }) => {
                (S::Aborted, vec![A::Unregister])
            }

            (S::Revealing, E::RevealSubmitted) => (S::Revealing, vec![]),
            (S::Revealing, E::RevealConfirmed { ledger_time_ms })
                if *ledger_time_ms <= self.reveal_deadline_ms =>
            {
                (S::AwaitingRefundWindow, vec![A::ScheduleClaim])
            }
            // Confirmed too late: the contract's expiry clause favors the
            // buyer; the collateral merge never became effective.
            (S::Revealing, E::RevealConfirmed { .. }) => (S::Aborted, vec![A::Unregister]),
            (S::Revealing, E::DeadlineFired { kind: DeadlineKind::Reveal, at_ms }) => {
                tracing::warn!(
                    transfer_id = %self.transfer_id,
                    at_ms,
                    "reveal not confirmed before deadline"
                );
                (S::Aborted, vec![A::Unregister])
            }

            (S::AwaitingRefundWindow, E::RefundObserved) => {
                tracing::warn!(
                    transfer_id = %self.transfer_id,
                    "buyer proved fraud; payment and collateral forfeited"
                );
                (S::Aborted, vec![A::Unregister])
            }
            (S::AwaitingRefundWindow, E::DeadlineFired { kind: DeadlineKind::Refund, at_ms })
                if *at_ms >= self.refund_deadline_ms =>
            {
                (S::ClaimingPayment, vec![A::SubmitClaim])
            }
            (S::AwaitingRefundWindow, E::DeadlineFired { .. }) => {
                (S::AwaitingRefundWindow, vec![])
            }

            (S::ClaimingPayment, E::PaymentClaimed) => (S::Paid, vec![A::Unregister]),

            (_, E::Cancelled) => (S::Aborted, vec![A::Unregister]),

            (state, event) => {
                return Err(SessionError::UnexpectedEvent {
                    state: format!("{state:?}"),
                    event: event.name().to_string(),
                })
            }
        };

        if next != self.state {
            tracing::info!(
                transfer_id = %self.transfer_id,
                from = ?self.state,
                to = ?next,
                "seller transition"
            );
        }
        self.state = next;
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REVEAL: u64 = 10_000;
    const REFUND: u64 = 20_000;

    fn buyer() -> BuyerSession {
        BuyerSession::new("t-1", REVEAL, REFUND)
    }

    fn seller() -> SellerSession {
        SellerSession::new("t-1", REVEAL, REFUND)
    }

    #[test]
    fn buyer_happy_path() {
        let mut b = buyer();
        assert!(b.on_event(BuyerEvent::RequestSent).unwrap().is_empty());
        assert_eq!(b.state(), BuyerState::Requested);

        let actions = b
            .on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap();
        assert_eq!(actions, vec![BuyerAction::SubmitProposal]);
        assert_eq!(b.state(), BuyerState::Proposed);
        assert!(!b.is_committed());

        b.on_event(BuyerEvent::ProposalSubmitted).unwrap();
        assert!(b.is_committed());

        let key = [0x11; 32];
        let actions = b
            .on_event(BuyerEvent::RevealObserved { key, ledger_time_ms: 9_000 })
            .unwrap();
        assert_eq!(actions, vec![BuyerAction::Decrypt { key }]);
        assert_eq!(b.state(), BuyerState::Decrypting);

        let actions = b
            .on_event(BuyerEvent::DecryptFinished { bad_index: None, now_ms: 9_500 })
            .unwrap();
        assert!(actions.contains(&BuyerAction::RemoveStores));
        assert_eq!(b.state(), BuyerState::Done);
        assert!(b.state().is_terminal());
    }

    #[test]
    fn buyer_aborts_on_wrong_root_without_committing() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        let actions = b
            .on_event(BuyerEvent::StreamComplete { clear_root_ok: false })
            .unwrap();
        assert!(actions.contains(&BuyerAction::CancelReservation));
        assert_eq!(b.state(), BuyerState::Aborted);
        assert!(!b.is_committed());
    }

    #[test]
    fn buyer_expires_when_no_reveal_arrives() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        b.on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap();
        b.on_event(BuyerEvent::ProposalSubmitted).unwrap();

        let actions = b
            .on_event(BuyerEvent::DeadlineFired {
                kind: DeadlineKind::Reveal,
                at_ms: REVEAL,
            })
            .unwrap();
        assert_eq!(b.state(), BuyerState::Expired);
        // The contract refunds the escrow; no local reservation action.
        assert!(!actions.contains(&BuyerAction::CancelReservation));
    }

    #[test]
    fn reveal_at_deadline_millisecond_wins_over_timer() {
        // Observer ordering delivers the reveal first; the timer that fires
        // in the same tick must then be ignored.
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        b.on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap();
        b.on_event(BuyerEvent::ProposalSubmitted).unwrap();

        let key = [0x22; 32];
        b.on_event(BuyerEvent::RevealObserved { key, ledger_time_ms: REVEAL })
            .unwrap();
        assert_eq!(b.state(), BuyerState::Decrypting);

        let actions = b
            .on_event(BuyerEvent::DeadlineFired {
                kind: DeadlineKind::Reveal,
                at_ms: REVEAL,
            })
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(b.state(), BuyerState::Decrypting);
    }

    #[test]
    fn reveal_after_deadline_is_ignored() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        b.on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap();
        let actions = b
            .on_event(BuyerEvent::RevealObserved {
                key: [0; 32],
                ledger_time_ms: REVEAL + 1,
            })
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(b.state(), BuyerState::Proposed);
    }

    #[test]
    fn buyer_fraud_inside_window_claims_refund() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        b.on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap();
        b.on_event(BuyerEvent::ProposalSubmitted).unwrap();
        b.on_event(BuyerEvent::RevealObserved {
            key: [0; 32],
            ledger_time_ms: 9_000,
        })
        .unwrap();

        let actions = b
            .on_event(BuyerEvent::DecryptFinished {
                bad_index: Some(1),
                now_ms: 15_000,
            })
            .unwrap();
        assert!(actions.contains(&BuyerAction::ClaimRefund { bad_index: 1 }));
        assert!(actions.contains(&BuyerAction::KeepStores));
        assert_eq!(b.state(), BuyerState::Refunding);

        b.on_event(BuyerEvent::RefundAccepted).unwrap();
        assert_eq!(b.state(), BuyerState::Refunded);
    }

    #[test]
    fn buyer_fraud_after_window_is_lost() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        b.on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap();
        b.on_event(BuyerEvent::ProposalSubmitted).unwrap();
        b.on_event(BuyerEvent::RevealObserved {
            key: [0; 32],
            ledger_time_ms: 9_000,
        })
        .unwrap();
        b.on_event(BuyerEvent::DecryptFinished {
            bad_index: Some(0),
            now_ms: REFUND,
        })
        .unwrap();
        assert_eq!(b.state(), BuyerState::Lost);
    }

    #[test]
    fn refund_window_closing_mid_claim_is_lost() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        b.on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap();
        b.on_event(BuyerEvent::ProposalSubmitted).unwrap();
        b.on_event(BuyerEvent::RevealObserved {
            key: [0; 32],
            ledger_time_ms: 9_000,
        })
        .unwrap();
        b.on_event(BuyerEvent::DecryptFinished {
            bad_index: Some(0),
            now_ms: 15_000,
        })
        .unwrap();
        b.on_event(BuyerEvent::DeadlineFired {
            kind: DeadlineKind::Refund,
            at_ms: REFUND,
        })
        .unwrap();
        assert_eq!(b.state(), BuyerState::Lost);
    }

    #[test]
    fn cancel_before_commitment_releases_reservation() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        let actions = b.on_event(BuyerEvent::Cancelled).unwrap();
        assert_eq!(actions[0], BuyerAction::CancelReservation);
        assert_eq!(b.state(), BuyerState::Aborted);
    }

    #[test]
    fn cancel_after_commitment_keeps_funds_with_ledger() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        b.on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap();
        b.on_event(BuyerEvent::ProposalSubmitted).unwrap();
        let actions = b.on_event(BuyerEvent::Cancelled).unwrap();
        assert!(!actions.contains(&BuyerAction::CancelReservation));
    }

    #[test]
    fn proposal_post_failure_is_not_terminal() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        b.on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap();
        b.on_event(BuyerEvent::ProposalPostFailed).unwrap();
        assert_eq!(b.state(), BuyerState::Proposed);
        assert!(b.is_committed());
    }

    #[test]
    fn terminal_states_ignore_events() {
        let mut b = buyer();
        b.on_event(BuyerEvent::RequestSent).unwrap();
        b.on_event(BuyerEvent::StreamComplete { clear_root_ok: false })
            .unwrap();
        assert_eq!(b.state(), BuyerState::Aborted);

        // Late deliveries must neither transition nor error.
        assert!(b
            .on_event(BuyerEvent::RevealObserved {
                key: [0; 32],
                ledger_time_ms: 1,
            })
            .unwrap()
            .is_empty());
        assert_eq!(b.state(), BuyerState::Aborted);
    }

    #[test]
    fn illegal_event_is_reported() {
        let mut b = buyer();
        let err = b
            .on_event(BuyerEvent::StreamComplete { clear_root_ok: true })
            .unwrap_err();
        assert!(matches!(err, SessionError::UnexpectedEvent { .. }));
    }

    #[test]
    fn seller_happy_path() {
        let mut s = seller();
        s.on_event(SellerEvent::ServeStarted).unwrap();
        s.on_event(SellerEvent::StreamServed).unwrap();
        assert_eq!(s.state(), SellerState::AwaitingProposal);

        let actions = s
            .on_event(SellerEvent::ProposalReceived { valid: true })
            .unwrap();
        assert_eq!(actions, vec![SellerAction::SubmitReveal]);

        s.on_event(SellerEvent::RevealSubmitted).unwrap();
        let actions = s
            .on_event(SellerEvent::RevealConfirmed { ledger_time_ms: 9_000 })
            .unwrap();
        assert_eq!(actions, vec![SellerAction::ScheduleClaim]);
        assert_eq!(s.state(), SellerState::AwaitingRefundWindow);

        let actions = s
            .on_event(SellerEvent::DeadlineFired {
                kind: DeadlineKind::Refund,
                at_ms: REFUND,
            })
            .unwrap();
        assert_eq!(actions, vec![SellerAction::SubmitClaim]);

        s.on_event(SellerEvent::PaymentClaimed).unwrap();
        assert_eq!(s.state(), SellerState::Paid);
    }

    #[test]
    fn seller_rejects_invalid_proposal() {
        let mut s = seller();
        s.on_event(SellerEvent::ServeStarted).unwrap();
        s.on_event(SellerEvent::StreamServed).unwrap();
        s.on_event(SellerEvent::ProposalReceived { valid: false })
            .unwrap();
        assert_eq!(s.state(), SellerState::Aborted);
    }

    #[test]
    fn seller_aborts_when_buyer_stays_silent() {
        let mut s = seller();
        s.on_event(SellerEvent::ServeStarted).unwrap();
        s.on_event(SellerEvent::StreamServed).unwrap();
        s.on_event(SellerEvent::DeadlineFired {
            kind: DeadlineKind::Reveal,
            at_ms: REVEAL,
        })
        .unwrap();
        assert_eq!(s.state(), SellerState::Aborted);
    }

    #[test]
    fn seller_loses_on_observed_refund() {
        let mut s = seller();
        s.on_event(SellerEvent::ServeStarted).unwrap();
        s.on_event(SellerEvent::StreamServed).unwrap();
        s.on_event(SellerEvent::ProposalReceived { valid: true })
            .unwrap();
        s.on_event(SellerEvent::RevealSubmitted).unwrap();
        s.on_event(SellerEvent::RevealConfirmed { ledger_time_ms: 9_000 })
            .unwrap();
        s.on_event(SellerEvent::RefundObserved).unwrap();
        assert_eq!(s.state(), SellerState::Aborted);
    }

    #[test]
    fn error_taxonomy_mapping() {
        let e: SessionError = TransferError::BadClearHash { index: 3 }.into();
        assert!(matches!(e, SessionError::FraudDetected { index: 3 }));

        let e: SessionError = TransferError::TruncatedStream.into();
        assert!(matches!(e, SessionError::Transport(_)));

        let e: SessionError = TransferError::EmptyStream.into();
        assert!(matches!(e, SessionError::Protocol(_)));
    }
}
