//! # Ledger Observer
//!
//! Watches the ledger so the rest of the engine never has to. The observer
//! polls for new blocks, keeps an authoritative "now" derived from block
//! timestamps (never the wall clock — the contract's deadlines are ledger
//! time), dispatches matching transactions to registered callbacks, and
//! fires deadline callbacks against ledger time.
//!
//! Callback registration is a relation, not an event-loop hook: the
//! observer holds `(anchor, expires_at, callback)` entries, and on a match
//! it removes the entry and delivers the event exactly once. Registrants
//! must still tolerate duplicates — a reorged ledger can replay history.
//!
//! Within one observed block, transaction callbacks run before deadline
//! callbacks. That ordering is the tie-break for a key revealed in the same
//! tick its deadline passes: the reveal's ledger timestamp is authoritative.
//!
//! The highest processed block height is persisted in sled, so a restarted
//! process resumes from where it left off instead of re-scanning from
//! genesis.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::{hex32, Hash32, LogValue, ParsedTransfer};

/// Errors from ledger interaction and observation.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// Transport failure talking to the ledger.
    #[error("ledger client error: {0}")]
    Client(String),

    /// The ledger refused a submitted transaction.
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// No block has been observed yet, so ledger time is unknown.
    #[error("ledger time not yet observed")]
    NoLedgerTime,

    #[error("observer store error: {0}")]
    Db(#[from] sled::Error),
}

// ---------------------------------------------------------------------------
// Ledger Interface
// ---------------------------------------------------------------------------

/// A transaction committed to the ledger, with the execution log the
/// validating chain recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedTx {
    pub program: Vec<u8>,
    pub log: Vec<LogValue>,
}

/// One ledger block. Heights start at 1; height 0 means "nothing yet".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    /// Block timestamp, milliseconds since epoch. The observer's notion of
    /// "now".
    pub timestamp_ms: u64,
    pub txs: Vec<CommittedTx>,
}

/// The ledger, by interface only: submit transactions, read blocks.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn latest_height(&self) -> Result<u64, ObserverError>;
    async fn block(&self, height: u64) -> Result<Block, ObserverError>;
    async fn submit(&self, program: &[u8]) -> Result<(), ObserverError>;
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Event delivered to a transfer watch.
#[derive(Debug, Clone)]
pub struct TxEvent {
    pub parsed: ParsedTransfer,
    /// Timestamp of the block carrying the transaction.
    pub ledger_time_ms: u64,
    pub height: u64,
}

/// Extracts a [`ParsedTransfer`] from a committed transaction, if its log
/// contains a call into the escrow contract. Injected so the observer stays
/// free of contract knowledge.
pub type LogParser = Arc<dyn Fn(&CommittedTx) -> Option<ParsedTransfer> + Send + Sync>;

type TxCallback = Box<dyn FnOnce(TxEvent) + Send>;
type TimerCallback = Box<dyn FnOnce(u64) + Send>;

/// Handle for cancelling a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationId(u64);

struct Watch {
    id: u64,
    anchor1: Hash32,
    expires_at_ms: u64,
    notify: TxCallback,
}

struct Timer {
    id: u64,
    at_ms: u64,
    notify: TimerCallback,
}

#[derive(Default)]
struct Registry {
    watches: Vec<Watch>,
    timers: Vec<Timer>,
}

const CURSOR_KEY: &[u8] = b"last_processed_height";

struct Inner<C> {
    client: C,
    parser: LogParser,
    cursor: sled::Tree,
    poll_interval: Duration,
    registry: Mutex<Registry>,
    now_ms: AtomicU64,
    next_id: AtomicU64,
}

/// The polling observer. Cheap to clone; all clones share one registry and
/// one cursor.
pub struct Observer<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Observer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: LedgerClient> Observer<C> {
    pub fn new(
        client: C,
        db: &sled::Db,
        parser: LogParser,
        poll_interval: Duration,
    ) -> Result<Self, ObserverError> {
        let cursor = db.open_tree("observer")?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                parser,
                cursor,
                poll_interval,
                registry: Mutex::new(Registry::default()),
                now_ms: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Current ledger time. Errors until the first block is observed.
    pub fn now_ms(&self) -> Result<u64, ObserverError> {
        match self.inner.now_ms.load(Ordering::Acquire) {
            0 => Err(ObserverError::NoLedgerTime),
            t => Ok(t),
        }
    }

    /// Highest block height processed (persisted across restarts).
    pub fn height(&self) -> Result<u64, ObserverError> {
        Ok(self
            .inner
            .cursor
            .get(CURSOR_KEY)?
            .and_then(|raw| raw.as_ref().try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0))
    }

    /// Registers a transaction watch. The callback fires at most once, for
    /// the first committed transaction whose parsed log carries `anchor1`;
    /// the entry is dropped unfired once ledger time passes
    /// `expires_at_ms`.
    pub fn watch_transfer(
        &self,
        anchor1: Hash32,
        expires_at_ms: u64,
        notify: impl FnOnce(TxEvent) + Send + 'static,
    ) -> RegistrationId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.registry.lock().watches.push(Watch {
            id,
            anchor1,
            expires_at_ms,
            notify: Box::new(notify),
        });
        tracing::debug!(anchor1 = %hex32(&anchor1), expires_at_ms, "transfer watch registered");
        RegistrationId(id)
    }

    /// Schedules a callback for when ledger time reaches `at_ms`.
    pub fn enqueue_deadline(
        &self,
        at_ms: u64,
        notify: impl FnOnce(u64) + Send + 'static,
    ) -> RegistrationId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.registry.lock().timers.push(Timer {
            id,
            at_ms,
            notify: Box::new(notify),
        });
        RegistrationId(id)
    }

    /// Removes a watch or deadline registration. Removing an
    /// already-delivered registration is a no-op.
    pub fn unregister(&self, id: RegistrationId) {
        let mut registry = self.inner.registry.lock();
        registry.watches.retain(|w| w.id != id.0);
        registry.timers.retain(|t| t.id != id.0);
    }

    /// Processes one block: advances ledger time, dispatches matching
    /// transaction callbacks, then due deadline callbacks, then prunes
    /// expired watches, then persists the cursor.
    pub fn process_block(&self, block: &Block) -> Result<(), ObserverError> {
        let now = block.timestamp_ms;
        self.inner.now_ms.store(now, Ordering::Release);

        for tx in &block.txs {
            let Some(parsed) = (self.inner.parser)(tx) else {
                continue;
            };
            let matched: Vec<Watch> = {
                let mut registry = self.inner.registry.lock();
                let mut matched = Vec::new();
                let mut i = 0;
                while i < registry.watches.len() {
                    if registry.watches[i].anchor1 == parsed.anchor1 {
                        matched.push(registry.watches.remove(i));
                    } else {
                        i += 1;
                    }
                }
                matched
            };
            // Deliver outside the lock; callbacks may re-register.
            for watch in matched {
                tracing::debug!(
                    anchor1 = %hex32(&parsed.anchor1),
                    height = block.height,
                    "transfer watch fired"
                );
                (watch.notify)(TxEvent {
                    parsed: parsed.clone(),
                    ledger_time_ms: now,
                    height: block.height,
                });
            }
        }

        let due: Vec<Timer> = {
            let mut registry = self.inner.registry.lock();
            let mut due = Vec::new();
            let mut i = 0;
            while i < registry.timers.len() {
                if registry.timers[i].at_ms <= now {
                    due.push(registry.timers.remove(i));
                } else {
                    i += 1;
                }
            }
            due.sort_by_key(|t| t.at_ms);
            registry.watches.retain(|w| w.expires_at_ms >= now);
            due
        };
        for timer in due {
            (timer.notify)(now);
        }

        self.inner
            .cursor
            .insert(CURSOR_KEY, &block.height.to_be_bytes())?;
        self.inner.cursor.flush()?;
        Ok(())
    }

    /// One poll: fetch and process every block past the cursor.
    pub async fn poll_once(&self) -> Result<(), ObserverError> {
        let latest = self.inner.client.latest_height().await?;
        let mut next = self.height()? + 1;
        while next <= latest {
            let block = self.inner.client.block(next).await?;
            self.process_block(&block)?;
            next += 1;
        }
        Ok(())
    }

    /// Polls until cancelled. Transient client errors are logged and
    /// retried on the next tick rather than tearing the observer down.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
            if let Err(e) = self.poll_once().await {
                tracing::warn!("ledger poll failed: {e}");
            }
        }
    }

    /// Blocks until ledger time is known (first block observed) or the
    /// token is cancelled.
    pub async fn wait_for_ledger_time(&self, cancel: &CancellationToken) -> Result<u64, ObserverError> {
        loop {
            if let Ok(now) = self.now_ms() {
                return Ok(now);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ObserverError::NoLedgerTime),
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
    }

    /// Submits a transaction once.
    pub async fn submit(&self, program: &[u8]) -> Result<(), ObserverError> {
        self.inner.client.submit(program).await
    }

    /// Submits with linear backoff. Gives up after `tries` attempts or once
    /// ledger time gets within reach of `give_up_at_ms`, whichever comes
    /// first — a refund submitted after its deadline is worthless.
    pub async fn submit_with_retry(
        &self,
        program: &[u8],
        tries: u32,
        backoff: Duration,
        give_up_at_ms: Option<u64>,
    ) -> Result<(), ObserverError> {
        let mut last = None;
        for attempt in 1..=tries {
            if let (Some(limit), Ok(now)) = (give_up_at_ms, self.now_ms()) {
                if now >= limit {
                    tracing::warn!(limit, now, "giving up submission: deadline too close");
                    break;
                }
            }
            match self.inner.client.submit(program).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, tries, "submission failed: {e}");
                    last = Some(e);
                }
            }
            if attempt < tries {
                tokio::time::sleep(backoff).await;
            }
        }
        Err(last.unwrap_or(ObserverError::Rejected("no attempts made".into())))
    }
}
