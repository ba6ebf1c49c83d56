//! # Ledger HTTP Client
//!
//! Talks to the ledger server's REST interface:
//!
//! | Method | Path            | Description                                |
//! |--------|-----------------|--------------------------------------------|
//! | GET    | `/height`       | Latest block height (JSON integer)         |
//! | GET    | `/blocks/{h}`   | Block at height `h`, with per-tx logs      |
//! | POST   | `/submit`       | Submit a transaction program               |
//! | POST   | `/inspect`      | Execute a program to the finalize barrier  |
//! |        |                 | in inspection mode; returns its log        |
//!
//! Committed blocks carry each transaction's execution log, so observing
//! never requires local execution; `/inspect` covers the one place a party
//! must look inside a program it has not submitted — the seller validating
//! a buyer's proposal.

use async_trait::async_trait;

use tessera_protocol::observer::{Block, CommittedTx, LedgerClient, LogParser, ObserverError};
use tessera_protocol::types::LogValue;

/// HTTP implementation of the ledger interface.
#[derive(Debug, Clone)]
pub struct HttpLedger {
    base: String,
    client: reqwest::Client,
}

impl HttpLedger {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Executes a program in inspection mode and returns its log, or
    /// `None` when the ledger rejects the program as unexecutable.
    pub async fn inspect(&self, program: &[u8]) -> Result<Option<Vec<LogValue>>, ObserverError> {
        let response = self
            .client
            .post(format!("{}/inspect", self.base))
            .body(program.to_vec())
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let log = response.json().await.map_err(transport)?;
        Ok(Some(log))
    }
}

fn transport(e: reqwest::Error) -> ObserverError {
    ObserverError::Client(e.to_string())
}

#[async_trait]
impl LedgerClient for HttpLedger {
    async fn latest_height(&self) -> Result<u64, ObserverError> {
        let response = self
            .client
            .get(format!("{}/height", self.base))
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;
        response.json().await.map_err(transport)
    }

    async fn block(&self, height: u64) -> Result<Block, ObserverError> {
        let response = self
            .client
            .get(format!("{}/blocks/{height}", self.base))
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;
        response.json().await.map_err(transport)
    }

    async fn submit(&self, program: &[u8]) -> Result<(), ObserverError> {
        let response = self
            .client
            .post(format!("{}/submit", self.base))
            .body(program.to_vec())
            .send()
            .await
            .map_err(transport)?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ObserverError::Rejected(format!("{status}: {body}")))
        }
    }
}

/// The observer's log parser: scan each committed transaction's recorded
/// log for an escrow contract call.
pub fn escrow_log_parser() -> LogParser {
    std::sync::Arc::new(|tx: &CommittedTx| tessera_contracts::log::scan_log(&tx.log))
}
