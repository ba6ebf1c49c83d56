//! # CLI Interface
//!
//! Command-line argument structure for `tessera-node` using `clap` derive.
//! Two working subcommands — `serve` for the seller, `get` for the buyer —
//! plus `init` for key generation and `version`. Every configurable value
//! has an environment-variable fallback for container deployment.
//!
//! Deadlines are given as durations relative to observed ledger time
//! (`--reveal 30s --refund 60s`), not absolute timestamps; the driver
//! resolves them against the observer's clock before anything goes on the
//! wire.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use tessera_protocol::config::DEFAULT_SERVE_ADDR;
use tessera_protocol::types::Hash32;

/// Tessera fair-exchange node.
///
/// Runs either side of a transfer: the seller's HTTP server streaming
/// encrypted chunks, or the buyer's driver requesting content, escrowing
/// payment, and settling through the ledger.
#[derive(Parser, Debug)]
#[command(name = "tessera-node", about = "Tessera fair-exchange node", version)]
pub struct TesseraCli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the seller: serve one content file over HTTP.
    Serve(ServeArgs),
    /// Run the buyer: fetch a file by clear root and pay for it.
    Get(GetArgs),
    /// Generate a fresh Ed25519 key file.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `serve` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Bind address for the seller's HTTP server.
    #[arg(long, env = "TESSERA_ADDR", default_value = DEFAULT_SERVE_ADDR)]
    pub addr: String,

    /// The content file offered for sale.
    #[arg(long, env = "TESSERA_CONTENT")]
    pub content: PathBuf,

    /// Price per transfer, in the smallest unit of the asset.
    #[arg(long, env = "TESSERA_AMOUNT")]
    pub amount: u64,

    /// Asset id (64 hex chars) payments must be denominated in.
    #[arg(long, env = "TESSERA_ASSET")]
    pub asset: String,

    /// File holding the seller's raw 64-byte Ed25519 keypair.
    #[arg(long, env = "TESSERA_KEY_FILE", default_value = "tessera.key")]
    pub key_file: PathBuf,

    /// Directory for the node's embedded state database.
    #[arg(long, env = "TESSERA_DB", default_value = "tessera-seller-db")]
    pub db: PathBuf,

    /// Base URL of the ledger server.
    #[arg(long, env = "TESSERA_LEDGER_URL")]
    pub ledger: String,

    /// Devnet stand-in for a wallet: comma-separated output amounts the
    /// seller can pledge as collateral.
    #[arg(long, env = "TESSERA_FUNDS", default_value = "1000")]
    pub funds: String,
}

/// Arguments for the `get` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct GetArgs {
    /// Clear-chunk Merkle root of the requested file (64 hex chars).
    #[arg(long)]
    pub hash: String,

    /// Payment amount to propose.
    #[arg(long)]
    pub amount: u64,

    /// Asset id of the proposed payment (64 hex chars).
    #[arg(long)]
    pub asset: String,

    /// Time until the reveal deadline, e.g. "30s" or "5m".
    #[arg(long)]
    pub reveal: String,

    /// Time from the reveal deadline until the refund deadline.
    #[arg(long)]
    pub refund: String,

    /// Base URL of the seller's server.
    #[arg(long, env = "TESSERA_SERVER_URL")]
    pub server: String,

    /// Base URL of the ledger server.
    #[arg(long, env = "TESSERA_LEDGER_URL")]
    pub ledger: String,

    /// File holding the buyer's raw 64-byte Ed25519 keypair.
    #[arg(long, env = "TESSERA_KEY_FILE", default_value = "tessera.key")]
    pub key_file: PathBuf,

    /// Directory for the node's embedded state database.
    #[arg(long, env = "TESSERA_DB", default_value = "tessera-buyer-db")]
    pub db: PathBuf,

    /// Root directory for transfer files: chunk stores while in flight,
    /// the decrypted output on completion.
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Devnet stand-in for a wallet: comma-separated output amounts the
    /// buyer can spend.
    #[arg(long, env = "TESSERA_FUNDS", default_value = "1000")]
    pub funds: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct InitArgs {
    /// Where to write the key file.
    #[arg(long, default_value = "tessera.key")]
    pub key_file: PathBuf,

    /// Overwrite an existing key file. This destroys the old identity.
    #[arg(long)]
    pub force: bool,
}

/// Parses a 32-byte hex value (roots, asset ids).
pub fn parse_hash32(s: &str) -> anyhow::Result<Hash32> {
    let bytes = hex::decode(s.trim())?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes of hex, got {}", bytes.len()))
}

/// Parses a short duration string: `500ms`, `45s`, `10m`, `2h`.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("duration {s:?} is missing a unit"))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse()?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000,
        "m" => value * 60_000,
        "h" => value * 3_600_000,
        other => anyhow::bail!("unknown duration unit {other:?}"),
    };
    Ok(Duration::from_millis(millis))
}

/// Parses the `--funds` devnet flag: comma-separated output amounts.
pub fn parse_funds(s: &str) -> anyhow::Result<Vec<u64>> {
    s.split(',')
        .map(|part| {
            part.trim()
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("bad amount {part:?}: {e}"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
