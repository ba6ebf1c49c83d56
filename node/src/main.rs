// Copyright (c) 2026 Tessera Contributors. MIT License.
// See LICENSE for details.

//! # Tessera Node
//!
//! Entry point for the `tessera-node` binary. Parses CLI arguments,
//! initializes logging, and runs one side of a fair-exchange transfer:
//!
//! - `serve`   — the seller's HTTP server
//! - `get`     — the buyer's transfer driver
//! - `init`    — key file generation
//! - `version` — print build information

mod cli;
mod get;
mod keyfile;
mod ledger;
mod logging;
mod serve;

use anyhow::Result;
use clap::Parser;

use cli::{Commands, TesseraCli};
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TesseraCli::parse();

    match cli.command {
        Commands::Serve(args) => {
            logging::init_logging(
                "tessera_node=info,tessera_protocol=info,tessera_contracts=info",
                LogFormat::Pretty,
            );
            serve::run(args).await
        }
        Commands::Get(args) => {
            logging::init_logging(
                "tessera_node=info,tessera_protocol=info,tessera_contracts=info",
                LogFormat::Pretty,
            );
            get::run(args).await
        }
        Commands::Init(args) => {
            logging::init_logging("tessera_node=info", LogFormat::Pretty);
            let key = keyfile::generate(&args.key_file, args.force)?;
            println!("Key file written.");
            println!("  Path       : {}", args.key_file.display());
            println!("  Public key : {}", hex::encode(key.verifying_key().to_bytes()));
            Ok(())
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn print_version() {
    println!("tessera-node {}", env!("CARGO_PKG_VERSION"));
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
