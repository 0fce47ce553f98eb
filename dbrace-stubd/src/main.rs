//! dbrace-stubd: fixture document server for dbrace scenarios.
//!
//! Serves newline-delimited JSON requests on a TCP port, keeps documents in
//! memory, and persists them to data files at shutdown. With `--dur` every
//! write is journaled and group-committed so a hard kill can be recovered.
//!
//! Exit codes: 12 after SIGTERM/SIGINT, 48 when the port cannot be bound.

#![forbid(unsafe_code)]

mod datafiles;
mod error;
mod journal;
mod matcher;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use store::Store;

/// Exit code after an interrupt-driven shutdown.
const EXIT_INTERRUPTED: i32 = 12;
/// Exit code when the listen address is unavailable.
const EXIT_BIND_FAILED: i32 = 48;

#[derive(Parser, Debug)]
#[command(name = "dbrace-stubd")]
#[command(author, version, about = "dbrace fixture document server")]
struct Cli {
    /// TCP port to listen on
    #[arg(long)]
    port: u16,

    /// Data directory
    #[arg(long)]
    dbpath: PathBuf,

    /// Enable journaling
    #[arg(long)]
    dur: bool,

    /// Journal group-commit interval in milliseconds
    #[arg(long, default_value = "100")]
    group_commit_ms: u64,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let durable = cli
        .dur
        .then(|| Duration::from_millis(cli.group_commit_ms.max(1)));
    let store = Arc::new(
        Store::open(&cli.dbpath, durable)
            .with_context(|| format!("opening data directory {}", cli.dbpath.display()))?,
    );

    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot listen on {addr}: {e}");
            std::process::exit(EXIT_BIND_FAILED);
        }
    };
    info!(
        pid = std::process::id(),
        durable = store.is_durable(),
        "waiting for connections on {addr}"
    );

    let received = tokio::select! {
        _ = server::serve(listener, Arc::clone(&store)) => "listener closed",
        _ = terminate.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    };
    info!("got {received}, shutting down");

    tokio::task::spawn_blocking(move || store.shutdown()).await??;
    info!("shutdown complete");
    std::process::exit(EXIT_INTERRUPTED);
}
