//! Replica server binary.
//!
//! Startup: parse arguments, install logging, load and validate the
//! config, register the signal flag, open the replica, run the event
//! loop. Exit code 0 on a signal-driven drain; non-zero with a
//! descriptive error on any startup failure.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use driftchat_server::{NodeConfig, Server};
use driftchat_types::{OpNumber, RoomId};
use driftchat_vsr::CommitSink;
use driftchat_wire::ChatMessage;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "driftchat-server", about = "driftchat replica server")]
struct Args {
    /// Path to the node configuration file.
    #[arg(long, short)]
    config: PathBuf,

    /// Override the data directory from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "driftchat_vsr=debug".
    #[arg(long, default_value = "info")]
    log_filter: String,
}

/// Commit fan-out stub: logs each committed operation. The pub/sub bus
/// plugs in here.
struct LogSink;

impl CommitSink for LogSink {
    fn on_commit(&mut self, room_id: RoomId, op: OpNumber, message: &ChatMessage) {
        tracing::info!(
            room = %room_id,
            op = %op,
            msg_id = %message.msg_id,
            author = %message.author_id,
            "committed"
        );
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_filter).context("invalid --log-filter expression")?,
        )
        .init();

    let mut config = NodeConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
        config.validate().context("validating config overrides")?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("registering SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("registering SIGTERM handler")?;

    let mut server =
        Server::new(config, shutdown, Box::new(LogSink)).context("starting server")?;
    server.run().context("event loop failed")?;

    tracing::info!("shutdown complete");
    Ok(())
}
