//! Lanferry CLI - resumable file transfer over the local network
//!
//! Peers find each other by UDP broadcast; transfers survive restarts
//! and continue from the last block on disk.
//!
//! ## Quick Start
//!
//! ```bash
//! # Receive files into ~/Downloads
//! lanferry receive ~/Downloads
//!
//! # Send a file (on another device)
//! lanferry send video.mkv --to 192.168.1.7
//! ```

#![allow(clippy::doc_markdown)]

use anyhow::Result;
use clap::Parser;

mod commands;
mod config;
mod prompts;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Send(args) => commands::send::run(args).await,
        Command::Receive(args) => commands::receive::run(args).await,
        Command::Peers(args) => commands::peers::run(args).await,
        Command::Config(args) => commands::config::run(&args),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,lanferry=info,lanferry_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
