//! Command definitions and dispatch.

pub mod config;
pub mod peers;
pub mod receive;
pub mod send;

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Resumable file transfer over the local network.
#[derive(Debug, Parser)]
#[command(name = "lanferry", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send files to a peer
    Send(SendArgs),
    /// Receive files into a folder
    Receive(ReceiveArgs),
    /// List peers currently broadcasting on the network
    Peers(PeersArgs),
    /// Show configuration and its location
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Files to send
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Peer address; discovered automatically when omitted and exactly
    /// one peer is on the network
    #[arg(long)]
    pub to: Option<Ipv4Addr>,

    /// Peer TCP port
    #[arg(long, default_value_t = lanferry_core::TRANSFER_PORT)]
    pub port: u16,

    /// Password expected by the receiver
    #[arg(long)]
    pub password: Option<String>,
}

#[derive(Debug, Args)]
pub struct ReceiveArgs {
    /// Folder received files land in; falls back to the configured
    /// default
    pub root: Option<PathBuf>,

    /// Require senders to present this password
    #[arg(long)]
    pub password: Option<String>,

    /// TCP port to listen on
    #[arg(long, default_value_t = lanferry_core::TRANSFER_PORT)]
    pub port: u16,

    /// Accept every transfer and rename on conflicts without asking
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Collect peers without broadcasting this device's presence
    #[arg(long)]
    pub no_announce: bool,
}

#[derive(Debug, Args)]
pub struct PeersArgs {
    /// How long to listen for broadcasts, in seconds
    #[arg(long, default_value_t = 5)]
    pub wait: u64,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Write the current defaults back to disk, creating the file
    #[arg(long)]
    pub init: bool,
}
