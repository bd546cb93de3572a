//! `lanferry send` - push files to a peer.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use lanferry_core::node::{Node, NodeOptions};
use lanferry_core::transfer::{Transfer, TransferState};
use lanferry_core::ui::FilePicker;

use crate::commands::SendArgs;
use crate::config::Config;
use crate::prompts::ArgsPicker;

pub async fn run(args: SendArgs) -> Result<()> {
    let config = Config::load()?;
    let password = args.password.or(config.password).unwrap_or_default();

    let picker = ArgsPicker::for_send(args.files);
    let files = picker.pick_send_files().context("no files to send")?;
    for file in &files {
        if !file.is_file() {
            bail!("{} is not a file", file.display());
        }
    }

    let root = config
        .receive_root
        .map_or_else(std::env::current_dir, Ok)?;
    let node = Node::bind(
        NodeOptions::new(root)
            .with_password(password)
            .with_port(0),
    )
    .await?;
    node.start().context("starting node")?;

    let peer = match args.to {
        Some(peer) => peer,
        None => discover_single_peer(&node).await?,
    };

    let mut failed = false;
    for file in files {
        println!("Sending {} to {peer}...", file.display());
        match node.send_file(peer, args.port, &file).await {
            Ok(transfer) => match wait_terminal(&transfer).await {
                TransferState::Completed => println!("  done"),
                state => {
                    eprintln!("  ended in {state:?}");
                    failed = true;
                }
            },
            Err(e) => {
                eprintln!("  failed: {e}");
                failed = true;
            }
        }
    }

    node.stop();
    if failed {
        bail!("one or more transfers did not complete");
    }
    Ok(())
}

async fn wait_terminal(transfer: &Arc<Transfer>) -> TransferState {
    let mut rx = transfer.watch_state();
    loop {
        let state = *rx.borrow();
        if state.is_terminal() {
            return state;
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

/// Wait for broadcasts and return the single peer on the network.
async fn discover_single_peer(node: &Node) -> Result<Ipv4Addr> {
    println!("Looking for peers...");
    let peers = node.peers();
    let mut rx = peers.watch();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    loop {
        let snapshot = rx.borrow().clone();
        match snapshot.len() {
            0 => {}
            1 => return Ok(snapshot[0].addr),
            _ => {
                let addrs: Vec<String> =
                    snapshot.iter().map(|p| p.addr.to_string()).collect();
                bail!(
                    "several peers found ({}); pick one with --to",
                    addrs.join(", ")
                );
            }
        }

        if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
            bail!("no peers found; is the receiver running?");
        }
    }
}
