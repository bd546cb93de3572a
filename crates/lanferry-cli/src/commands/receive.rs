//! `lanferry receive` - accept incoming transfers until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};

use lanferry_core::node::{Node, NodeOptions};
use lanferry_core::ui::{AcceptAll, FilePicker, UserPrompts};

use crate::commands::ReceiveArgs;
use crate::config::Config;
use crate::prompts::{ArgsPicker, ConsolePrompts};

pub async fn run(args: ReceiveArgs) -> Result<()> {
    let config = Config::load()?;

    let picker = ArgsPicker::for_receive(args.root.or(config.receive_root));
    let root = picker
        .pick_receive_dir()
        .context("no receive folder; pass one or set receive_root in the config")?;
    tokio::fs::create_dir_all(&root)
        .await
        .with_context(|| format!("creating {}", root.display()))?;

    let password = args.password.or(config.password).unwrap_or_default();
    let prompts: Arc<dyn UserPrompts> = if args.yes {
        Arc::new(AcceptAll)
    } else {
        Arc::new(ConsolePrompts)
    };

    let announce = !args.no_announce && config.announce;
    let node = Node::bind(
        NodeOptions::new(&root)
            .with_password(password)
            .with_port(args.port)
            .with_prompts(prompts)
            .with_announce(announce),
    )
    .await?;
    node.start().context("starting node")?;

    println!(
        "{} receiving into {} on port {}{}. Press Ctrl-C to stop.",
        config.device_name,
        root.display(),
        node.local_addr().port(),
        if announce { "" } else { " (not announcing)" }
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    println!("Stopping...");
    node.stop();
    Ok(())
}
