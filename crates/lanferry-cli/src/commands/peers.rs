//! `lanferry peers` - list peers heard on the network.

use std::time::Duration;

use anyhow::Result;

use lanferry_core::discovery::DiscoveryHandler;

use crate::commands::PeersArgs;

pub async fn run(args: PeersArgs) -> Result<()> {
    let discovery = DiscoveryHandler::new().await?;
    discovery.start()?;

    println!("Listening for {} seconds...", args.wait);
    tokio::time::sleep(Duration::from_secs(args.wait)).await;

    discovery.stop();
    let peers = discovery.peers().snapshot();
    discovery.close();

    if peers.is_empty() {
        println!("No peers found.");
    } else {
        for peer in peers {
            println!("{}", peer.addr);
        }
    }
    Ok(())
}
