//! In-memory handoff demonstration
//!
//! A host registers with a [`MemoryNetwork`] broker, a guest discovers it and
//! opens a direct session. With `--deny` the host only admits a node that
//! never shows up, so the guest's attempt is turned away.

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use tether::store::{USER_ID_KEY, WHITELIST_KEY};
use tether::{Coordinator, IdentityStore, MemoryNetwork, MemoryStore, TetherConfig};
use tracing::info;

const HOST: &str = "host";
const GUEST: &str = "guest";

/// Demo options
#[derive(Args)]
pub struct DemoCommand {
    /// Host only admits `alice`, so the guest is rejected
    #[arg(long)]
    pub deny: bool,
}

fn demo_node(network: &MemoryNetwork, id: &'static str, whitelist: &str) -> Result<Coordinator> {
    let store = MemoryStore::with_entries([(USER_ID_KEY, id), (WHITELIST_KEY, whitelist)]);
    let config = TetherConfig {
        broker_address: Some("http://broker.memory".to_string()),
        ..TetherConfig::default()
    };
    let coordinator = Coordinator::new(
        &config,
        Arc::new(network.clone()),
        Arc::new(network.clone()),
        IdentityStore::new(Arc::new(store)),
    )?;

    coordinator.on_connected(move |remote| println!("[{id}] connected to {remote}"));
    coordinator.on_data(move |remote, data| {
        println!("[{id}] {remote} says: {}", String::from_utf8_lossy(data));
    });
    coordinator.on_peer_disconnect(move |remote| println!("[{id}] {remote} disconnected"));
    coordinator.on_broker_disconnect(move || println!("[{id}] lost the broker"));
    Ok(coordinator)
}

fn show_phase(node: &Coordinator, id: &str) {
    println!("[{id}] phase: {}", node.phase());
}

/// Run the demonstration
pub async fn run(cmd: DemoCommand) -> Result<()> {
    info!(deny = cmd.deny, "Starting in-memory handoff demo");
    let network = MemoryNetwork::new();
    let host = demo_node(&network, HOST, if cmd.deny { "alice" } else { "*" })?;
    let guest = demo_node(&network, GUEST, "*")?;

    let peers = host.connect_to_broker().await.context("host registration")?;
    println!("[{HOST}] registered, active peers: {peers:?}");
    let peers = guest.connect_to_broker().await.context("guest registration")?;
    println!("[{GUEST}] registered, active peers: {peers:?}");
    show_phase(&host, HOST);

    let target = match peers.first() {
        Some(target) => target.clone(),
        None => {
            println!("[{GUEST}] {HOST} is hidden by its whitelist, trying anyway");
            HOST.to_string()
        }
    };
    guest.connect_to_peer(&target).await.context("guest connect")?;
    host.process_pending().await;
    guest.process_pending().await;
    show_phase(&host, HOST);
    show_phase(&guest, GUEST);

    guest.send("hello from the guest").await?;
    host.process_pending().await;
    host.send("welcome").await?;
    guest.process_pending().await;

    if !cmd.deny {
        guest.close_peer().await;
        host.process_pending().await;
    }

    show_phase(&host, HOST);
    show_phase(&guest, GUEST);
    let ids = host.peer_ids()?;
    println!(
        "[{HOST}] last peer: {}",
        ids.other.as_deref().unwrap_or("none")
    );
    println!(
        "[{HOST}] broker registered: {}",
        network.is_registered(HOST)
    );
    Ok(())
}
