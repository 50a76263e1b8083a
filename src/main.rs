//! Name-service transport node (`ns-node`).
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                      NS NODE                         │
//!                      │                                                      │
//!   send_to_id ────────┼─▶ messenger ──▶ net::transport ──▶ net::connection   │
//!                      │      │ local         (frame)        (queue, connect) │
//!                      │      ▼                                   │ wake      │
//!                      │   dispatch ◀── net::framing ◀── net::selector ◀──────┼──── peers
//!                      │   (pool)          ▲                 │               │
//!                      │      │            └── net::tls ◀────┘               │
//!                      │      ▼                                               │
//!                      │   demultiplexers (ping / echo)                       │
//!                      │                                                      │
//!                      │  config (TOML + watcher) · observability · lifecycle │
//!                      └──────────────────────────────────────────────────────┘
//! ```
//!
//! The node answers ping packets (type 1) with an echo (type 2) and pings
//! every other node in its map at startup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use ns_transport::config::watcher::NodeMapWatcher;
use ns_transport::config::{load_config, TransportConfig};
use ns_transport::dispatch::{tagged, Packet, PacketType};
use ns_transport::lifecycle::signals::wait_for_signal;
use ns_transport::messenger::{Messenger, StaticResolver};
use ns_transport::observability::{logging, metrics};

const PING: PacketType = 1;
const ECHO: PacketType = 2;

#[derive(Parser)]
#[command(name = "ns-node")]
#[command(about = "Run a name-service transport node", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node id, overriding `node.id` from the configuration
    #[arg(short, long)]
    id: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TransportConfig::default(),
    };
    if let Some(id) = cli.id {
        config.node.id = id;
    }

    logging::init_logging(&config.observability)?;
    tracing::info!(node_id = %config.node.id, "ns-node v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let resolver = Arc::new(StaticResolver::from_config(&config));
    let messenger = Messenger::start(&config, Arc::clone(&resolver))?;
    register_handlers(&messenger);

    // Keep the watcher alive until shutdown.
    let _watcher = match &cli.config {
        Some(path) => Some(watch_node_map(path, Arc::clone(&resolver))?),
        None => None,
    };

    for id in config.nodes.keys().filter(|id| **id != config.node.id) {
        let ping = tagged(PING, json!({ "from": config.node.id }));
        if let Err(e) = messenger.send_to_id(id, &ping) {
            tracing::warn!(peer_id = %id, error = %e, "Initial ping failed");
        }
    }

    wait_for_signal()?;
    messenger.stop();
    tracing::info!("Shutdown complete");
    Ok(())
}

fn register_handlers(messenger: &Messenger<Arc<StaticResolver>>) {
    let replier = messenger.clone();
    messenger.register_packet_type(
        PING,
        Arc::new(move |packet: &Packet| {
            let echo = tagged(ECHO, json!({ "from": replier.node_id(), "ping": packet.body }));
            if let Err(e) = replier.send_to_address(packet.sender, &echo) {
                tracing::warn!(peer = %packet.sender, error = %e, "Echo failed");
            }
            true
        }),
    );

    messenger.register_packet_type(
        ECHO,
        Arc::new(|packet: &Packet| {
            tracing::info!(peer = %packet.sender, from = %packet.body["from"], "Echo received");
            true
        }),
    );
}

fn watch_node_map(
    path: &std::path::Path,
    resolver: Arc<StaticResolver>,
) -> Result<notify::RecommendedWatcher, Box<dyn std::error::Error>> {
    let (watcher, mut updates) = NodeMapWatcher::new(path);
    let guard = watcher.run()?;

    std::thread::Builder::new()
        .name("ns-config".into())
        .spawn(move || {
            while let Some(nodes) = updates.blocking_recv() {
                resolver.replace(nodes);
            }
        })?;
    Ok(guard)
}
