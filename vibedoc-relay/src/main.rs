//! Vibedoc relay — standalone WebSocket relay for collaborative documents.
//!
//! Usage: `vibedoc-relay [BIND_ADDR]`. Without an argument the address
//! comes from `VIBEDOC_RELAY_ADDR` (default `127.0.0.1:1234`). Log level
//! follows `RUST_LOG`.

use log::info;
use vibedoc_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::from_env();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }

    info!(
        "Starting Vibedoc relay on {} (max {} peers per room, heartbeat {}s)...",
        config.bind_addr, config.max_peers_per_room, config.heartbeat_interval_secs
    );

    if let Err(e) = RelayServer::new(config).run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
