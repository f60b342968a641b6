//! SkillBridge relay daemon.
//!
//! Configuration via environment:
//! - `SKILLBRIDGE_BIND_ADDR`     — listen address (default 127.0.0.1:9090)
//! - `SKILLBRIDGE_DATA_DIR`      — RocksDB path; unset = in-memory only
//! - `SKILLBRIDGE_ROOM_CAPACITY` — max connections per room
//! - `RUST_LOG`                  — log filter (env_logger)

use std::path::PathBuf;

use log::info;
use skillbridge_relay::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    info!("Starting SkillBridge relay...");

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("SKILLBRIDGE_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(dir) = std::env::var("SKILLBRIDGE_DATA_DIR") {
        config.storage_path = Some(PathBuf::from(dir));
    }
    if let Ok(capacity) = std::env::var("SKILLBRIDGE_ROOM_CAPACITY") {
        match capacity.parse() {
            Ok(n) => config.max_members_per_room = n,
            Err(_) => log::warn!("Ignoring invalid SKILLBRIDGE_ROOM_CAPACITY: {capacity}"),
        }
    }

    let server = RelayServer::new(config);

    if let Err(e) = server.run().await {
        log::error!("Relay server terminated: {e}");
        std::process::exit(1);
    }
}
