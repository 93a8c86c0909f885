//! Standalone relay: one authoritative document per room, fan-out to peers.
//!
//! Usage: `blockweave-relay [BIND_ADDR]`. The address falls back to
//! `BLOCKWEAVE_BIND`, then to the server default.

use blockweave_collab::server::{ServerConfig, SyncServer};
use log::info;

const BIND_ENV: &str = "BLOCKWEAVE_BIND";

fn bind_addr(arg: Option<String>, env: Option<String>) -> String {
    arg.or(env)
        .filter(|addr| !addr.trim().is_empty())
        .unwrap_or_else(|| ServerConfig::default().bind_addr)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig {
        bind_addr: bind_addr(std::env::args().nth(1), std::env::var(BIND_ENV).ok()),
        ..ServerConfig::default()
    };
    info!(
        "Starting blockweave relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    SyncServer::new(config).run().await
}
