//! Board relay binary.
//!
//! Usage: `board-relay [ADDR]`. The address falls back to `BOARD_RELAY_ADDR`,
//! then to `127.0.0.1:9090`. Log level follows `RUST_LOG` (default `info`).

use board_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BOARD_RELAY_ADDR").ok())
    {
        config.bind_addr = addr;
    }

    let relay = RelayServer::new(config);
    relay.run().await
}
