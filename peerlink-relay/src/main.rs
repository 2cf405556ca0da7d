//! Peerlink Relay Server
//!
//! Runs the relay with the in-memory directory. Verification codes are
//! written to the log instead of being emailed.

use std::sync::Arc;

use tracing::info;

use peerlink_relay::config::RelayConfig;
use peerlink_relay::directory::MemoryDirectory;
use peerlink_relay::Relay;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("peerlink_relay=info".parse().unwrap()),
        )
        .init();

    let config = RelayConfig::from_env();
    info!("Starting Peerlink Relay Server");
    info!("Listening on {}", config.listen_addr);

    let directory = Arc::new(MemoryDirectory::new(config.code_ttl));
    let relay = Relay::bind(config, directory)
        .await
        .expect("Failed to bind listener");
    relay.run().await;
}
