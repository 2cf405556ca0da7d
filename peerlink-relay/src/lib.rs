//! Peerlink Relay Server
//!
//! Account directory, presence tracking, and frame forwarding for peerlink
//! clients. One tokio task per connection; dispatch itself is synchronous
//! and all writes go through per-connection queues, so a slow client never
//! stalls another connection.

pub mod config;
pub mod directory;
pub mod handler;
pub mod presence;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use config::RelayConfig;
use directory::Directory;
use presence::PresenceRegistry;

/// State shared by every connection task.
pub struct RelayState {
    pub config: RelayConfig,
    pub presence: PresenceRegistry,
    pub directory: Arc<dyn Directory>,
    next_conn_id: AtomicU64,
}

impl RelayState {
    pub fn new(config: RelayConfig, directory: Arc<dyn Directory>) -> Self {
        RelayState {
            config,
            presence: PresenceRegistry::new(),
            directory,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    /// Binds the listener without accepting yet, so tests can read the
    /// bound address before spawning [`run`](Self::run).
    pub async fn bind(config: RelayConfig, directory: Arc<dyn Directory>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let state = Arc::new(RelayState::new(config, directory));
        Ok(Relay { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever. Individual handler failures never take
    /// the accept loop down.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!("new connection from {addr}");
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        handler::handle_connection(state, stream, addr).await;
                        info!("connection closed: {addr}");
                    });
                }
                Err(e) => error!("accept failed: {e}"),
            }
        }
    }
}
