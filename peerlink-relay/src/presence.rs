//! Online Presence Registry
//!
//! One entry per logged-in identity, holding the write handle of the owning
//! connection plus the advertised datagram endpoint. A second login for the
//! same identity replaces the entry; the evicted connection keeps running
//! but can no longer act for that identity.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use peerlink_core::ServerFrame;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    /// Identifies which connection owns this login.
    pub conn_id: u64,
    /// Queue into the owning connection's write loop.
    pub sender: UnboundedSender<ServerFrame>,
    /// Address the connection came from, handed to peers for direct dials.
    pub ip: IpAddr,
    /// UDP port the client reported at login.
    pub p2p_port: u16,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    online: RwLock<HashMap<String, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `entry` for `username`. Returns the evicted previous entry
    /// when this login replaced an existing one.
    pub fn add_or_replace(&self, username: &str, entry: PresenceEntry) -> Option<PresenceEntry> {
        self.online
            .write()
            .unwrap()
            .insert(username.to_string(), entry)
    }

    /// Removes the entry only while `conn_id` still owns it, so a
    /// connection evicted by a re-login cannot tear down its successor.
    pub fn remove_if_owner(&self, username: &str, conn_id: u64) -> bool {
        let mut online = self.online.write().unwrap();
        if online.get(username).is_some_and(|e| e.conn_id == conn_id) {
            online.remove(username);
            true
        } else {
            false
        }
    }

    pub fn lookup(&self, username: &str) -> Option<PresenceEntry> {
        self.online.read().unwrap().get(username).cloned()
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.online.read().unwrap().contains_key(username)
    }

    /// Snapshot of every identity currently online, in no particular order.
    pub fn list_identities(&self) -> Vec<String> {
        self.online.read().unwrap().keys().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.online.read().unwrap().len()
    }
}
