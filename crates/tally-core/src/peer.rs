//! Peer records
//!
//! What the node knows about a remote participant. Records are created the
//! first time a peer is discovered or connects, and are never removed: a
//! peer that goes away stays in the table as disconnected.

use crate::types::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reputation every peer starts with
pub const INITIAL_REPUTATION: f64 = 0.5;

/// Reputation at or above which a peer counts as trusted
pub const TRUSTED_REPUTATION: f64 = 0.5;

/// Role a peer plays in the network
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// Casts votes on market data
    Validator,
    /// Publishes market data
    Provider,
    /// Seed node used for DHT bootstrap
    Bootstrap,
}

/// Identity plus dialable addresses, as handed to the dialer
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddrInfo {
    pub peer_id: PeerId,
    /// Multiaddr strings
    pub addresses: Vec<String>,
}

impl PeerAddrInfo {
    pub fn new(peer_id: PeerId, addresses: Vec<String>) -> Self {
        Self { peer_id, addresses }
    }
}

/// Record of a known peer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    /// Multiaddr strings, most recently observed first
    pub addresses: Vec<String>,
    /// Reputation score in [0, 1]
    pub reputation: f64,
    pub connected: bool,
    /// Wall-clock time of the current connection
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub roles: Vec<PeerRole>,
}

impl Peer {
    /// Create a disconnected record with neutral reputation
    pub fn new(id: PeerId, addresses: Vec<String>) -> Self {
        Self {
            id,
            addresses,
            reputation: INITIAL_REPUTATION,
            connected: false,
            connected_at: None,
            last_seen: Utc::now(),
            roles: vec![PeerRole::Validator],
        }
    }

    /// Address-book view of this record
    pub fn addr_info(&self) -> PeerAddrInfo {
        PeerAddrInfo::new(self.id.clone(), self.addresses.clone())
    }

    /// Merge freshly observed addresses, keeping known ones
    pub fn merge_addresses(&mut self, addresses: &[String]) {
        for addr in addresses {
            if !self.addresses.contains(addr) {
                self.addresses.push(addr.clone());
            }
        }
    }

    /// Shift reputation by `delta`, clamped into [0, 1]
    pub fn adjust_reputation(&mut self, delta: f64) {
        self.reputation = (self.reputation + delta).clamp(0.0, 1.0);
    }

    pub fn is_trusted(&self) -> bool {
        self.reputation >= TRUSTED_REPUTATION
    }

    pub fn has_role(&self, role: PeerRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}
