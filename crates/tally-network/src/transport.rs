//! # Transport Ports
//!
//! The capabilities the rest of the node needs from the network, as traits.
//! `SwarmHandle` implements all three over libp2p; tests substitute
//! in-memory doubles.
//!
//! | Port | Used by | libp2p backing |
//! |------|---------|----------------|
//! | `Dialer` | ConnectionManager | `Swarm::dial` / `disconnect_peer_id` |
//! | `PeerRouting` | DiscoveryCoordinator | Kademlia |
//! | `Publisher` | VotingSystem, node | GossipSub |

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tally_core::{PeerAddrInfo, PeerId};

/// Opens and closes connections to remote peers
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Resolve once a connection to `peer` is established or has failed
    async fn dial(&self, peer: &PeerAddrInfo) -> Result<()>;

    /// Close every connection to `peer`
    async fn close(&self, peer: &PeerId) -> Result<()>;
}

/// DHT-backed peer routing
#[async_trait]
pub trait PeerRouting: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Seed the routing table and start a bootstrap query
    async fn bootstrap(&self, seeds: &[PeerAddrInfo]) -> Result<()>;

    /// Peers currently held in the routing table
    async fn routing_table_peers(&self) -> Result<Vec<PeerAddrInfo>>;

    /// Advertise this node as a provider of `key`
    async fn provide(&self, key: &[u8]) -> Result<()>;

    /// Providers of `key`, resolved when the query finishes
    async fn find_providers(&self, key: &[u8]) -> Result<Vec<PeerAddrInfo>>;
}

/// Topic-based broadcast
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;
}

/// Transport layer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Multiaddrs to listen on
    pub listen_addresses: Vec<String>,

    /// Also listen on QUIC for every TCP listen address
    pub enable_quic: bool,

    /// Idle timeout before closing connection
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec!["/ip4/0.0.0.0/tcp/4001".to_string()],
            enable_quic: true,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config() {
        let config = TransportConfig::default();
        assert!(config.enable_quic);
        assert_eq!(config.listen_addresses.len(), 1);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
    }
}
