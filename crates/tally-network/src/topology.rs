//! # Peer Topology
//!
//! The single authoritative table of known peers. Discovery writes what it
//! finds, the swarm event pump writes connection changes, and both read the
//! connected set from here, so there is exactly one answer to "is this peer
//! connected".
//!
//! ```text
//!   DiscoveryCoordinator ──► DiscoveryFeed ────┐
//!                                               ├──► PeerTopology
//!   ConnectionManager ────► ConnectionEvents ──┘
//! ```
//!
//! Connect times are kept on the monotonic clock for pruning and on the
//! wall clock for reporting.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tally_core::{Peer, PeerAddrInfo, PeerId};
use tokio::time::Instant;

/// Read/observe view used by peer discovery
pub trait DiscoveryFeed: Send + Sync {
    /// Upsert a discovered peer. Returns true if the peer was not known.
    fn observe(&self, info: &PeerAddrInfo) -> bool;

    fn is_connected(&self, id: &PeerId) -> bool;

    fn connected_count(&self) -> usize;

    fn connected_peers(&self) -> Vec<PeerId>;
}

/// Connection-state view used by admission and pruning
pub trait ConnectionEvents: Send + Sync {
    /// Record an established connection. Returns true on a state change.
    fn peer_connected(&self, id: &PeerId) -> bool;

    /// Record a closed connection. Returns true on a state change.
    fn peer_disconnected(&self, id: &PeerId) -> bool;

    fn is_connected(&self, id: &PeerId) -> bool;

    fn connected_count(&self) -> usize;

    fn connected_peers(&self) -> Vec<PeerId>;

    /// Connected peers with their connect time, oldest first
    fn connections_oldest_first(&self) -> Vec<(PeerId, Instant)>;
}

struct PeerEntry {
    record: Peer,
    /// Monotonic connect time, set while connected
    connected_since: Option<Instant>,
}

impl PeerEntry {
    fn new(id: PeerId, addresses: Vec<String>) -> Self {
        Self {
            record: Peer::new(id, addresses),
            connected_since: None,
        }
    }
}

/// Topology statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopologyStats {
    pub total_peers: usize,
    pub connected_peers: usize,
    pub trusted_peers: usize,
    pub avg_reputation: f64,
}

/// Peer table
pub struct PeerTopology {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
}

impl PeerTopology {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Upsert a peer, refreshing last-seen and merging addresses.
    /// Connection state of an existing record is left alone.
    pub fn observe(&self, info: &PeerAddrInfo) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(&info.peer_id) {
            Some(entry) => {
                entry.record.merge_addresses(&info.addresses);
                entry.record.touch();
                false
            }
            None => {
                peers.insert(
                    info.peer_id.clone(),
                    PeerEntry::new(info.peer_id.clone(), info.addresses.clone()),
                );
                true
            }
        }
    }

    pub fn mark_connected(&self, id: &PeerId) -> bool {
        let mut peers = self.peers.write();
        let entry = peers
            .entry(id.clone())
            .or_insert_with(|| PeerEntry::new(id.clone(), Vec::new()));
        entry.record.touch();
        if entry.record.connected {
            return false;
        }
        entry.record.connected = true;
        entry.record.connected_at = Some(chrono::Utc::now());
        entry.connected_since = Some(Instant::now());
        true
    }

    pub fn mark_disconnected(&self, id: &PeerId) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(id) {
            Some(entry) if entry.record.connected => {
                entry.record.connected = false;
                entry.record.connected_at = None;
                entry.connected_since = None;
                entry.record.touch();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().get(id).map(|e| e.record.clone())
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.peers
            .read()
            .get(id)
            .map_or(false, |e| e.record.connected)
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|e| e.record.connected)
            .count()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|e| e.record.connected)
            .map(|e| e.record.id.clone())
            .collect()
    }

    /// Monotonic connect time of a connected peer
    pub fn connected_since(&self, id: &PeerId) -> Option<Instant> {
        self.peers.read().get(id).and_then(|e| e.connected_since)
    }

    pub fn connections_oldest_first(&self) -> Vec<(PeerId, Instant)> {
        let mut conns: Vec<(PeerId, Instant)> = self
            .peers
            .read()
            .values()
            .filter_map(|e| e.connected_since.map(|since| (e.record.id.clone(), since)))
            .collect();
        conns.sort_by_key(|(_, since)| *since);
        conns
    }

    /// Shift a peer's reputation, clamped into [0, 1]. Returns the new score.
    pub fn adjust_reputation(&self, id: &PeerId, delta: f64) -> Option<f64> {
        let mut peers = self.peers.write();
        let entry = peers.get_mut(id)?;
        entry.record.adjust_reputation(delta);
        Some(entry.record.reputation)
    }

    /// Peers at or above `min` reputation, best first
    pub fn peers_by_reputation(&self, min: f64) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .read()
            .values()
            .filter(|e| e.record.reputation >= min)
            .map(|e| e.record.clone())
            .collect();
        peers.sort_by(|a, b| {
            b.reputation
                .partial_cmp(&a.reputation)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        peers
    }

    pub fn is_trusted(&self, id: &PeerId) -> bool {
        self.peers
            .read()
            .get(id)
            .map_or(false, |e| e.record.is_trusted())
    }

    pub fn all_peers(&self) -> Vec<Peer> {
        self.peers.read().values().map(|e| e.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn stats(&self) -> TopologyStats {
        let peers = self.peers.read();
        let mut stats = TopologyStats {
            total_peers: peers.len(),
            ..Default::default()
        };
        for entry in peers.values() {
            if entry.record.connected {
                stats.connected_peers += 1;
            }
            if entry.record.is_trusted() {
                stats.trusted_peers += 1;
            }
            stats.avg_reputation += entry.record.reputation;
        }
        if !peers.is_empty() {
            stats.avg_reputation /= peers.len() as f64;
        }
        stats
    }
}

impl Default for PeerTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryFeed for PeerTopology {
    fn observe(&self, info: &PeerAddrInfo) -> bool {
        PeerTopology::observe(self, info)
    }

    fn is_connected(&self, id: &PeerId) -> bool {
        PeerTopology::is_connected(self, id)
    }

    fn connected_count(&self) -> usize {
        PeerTopology::connected_count(self)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        PeerTopology::connected_peers(self)
    }
}

impl ConnectionEvents for PeerTopology {
    fn peer_connected(&self, id: &PeerId) -> bool {
        self.mark_connected(id)
    }

    fn peer_disconnected(&self, id: &PeerId) -> bool {
        self.mark_disconnected(id)
    }

    fn is_connected(&self, id: &PeerId) -> bool {
        PeerTopology::is_connected(self, id)
    }

    fn connected_count(&self) -> usize {
        PeerTopology::connected_count(self)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        PeerTopology::connected_peers(self)
    }

    fn connections_oldest_first(&self) -> Vec<(PeerId, Instant)> {
        PeerTopology::connections_oldest_first(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(id: &str) -> PeerAddrInfo {
        PeerAddrInfo::new(PeerId::new(id), vec![format!("/ip4/127.0.0.1/tcp/{}", id.len())])
    }

    #[test]
    fn test_observe_inserts_disconnected() {
        let topology = PeerTopology::new();
        assert!(topology.observe(&info("a")));
        assert!(!topology.observe(&info("a")));
        assert_eq!(topology.len(), 1);
        assert!(!topology.is_connected(&PeerId::new("a")));
    }

    #[test]
    fn test_observe_keeps_connection_state() {
        let topology = PeerTopology::new();
        let id = PeerId::new("a");
        assert!(topology.mark_connected(&id));
        topology.observe(&info("a"));
        assert!(topology.is_connected(&id));
        assert_eq!(topology.get(&id).unwrap().addresses.len(), 1);
    }

    #[test]
    fn test_connect_disconnect() {
        let topology = PeerTopology::new();
        let id = PeerId::new("a");
        assert!(topology.mark_connected(&id));
        assert!(!topology.mark_connected(&id));
        assert_eq!(topology.connected_count(), 1);
        assert!(topology.connected_since(&id).is_some());
        assert!(topology.get(&id).unwrap().connected_at.is_some());

        assert!(topology.mark_disconnected(&id));
        assert!(!topology.mark_disconnected(&id));
        assert_eq!(topology.connected_count(), 0);
        // Record persists as disconnected
        assert_eq!(topology.len(), 1);
        assert!(topology.connected_since(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oldest_first() {
        let topology = PeerTopology::new();
        for id in ["first", "second", "third"] {
            topology.mark_connected(&PeerId::new(id));
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        let order: Vec<String> = topology
            .connections_oldest_first()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_reputation_queries() {
        let topology = PeerTopology::new();
        topology.observe(&info("good"));
        topology.observe(&info("bad"));
        assert_eq!(topology.adjust_reputation(&PeerId::new("good"), 0.3), Some(0.8));
        assert_eq!(topology.adjust_reputation(&PeerId::new("bad"), -0.9), Some(0.0));
        assert_eq!(topology.adjust_reputation(&PeerId::new("missing"), 0.1), None);

        assert!(topology.is_trusted(&PeerId::new("good")));
        assert!(!topology.is_trusted(&PeerId::new("bad")));

        let ranked = topology.peers_by_reputation(0.0);
        assert_eq!(ranked[0].id, PeerId::new("good"));
        assert_eq!(topology.peers_by_reputation(0.5).len(), 1);

        let stats = topology.stats();
        assert_eq!(stats.total_peers, 2);
        assert_eq!(stats.trusted_peers, 1);
    }
}
