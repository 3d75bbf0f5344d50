//! # Connection Admission & Pruning
//!
//! Keeps the number of live connections between `min_connections` and
//! `max_connections`.
//!
//! ```text
//!   connect_to_peer ──► capacity check ──► Dialer::dial (bounded)
//!                          │
//!             connected + in-flight < max
//!
//!   every prune_interval:
//!     count > min ──► close stale connections, oldest first, until count == min
//! ```
//!
//! Connection state itself lives in the topology table; the swarm event
//! pump reports established and closed connections through
//! `handle_connected` / `handle_disconnected`.

use crate::error::{NetworkError, Result};
use crate::topology::ConnectionEvents;
use crate::transport::Dialer;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{PeerAddrInfo, PeerId};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Hard ceiling on simultaneous connections
    pub max_connections: usize,

    /// Pruning never goes below this many connections
    pub min_connections: usize,

    /// Bound on a single dial attempt
    pub connect_timeout: Duration,

    /// Period of the maintenance loop
    pub prune_interval: Duration,

    /// Connections older than this are eligible for pruning
    pub stale_threshold: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            min_connections: 5,
            connect_timeout: Duration::from_secs(30),
            prune_interval: Duration::from_secs(5 * 60),
            stale_threshold: Duration::from_secs(60 * 60),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(NetworkError::Config("max_connections must be positive".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(NetworkError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("prune_interval", self.prune_interval),
            ("stale_threshold", self.stale_threshold),
        ] {
            if value.is_zero() {
                return Err(NetworkError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Connection admission and pruning
pub struct ConnectionManager {
    config: ConnectionConfig,
    dialer: Arc<dyn Dialer>,
    topology: Arc<dyn ConnectionEvents>,
    /// Dials in flight; they count against capacity
    pending: Mutex<HashSet<PeerId>>,
    running: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        dialer: Arc<dyn Dialer>,
        topology: Arc<dyn ConnectionEvents>,
    ) -> Self {
        Self {
            config,
            dialer,
            topology,
            pending: Mutex::new(HashSet::new()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Start the maintenance loop. The loop ends when `cancel` fires or
    /// `stop` is called.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        self.config.validate()?;
        let token = {
            let mut running = self.running.lock();
            if running.is_some() {
                return Err(NetworkError::AlreadyRunning);
            }
            let token = cancel.child_token();
            *running = Some(token.clone());
            token
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.maintenance_loop(token).await;
        });

        info!(
            max = self.config.max_connections,
            min = self.config.min_connections,
            "Connection manager started"
        );
        Ok(())
    }

    /// Stop the maintenance loop
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            info!("Connection manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    async fn maintenance_loop(&self, cancel: CancellationToken) {
        let start = Instant::now() + self.config.prune_interval;
        let mut ticker = interval_at(start, self.config.prune_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = self.perform_maintenance().await;
                    if pruned > 0 {
                        info!(pruned, remaining = self.connection_count(), "Pruned stale connections");
                    }
                }
            }
        }

        {
            let mut running = self.running.lock();
            if running.as_ref().is_some_and(|t| t.is_cancelled()) {
                *running = None;
            }
        }
        debug!("Connection maintenance loop terminated");
    }

    /// Dial a peer if capacity allows.
    ///
    /// Already-connected peers and peers with a dial in flight succeed
    /// without doing anything. There is no retry.
    pub async fn connect_to_peer(&self, info: &PeerAddrInfo) -> Result<()> {
        let peer = info.peer_id.clone();
        {
            let mut pending = self.pending.lock();
            if self.topology.is_connected(&peer) || pending.contains(&peer) {
                debug!(%peer, "Already connected or dialing");
                return Ok(());
            }
            let current = self.topology.connected_count() + pending.len();
            if current >= self.config.max_connections {
                return Err(NetworkError::Capacity {
                    current,
                    max: self.config.max_connections,
                });
            }
            pending.insert(peer.clone());
        }

        let outcome = tokio::time::timeout(self.config.connect_timeout, self.dialer.dial(info)).await;
        self.pending.lock().remove(&peer);

        match outcome {
            Ok(Ok(())) => {
                self.topology.peer_connected(&peer);
                debug!(%peer, "Connected");
                Ok(())
            }
            Ok(Err(e @ NetworkError::DialFailed { .. })) => Err(e),
            Ok(Err(e)) => Err(NetworkError::DialFailed {
                peer,
                reason: e.to_string(),
            }),
            Err(_) => Err(NetworkError::DialTimeout(peer)),
        }
    }

    /// Close the connection to a tracked peer
    pub async fn disconnect_peer(&self, peer: &PeerId) -> Result<()> {
        if !self.topology.is_connected(peer) {
            return Err(NetworkError::NotConnected(peer.clone()));
        }
        self.dialer
            .close(peer)
            .await
            .map_err(|e| NetworkError::CloseFailed {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;
        self.topology.peer_disconnected(peer);
        debug!(%peer, "Disconnected");
        Ok(())
    }

    /// Swarm notification: a connection to `peer` is up
    pub fn handle_connected(&self, peer: &PeerId) {
        if self.topology.peer_connected(peer) {
            debug!(%peer, count = self.connection_count(), "Peer connected");
        }
    }

    /// Swarm notification: the last connection to `peer` closed
    pub fn handle_disconnected(&self, peer: &PeerId) {
        if self.topology.peer_disconnected(peer) {
            debug!(%peer, count = self.connection_count(), "Peer disconnected");
        }
    }

    /// One pruning pass. Returns how many connections were closed.
    pub async fn perform_maintenance(&self) -> usize {
        let min = self.config.min_connections;
        let mut remaining = self.topology.connected_count();
        if remaining <= min {
            debug!(count = remaining, min, "Skipping maintenance");
            return 0;
        }

        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .topology
            .connections_oldest_first()
            .into_iter()
            .filter(|(_, since)| now.duration_since(*since) > self.config.stale_threshold)
            .map(|(peer, _)| peer)
            .collect();

        let mut pruned = 0;
        for peer in stale {
            if remaining <= min {
                break;
            }
            match self.dialer.close(&peer).await {
                Ok(()) => {
                    self.topology.peer_disconnected(&peer);
                    remaining -= 1;
                    pruned += 1;
                    debug!(%peer, "Closed stale connection");
                }
                Err(e) => {
                    warn!(%peer, error = %e, "Failed to close stale connection");
                }
            }
        }
        pruned
    }

    pub fn connection_count(&self) -> usize {
        self.topology.connected_count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.topology.connected_peers()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.topology.is_connected(peer)
    }
}
