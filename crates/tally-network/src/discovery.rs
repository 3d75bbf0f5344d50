//! # Peer Discovery
//!
//! Kademlia-driven discovery. On start the coordinator bootstraps the DHT
//! against the configured seeds and announces itself as a provider of the
//! application namespace. Every `discovery_interval` it then:
//!
//! 1. lists routing-table peers and namespace providers,
//! 2. upserts them into the topology table,
//! 3. hands unconnected ones to the connection manager while the
//!    connected count is below the cap.
//!
//! Dials are fire-and-forget; failures are logged at debug level.

use crate::connection::ConnectionManager;
use crate::error::{NetworkError, Result};
use crate::topology::DiscoveryFeed;
use crate::transport::PeerRouting;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{PeerAddrInfo, PeerId};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Application namespace advertised in the DHT
pub const DEFAULT_NAMESPACE: &str = "p2p-market-data";

/// Discovery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Namespace whose providers are discovered
    pub namespace: String,

    /// Period between discovery ticks
    pub discovery_interval: Duration,

    /// Bound on a single provider query
    pub provider_query_timeout: Duration,

    /// Seeds used for DHT bootstrap
    pub bootstrap_peers: Vec<PeerAddrInfo>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            discovery_interval: Duration::from_secs(60),
            provider_query_timeout: Duration::from_secs(30),
            bootstrap_peers: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(NetworkError::Config("namespace must not be empty".into()));
        }
        if self.discovery_interval.is_zero() {
            return Err(NetworkError::Config("discovery_interval must be positive".into()));
        }
        if self.provider_query_timeout.is_zero() {
            return Err(NetworkError::Config("provider_query_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of one discovery tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Distinct peers found, excluding self
    pub peers_seen: usize,
    /// Connection attempts handed to the connection manager
    pub dials_spawned: usize,
}

/// Drives periodic peer discovery
pub struct DiscoveryCoordinator {
    config: DiscoveryConfig,
    routing: Arc<dyn PeerRouting>,
    topology: Arc<dyn DiscoveryFeed>,
    connections: Arc<ConnectionManager>,
    running: Mutex<Option<CancellationToken>>,
}

impl DiscoveryCoordinator {
    pub fn new(
        config: DiscoveryConfig,
        routing: Arc<dyn PeerRouting>,
        topology: Arc<dyn DiscoveryFeed>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            config,
            routing,
            topology,
            connections,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// DHT key for the namespace
    pub fn namespace_key(&self) -> Vec<u8> {
        blake3::hash(self.config.namespace.as_bytes()).as_bytes().to_vec()
    }

    /// Bootstrap, advertise, then run the discovery loop until `cancel`
    /// fires or `stop` is called
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
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

        if let Err(e) = self.announce().await {
            *self.running.lock() = None;
            return Err(e);
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.discovery_loop(token).await;
        });

        info!(
            namespace = %self.config.namespace,
            interval_secs = self.config.discovery_interval.as_secs(),
            "Discovery started"
        );
        Ok(())
    }

    async fn announce(&self) -> Result<()> {
        self.routing.bootstrap(&self.config.bootstrap_peers).await?;
        if let Err(e) = self.routing.provide(&self.namespace_key()).await {
            warn!(error = %e, "Failed to advertise namespace");
        }
        Ok(())
    }

    /// Stop the discovery loop
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            info!("Discovery stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    async fn discovery_loop(&self, cancel: CancellationToken) {
        let start = Instant::now() + self.config.discovery_interval;
        let mut ticker = interval_at(start, self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.discover_once().await;
                    debug!(
                        peers_seen = report.peers_seen,
                        dials_spawned = report.dials_spawned,
                        "Discovery tick"
                    );
                }
            }
        }

        {
            let mut running = self.running.lock();
            if running.as_ref().is_some_and(|t| t.is_cancelled()) {
                *running = None;
            }
        }
        debug!("Discovery loop terminated");
    }

    /// Run a single discovery tick
    pub async fn discover_once(&self) -> DiscoveryReport {
        let local = self.routing.local_peer_id();

        let mut candidates = match self.routing.routing_table_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "Failed to list routing table");
                Vec::new()
            }
        };

        let key = self.namespace_key();
        match tokio::time::timeout(
            self.config.provider_query_timeout,
            self.routing.find_providers(&key),
        )
        .await
        {
            Ok(Ok(providers)) => candidates.extend(providers),
            Ok(Err(e)) => warn!(error = %e, "Provider query failed"),
            Err(_) => warn!(
                timeout_secs = self.config.provider_query_timeout.as_secs(),
                "Provider query timed out"
            ),
        }

        let mut seen: HashSet<PeerId> = HashSet::new();
        let mut report = DiscoveryReport::default();
        let max = self.connections.max_connections();

        for info in candidates {
            if info.peer_id == local || info.peer_id.is_empty() {
                continue;
            }
            if !seen.insert(info.peer_id.clone()) {
                continue;
            }
            report.peers_seen += 1;

            if self.topology.observe(&info) {
                debug!(peer = %info.peer_id, "Discovered new peer");
            }

            if self.topology.is_connected(&info.peer_id) {
                continue;
            }
            if self.topology.connected_count() >= max {
                continue;
            }

            let connections = Arc::clone(&self.connections);
            tokio::spawn(async move {
                if let Err(e) = connections.connect_to_peer(&info).await {
                    debug!(peer = %info.peer_id, error = %e, "Failed to connect to discovered peer");
                }
            });
            report.dials_spawned += 1;
        }

        report
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.topology.connected_peers()
    }

    pub fn is_peer_connected(&self, peer: &PeerId) -> bool {
        self.topology.is_connected(peer)
    }

    /// Close the connection to `peer`; succeeds without doing anything
    /// when the peer is not connected
    pub async fn disconnect_peer(&self, peer: &PeerId) -> Result<()> {
        if !self.topology.is_connected(peer) {
            return Ok(());
        }
        self.connections.disconnect_peer(peer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::topology::PeerTopology;
    use crate::transport::Dialer;
    use async_trait::async_trait;

    struct StaticRouting {
        local: PeerId,
        table: Vec<PeerAddrInfo>,
        providers: Vec<PeerAddrInfo>,
        provider_delay: Option<Duration>,
        bootstrapped: Mutex<bool>,
        provided: Mutex<Vec<Vec<u8>>>,
    }

    impl StaticRouting {
        fn new(table: &[&str], providers: &[&str]) -> Self {
            let infos = |ids: &[&str]| -> Vec<PeerAddrInfo> {
                ids.iter()
                    .map(|id| PeerAddrInfo::new(PeerId::new(*id), vec![]))
                    .collect()
            };
            Self {
                local: PeerId::new("self"),
                table: infos(table),
                providers: infos(providers),
                provider_delay: None,
                bootstrapped: Mutex::new(false),
                provided: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PeerRouting for StaticRouting {
        fn local_peer_id(&self) -> PeerId {
            self.local.clone()
        }

        async fn bootstrap(&self, _seeds: &[PeerAddrInfo]) -> Result<()> {
            *self.bootstrapped.lock() = true;
            Ok(())
        }

        async fn routing_table_peers(&self) -> Result<Vec<PeerAddrInfo>> {
            Ok(self.table.clone())
        }

        async fn provide(&self, key: &[u8]) -> Result<()> {
            self.provided.lock().push(key.to_vec());
            Ok(())
        }

        async fn find_providers(&self, _key: &[u8]) -> Result<Vec<PeerAddrInfo>> {
            if let Some(delay) = self.provider_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.providers.clone())
        }
    }

    #[derive(Default)]
    struct CountingDialer {
        dials: Mutex<Vec<PeerId>>,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, peer: &PeerAddrInfo) -> Result<()> {
            self.dials.lock().push(peer.peer_id.clone());
            Ok(())
        }

        async fn close(&self, _peer: &PeerId) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        coordinator: Arc<DiscoveryCoordinator>,
        topology: Arc<PeerTopology>,
        dialer: Arc<CountingDialer>,
        routing: Arc<StaticRouting>,
    }

    fn fixture(routing: StaticRouting, max_connections: usize) -> Fixture {
        let topology = Arc::new(PeerTopology::new());
        let dialer = Arc::new(CountingDialer::default());
        let routing = Arc::new(routing);
        let connections = Arc::new(ConnectionManager::new(
            ConnectionConfig {
                max_connections,
                ..Default::default()
            },
            dialer.clone(),
            topology.clone(),
        ));
        let coordinator = Arc::new(DiscoveryCoordinator::new(
            DiscoveryConfig::default(),
            routing.clone(),
            topology.clone(),
            connections,
        ));
        Fixture {
            coordinator,
            topology,
            dialer,
            routing,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_discover_skips_self_and_duplicates() {
        let f = fixture(StaticRouting::new(&["self", "a", "b"], &["b", "c"]), 50);
        let report = f.coordinator.discover_once().await;
        assert_eq!(report.peers_seen, 3);
        assert_eq!(report.dials_spawned, 3);
        settle().await;
        assert_eq!(f.dialer.dials.lock().len(), 3);
        assert_eq!(f.topology.connected_count(), 3);
        assert!(f.topology.get(&PeerId::new("self")).is_none());
    }

    #[tokio::test]
    async fn test_discover_skips_connected() {
        let f = fixture(StaticRouting::new(&["a", "b"], &[]), 50);
        f.topology.mark_connected(&PeerId::new("a"));
        let report = f.coordinator.discover_once().await;
        assert_eq!(report.peers_seen, 2);
        assert_eq!(report.dials_spawned, 1);
        // Observation did not clobber the connection
        assert!(f.coordinator.is_peer_connected(&PeerId::new("a")));
    }

    #[tokio::test]
    async fn test_discover_respects_max() {
        let f = fixture(StaticRouting::new(&["x", "y"], &[]), 2);
        f.topology.mark_connected(&PeerId::new("a"));
        f.topology.mark_connected(&PeerId::new("b"));
        let report = f.coordinator.discover_once().await;
        assert_eq!(report.peers_seen, 2);
        assert_eq!(report.dials_spawned, 0);
        settle().await;
        assert!(f.dialer.dials.lock().is_empty());
        // Peers are still recorded
        assert!(f.topology.get(&PeerId::new("x")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout_degrades_to_routing_table() {
        let mut routing = StaticRouting::new(&["a"], &["slow"]);
        routing.provider_delay = Some(Duration::from_secs(120));
        let f = fixture(routing, 50);
        let report = f.coordinator.discover_once().await;
        assert_eq!(report.peers_seen, 1);
        assert!(f.topology.get(&PeerId::new("slow")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_bootstraps_and_provides() {
        let f = fixture(StaticRouting::new(&["a"], &[]), 50);
        let cancel = CancellationToken::new();
        f.coordinator.start(&cancel).await.unwrap();
        assert!(*f.routing.bootstrapped.lock());
        assert_eq!(f.routing.provided.lock()[0], f.coordinator.namespace_key());

        let err = f.coordinator.start(&cancel).await.unwrap_err();
        assert_eq!(err, NetworkError::AlreadyRunning);

        // First tick fires one interval after start
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(f.dialer.dials.lock().is_empty());
        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(f.dialer.dials.lock().len(), 1);

        cancel.cancel();
        f.coordinator.stop();
        assert!(!f.coordinator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_parent_cancelled() {
        let f = fixture(StaticRouting::new(&[], &[]), 50);
        let parent = CancellationToken::new();
        f.coordinator.start(&parent).await.unwrap();

        parent.cancel();
        while f.coordinator.is_running() {
            tokio::task::yield_now().await;
        }

        f.coordinator.start(&CancellationToken::new()).await.unwrap();
        assert!(f.coordinator.is_running());
        f.coordinator.stop();
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let topology = Arc::new(PeerTopology::new());
        let dialer = Arc::new(CountingDialer::default());
        let connections = Arc::new(ConnectionManager::new(
            ConnectionConfig::default(),
            dialer,
            topology.clone(),
        ));
        let routing = Arc::new(StaticRouting::new(&[], &[]));
        let coordinator = Arc::new(DiscoveryCoordinator::new(
            DiscoveryConfig {
                discovery_interval: Duration::ZERO,
                ..Default::default()
            },
            routing.clone(),
            topology,
            connections,
        ));

        let err = coordinator.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, NetworkError::Config(_)));
        assert!(!coordinator.is_running());
        assert!(!*routing.bootstrapped.lock());

        let empty = DiscoveryConfig {
            namespace: String::new(),
            ..Default::default()
        };
        assert!(empty.validate().is_err());
        assert!(DiscoveryConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_peer_noop_when_not_connected() {
        let f = fixture(StaticRouting::new(&[], &[]), 50);
        f.coordinator.disconnect_peer(&PeerId::new("ghost")).await.unwrap();

        f.topology.mark_connected(&PeerId::new("a"));
        f.coordinator.disconnect_peer(&PeerId::new("a")).await.unwrap();
        assert!(f.coordinator.connected_peers().is_empty());
    }
}
