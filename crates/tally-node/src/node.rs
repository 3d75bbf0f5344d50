//! Tally node
//!
//! Wires the swarm, the peer mesh and the voting system together and pumps
//! network events between them.
//!
//! ```text
//!   SwarmNetworkEvent ──► event pump ─┬─► PeerConnected/Disconnected ─► ConnectionManager
//!                                     ├─► VoteResponse ───────────────► VotingSystem::submit_vote
//!                                     └─► VoteRequest ────────────────► vote_requests channel
//! ```

use crate::config::NodeConfig;
use crate::metrics::{MetricsServer, NodeMetrics};

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tally_consensus::{VoteRequest, VotingError, VotingMetrics, VotingSystem, VALIDATION_TOPIC};
use tally_core::{MarketData, MemoryRepository, PeerId, Repository, Vote, VoteResult};
use tally_network::{
    ConnectionManager, DiscoveryCoordinator, Dialer, MessageType, NetworkMessage, PeerRouting,
    PeerTopology, Publisher, SwarmHandle, SwarmNetworkEvent, SwarmRuntime,
};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Node state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Built, not yet running
    Starting,
    /// Node is running normally
    Running,
    /// Node is shutting down
    Stopping,
    /// Node has stopped
    Stopped,
}

/// A vote request seen on the validation topic, for an external validator
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingVoteRequest {
    /// Node that opened the session
    pub from: PeerId,
    pub request: VoteRequest,
}

/// Network capabilities and storage a node is assembled from
pub struct NodeParts {
    pub local_id: PeerId,
    pub dialer: Arc<dyn Dialer>,
    pub routing: Arc<dyn PeerRouting>,
    pub publisher: Arc<dyn Publisher>,
    pub events: broadcast::Receiver<SwarmNetworkEvent>,
    pub repository: Arc<dyn Repository>,
}

/// Tally validation node
pub struct TallyNode {
    config: NodeConfig,
    local_id: PeerId,
    state: RwLock<NodeState>,

    /// Set when the node owns a libp2p swarm
    swarm: Option<SwarmHandle>,
    topology: Arc<PeerTopology>,
    connections: Arc<ConnectionManager>,
    discovery: Arc<DiscoveryCoordinator>,
    voting: Arc<VotingSystem>,
    publisher: Arc<dyn Publisher>,
    repository: Arc<dyn Repository>,
    metrics: Arc<NodeMetrics>,

    events: Mutex<Option<broadcast::Receiver<SwarmNetworkEvent>>>,
    vote_requests: broadcast::Sender<IncomingVoteRequest>,
    shutdown: CancellationToken,
}

impl TallyNode {
    /// Start a libp2p swarm per `config` and build a node on it, with an
    /// in-memory repository
    pub async fn new(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let mut runtime = SwarmRuntime::new(config.swarm_config()?)?;
        let events = runtime.event_receiver();
        let handle = runtime.start().context("starting swarm")?;
        handle
            .subscribe(VALIDATION_TOPIC)
            .await
            .context("subscribing to validation topic")?;

        let handle_arc = Arc::new(handle.clone());
        let parts = NodeParts {
            local_id: runtime.local_peer_id(),
            dialer: handle_arc.clone(),
            routing: handle_arc.clone(),
            publisher: handle_arc,
            events,
            repository: Arc::new(MemoryRepository::new()),
        };

        let mut node = Self::with_parts(config, parts)?;
        node.swarm = Some(handle);
        Ok(node)
    }

    /// Build a node over the given capabilities
    pub fn with_parts(config: NodeConfig, parts: NodeParts) -> anyhow::Result<Self> {
        config.validate()?;

        let topology = Arc::new(PeerTopology::new());
        let connections = Arc::new(ConnectionManager::new(
            config.connection_config(),
            parts.dialer,
            topology.clone(),
        ));
        let discovery = Arc::new(DiscoveryCoordinator::new(
            config.discovery_config()?,
            parts.routing,
            topology.clone(),
            connections.clone(),
        ));
        let voting = Arc::new(VotingSystem::new(
            parts.local_id.clone(),
            config.voting_config(),
            parts.publisher.clone(),
            Arc::new(VotingMetrics::new()),
        )?);
        let (vote_requests, _) = broadcast::channel(256);

        Ok(Self {
            config,
            local_id: parts.local_id,
            state: RwLock::new(NodeState::Starting),
            swarm: None,
            topology,
            connections,
            discovery,
            voting,
            publisher: parts.publisher,
            repository: parts.repository,
            metrics: Arc::new(NodeMetrics::new()?),
            events: Mutex::new(Some(parts.events)),
            vote_requests,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn voting(&self) -> &Arc<VotingSystem> {
        &self.voting
    }

    pub fn topology(&self) -> &Arc<PeerTopology> {
        &self.topology
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    /// Vote requests from other nodes, for whatever judges the items
    pub fn subscribe_vote_requests(&self) -> broadcast::Receiver<IncomingVoteRequest> {
        self.vote_requests.subscribe()
    }

    /// Run until Ctrl-C or `shutdown`
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(name = %self.config.node.name, peer_id = %self.local_id, "Starting Tally node");

        let events = self
            .events
            .lock()
            .take()
            .context("node has already been run")?;

        self.connections.start(&self.shutdown)?;
        self.discovery.start(&self.shutdown).await?;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(pump_events(
            events,
            self.connections.clone(),
            self.voting.clone(),
            self.vote_requests.clone(),
            self.metrics.clone(),
            self.shutdown.clone(),
        )));

        if self.config.metrics.enabled {
            let addr = self.config.metrics.address.parse()?;
            let server = MetricsServer::bind(addr).await?;
            tasks.push(tokio::spawn(server.run(self.metrics.clone(), self.shutdown.clone())));
            tasks.push(tokio::spawn(refresh_metrics(
                self.metrics.clone(),
                self.voting.clone(),
                self.topology.clone(),
                Duration::from_secs(self.config.metrics.refresh_interval_secs),
                self.shutdown.clone(),
            )));
        }

        *self.state.write() = NodeState::Running;
        self.log_startup();

        self.wait_for_shutdown().await;

        *self.state.write() = NodeState::Stopping;
        info!("Shutting down...");

        self.shutdown.cancel();
        self.discovery.stop();
        self.connections.stop();
        if let Some(swarm) = &self.swarm {
            if let Err(e) = swarm.shutdown().await {
                warn!("Failed to stop swarm: {}", e);
            }
        }
        for task in tasks {
            task.abort();
        }

        *self.state.write() = NodeState::Stopped;
        info!("Node stopped");
        Ok(())
    }

    /// Ask a running node to stop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Put `item` to a vote; an accepted item is stored with its score
    pub async fn validate(&self, mut item: MarketData) -> anyhow::Result<VoteResult> {
        let outcome = self.voting.start_voting(&self.shutdown, item.clone()).await;

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                if e.result().is_some() {
                    self.metrics.validation_finished("failed");
                }
                return Err(e.into());
            }
        };

        if result.accepted {
            self.metrics.validation_finished("accepted");
            item.set_validation_score(result.score);
            self.repository
                .save_market_data(&item)
                .await
                .with_context(|| format!("storing validated item {}", item.id))?;
        } else {
            self.metrics.validation_finished("rejected");
        }
        Ok(result)
    }

    /// Publish a vote on the validation topic
    pub async fn cast_vote(&self, vote: Vote) -> anyhow::Result<()> {
        vote.validate()?;
        let msg = NetworkMessage::with_body(self.local_id.clone(), MessageType::VoteResponse, &vote)?;
        self.publisher.publish(VALIDATION_TOPIC, msg.encode()?).await?;
        debug!(market_data_id = %vote.market_data_id, is_valid = vote.is_valid, "Vote cast");
        Ok(())
    }

    fn log_startup(&self) {
        info!("Tally node is running");
        info!("Peer ID: {}", self.local_id);
        for addr in &self.config.network.listen_addresses {
            info!("P2P listen: {}", addr);
        }
        info!("Bootstrap peers: {}", self.config.network.bootstrap_peers.len());
        let voting = self.voting.config();
        info!(
            "Voting: timeout {:?}, min voters {}, quorum {}",
            voting.voting_timeout, voting.min_voters, voting.quorum
        );
        if self.config.metrics.enabled {
            info!("Metrics: http://{}/metrics", self.config.metrics.address);
        }
    }

    async fn wait_for_shutdown(&self) {
        tokio::select! {
            res = signal::ctrl_c() => match res {
                Ok(()) => info!("Received Ctrl-C"),
                Err(e) => {
                    warn!("Failed to install Ctrl-C handler: {}", e);
                    self.shutdown.cancelled().await;
                }
            },
            _ = self.shutdown.cancelled() => {}
        }
    }
}

/// Route swarm events to the connection manager and the voting system
pub(crate) async fn pump_events(
    mut events: broadcast::Receiver<SwarmNetworkEvent>,
    connections: Arc<ConnectionManager>,
    voting: Arc<VotingSystem>,
    vote_requests: broadcast::Sender<IncomingVoteRequest>,
    metrics: Arc<NodeMetrics>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(SwarmNetworkEvent::PeerConnected { peer_id }) => {
                connections.handle_connected(&peer_id);
            }
            Ok(SwarmNetworkEvent::PeerDisconnected { peer_id }) => {
                connections.handle_disconnected(&peer_id);
            }
            Ok(SwarmNetworkEvent::GossipMessage { topic, data, source }) => {
                if topic == VALIDATION_TOPIC {
                    handle_validation_message(&data, &source, &voting, &vote_requests, &metrics);
                } else {
                    debug!("Ignoring message on topic {} from {}", topic, source);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Network event pump lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Network event channel closed");
                break;
            }
        }
    }
}

fn handle_validation_message(
    data: &[u8],
    source: &PeerId,
    voting: &VotingSystem,
    vote_requests: &broadcast::Sender<IncomingVoteRequest>,
    metrics: &NodeMetrics,
) {
    let msg = match NetworkMessage::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Undecodable message from {}: {}", source, e);
            return;
        }
    };

    match msg.message_type {
        MessageType::VoteResponse => {
            let vote: Vote = match msg.body() {
                Ok(vote) => vote,
                Err(e) => {
                    debug!("Bad vote payload from {}: {}", source, e);
                    return;
                }
            };
            metrics.vote_received();
            match voting.submit_vote(vote) {
                Ok(()) => {}
                // Votes for rounds other nodes coordinate are expected.
                Err(VotingError::SessionNotFound(_)) => {}
                Err(e) => debug!("Vote from {} rejected: {}", source, e),
            }
        }
        MessageType::VoteRequest => {
            let request: VoteRequest = match msg.body() {
                Ok(request) => request,
                Err(e) => {
                    debug!("Bad vote request from {}: {}", source, e);
                    return;
                }
            };
            if request.is_expired() {
                debug!(market_data_id = %request.market_data_id, "Dropping expired vote request");
                return;
            }
            metrics.vote_request_received();
            // No subscribers is fine; nobody is judging items on this node.
            let _ = vote_requests.send(IncomingVoteRequest {
                from: msg.sender,
                request,
            });
        }
    }
}

async fn refresh_metrics(
    metrics: Arc<NodeMetrics>,
    voting: Arc<VotingSystem>,
    topology: Arc<PeerTopology>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => metrics.refresh(&voting.stats(), &topology.stats()),
        }
    }
}
