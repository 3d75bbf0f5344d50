//! # libp2p Swarm Runtime
//!
//! Owns the libp2p swarm and exposes it to the rest of the node through the
//! transport ports (`Dialer`, `PeerRouting`, `Publisher`).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      TALLY SWARM RUNTIME                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐     │
//! │  │   GossipSub    │  │    Kademlia    │  │    Identify    │     │
//! │  │ (vote traffic) │  │  (discovery)   │  │ (addr exchange)│     │
//! │  └───────┬────────┘  └───────┬────────┘  └───────┬────────┘     │
//! │          └───────────────────┼───────────────────┘              │
//! │                   ┌──────────┴──────────┐                       │
//! │                   │   TallyBehaviour    │                       │
//! │                   └──────────┬──────────┘                       │
//! │                   ┌──────────┴──────────┐                       │
//! │                   │     libp2p Swarm    │                       │
//! │                   │  TCP+Noise+Yamux    │                       │
//! │                   │        QUIC         │                       │
//! │                   └──────────┬──────────┘                       │
//! │                              │                                  │
//! │   SwarmHandle ── mpsc ──► EventLoop ── broadcast ──► consumers  │
//! │        ▲                     │                                  │
//! │        └────── oneshot ──────┘                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every command carries a oneshot reply. Dials resolve when the connection
//! is established or the outgoing connection fails; provider lookups
//! accumulate results until Kademlia reports the last query step.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode},
    identify,
    kad::{self, store::MemoryStore, Mode as KadMode, QueryId},
    multiaddr::Protocol,
    noise,
    swarm::{dial_opts::DialOpts, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, Swarm, SwarmBuilder,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tally_core::{PeerAddrInfo, PeerId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::transport::{Dialer, PeerRouting, Publisher, TransportConfig};

// ============================================================================
// SWARM CONFIGURATION
// ============================================================================

/// Complete swarm configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Base transport config
    pub transport: TransportConfig,

    /// GossipSub configuration
    pub gossipsub: GossipSubConfig,

    /// Kademlia configuration
    pub kademlia: KademliaConfig,

    /// Node identity seed (32 bytes); a fresh identity is generated if unset
    pub identity_seed: Option<[u8; 32]>,
}

/// GossipSub-specific configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipSubConfig {
    pub heartbeat_interval: Duration,
    /// Maximum transmit size
    pub max_transmit_size: usize,
    /// Mesh degree (D)
    pub mesh_n: usize,
    /// Mesh low watermark (D_low)
    pub mesh_n_low: usize,
    /// Mesh high watermark (D_high)
    pub mesh_n_high: usize,
    pub history_length: usize,
    pub history_gossip: usize,
    /// Duplicate cache TTL
    pub duplicate_cache_time: Duration,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            max_transmit_size: 256 * 1024,
            mesh_n: 6,
            mesh_n_low: 4,
            mesh_n_high: 12,
            history_length: 5,
            history_gossip: 3,
            duplicate_cache_time: Duration::from_secs(60),
        }
    }
}

/// Kademlia-specific configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KademliaConfig {
    pub protocol_name: String,
    pub replication_factor: usize,
    /// Query parallelism
    pub parallelism: usize,
    pub query_timeout: Duration,
    /// Provider record TTL
    pub provider_ttl: Duration,
    /// Answer inbound DHT queries
    pub server_mode: bool,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self {
            protocol_name: "/tally/kad/1.0.0".to_string(),
            replication_factor: 20,
            parallelism: 3,
            query_timeout: Duration::from_secs(30),
            provider_ttl: Duration::from_secs(3600 * 12),
            server_mode: true,
        }
    }
}

// ============================================================================
// TALLY NETWORK BEHAVIOUR
// ============================================================================

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct TallyBehaviour {
    /// Vote requests and responses
    pub gossipsub: gossipsub::Behaviour,

    /// Routing table and namespace providers
    pub kademlia: kad::Behaviour<MemoryStore>,

    /// Address exchange feeding Kademlia
    pub identify: identify::Behaviour,
}

// ============================================================================
// SWARM COMMANDS
// ============================================================================

type Reply<T> = oneshot::Sender<crate::error::Result<T>>;

/// Commands to control the swarm from other tasks
#[derive(Debug)]
pub enum SwarmCommand {
    Subscribe {
        topic: String,
        reply: Reply<()>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Dial {
        peer_id: libp2p::PeerId,
        addrs: Vec<Multiaddr>,
        reply: Reply<()>,
    },
    Disconnect {
        peer_id: libp2p::PeerId,
        reply: Reply<()>,
    },
    Bootstrap {
        seeds: Vec<(libp2p::PeerId, Vec<Multiaddr>)>,
        reply: Reply<()>,
    },
    RoutingTablePeers {
        reply: Reply<Vec<PeerAddrInfo>>,
    },
    StartProviding {
        key: Vec<u8>,
        reply: Reply<()>,
    },
    GetProviders {
        key: Vec<u8>,
        reply: Reply<Vec<PeerAddrInfo>>,
    },
    GetStats {
        reply: Reply<SwarmStats>,
    },
    Shutdown,
}

/// Swarm statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmStats {
    pub local_peer_id: String,
    pub connected_peers: usize,
    pub routing_table_size: usize,
    pub messages_published: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub dht_queries: u64,
    pub active_subscriptions: Vec<String>,
    pub uptime_secs: u64,
}

// ============================================================================
// SWARM EVENTS
// ============================================================================

/// Events emitted by the swarm for application processing
#[derive(Debug, Clone, PartialEq)]
pub enum SwarmNetworkEvent {
    /// First connection to a peer established
    PeerConnected { peer_id: PeerId },

    /// Last connection to a peer closed
    PeerDisconnected { peer_id: PeerId },

    /// Gossip message received
    GossipMessage {
        topic: String,
        data: Vec<u8>,
        source: PeerId,
    },
}

// ============================================================================
// ADDRESS HELPERS
// ============================================================================

fn to_core_peer_id(peer_id: &libp2p::PeerId) -> PeerId {
    PeerId::new(peer_id.to_base58())
}

fn to_libp2p_peer_id(peer_id: &PeerId) -> crate::error::Result<libp2p::PeerId> {
    peer_id
        .as_str()
        .parse()
        .map_err(|e| NetworkError::InvalidAddress(format!("peer id {}: {}", peer_id, e)))
}

fn to_multiaddrs(addresses: &[String]) -> Vec<Multiaddr> {
    addresses
        .iter()
        .filter_map(|a| match a.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!("Skipping invalid multiaddr {}: {}", a, e);
                None
            }
        })
        .collect()
}

/// Parse `/ip4/.../tcp/.../p2p/<peer id>` into peer id plus dialable address
pub fn parse_peer_multiaddr(s: &str) -> crate::error::Result<PeerAddrInfo> {
    let mut addr: Multiaddr = s
        .parse()
        .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", s, e)))?;
    match addr.pop() {
        Some(Protocol::P2p(peer_id)) => Ok(PeerAddrInfo::new(
            to_core_peer_id(&peer_id),
            vec![addr.to_string()],
        )),
        _ => Err(NetworkError::InvalidAddress(format!(
            "{} has no /p2p/ component",
            s
        ))),
    }
}

/// QUIC listen address on the same host and port as a TCP one
fn quic_equivalent(addr: &Multiaddr) -> Option<Multiaddr> {
    let mut out = Multiaddr::empty();
    let mut has_tcp = false;
    for proto in addr.iter() {
        match proto {
            Protocol::Tcp(port) => {
                out.push(Protocol::Udp(port));
                out.push(Protocol::QuicV1);
                has_tcp = true;
            }
            other => out.push(other),
        }
    }
    has_tcp.then_some(out)
}

// ============================================================================
// TALLY SWARM RUNTIME
// ============================================================================

/// The runtime that owns the libp2p swarm
pub struct SwarmRuntime {
    config: SwarmConfig,

    keypair: libp2p::identity::Keypair,

    local_peer_id: libp2p::PeerId,

    /// Command channel sender
    command_tx: Option<mpsc::Sender<SwarmCommand>>,

    /// Event broadcast channel
    event_tx: broadcast::Sender<SwarmNetworkEvent>,

    stats: Arc<RwLock<SwarmStats>>,

    is_running: Arc<RwLock<bool>>,
}

impl SwarmRuntime {
    /// Create a runtime; the identity is fixed here so the peer id is known
    /// before the swarm starts
    pub fn new(config: SwarmConfig) -> crate::error::Result<Self> {
        let keypair = match config.identity_seed {
            Some(seed) => libp2p::identity::Keypair::ed25519_from_bytes(seed)
                .map_err(|e| NetworkError::Config(format!("Invalid identity seed: {}", e)))?,
            None => libp2p::identity::Keypair::generate_ed25519(),
        };
        let local_peer_id = libp2p::PeerId::from(keypair.public());
        let (event_tx, _) = broadcast::channel(1024);

        let stats = SwarmStats {
            local_peer_id: local_peer_id.to_string(),
            ..Default::default()
        };

        Ok(Self {
            config,
            keypair,
            local_peer_id,
            command_tx: None,
            event_tx,
            stats: Arc::new(RwLock::new(stats)),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Build the swarm, start listening and spawn the event loop
    pub fn start(&mut self) -> crate::error::Result<SwarmHandle> {
        if *self.is_running.read() {
            return Err(NetworkError::AlreadyRunning);
        }

        info!("Starting swarm runtime, local peer id {}", self.local_peer_id);

        let mut swarm = self.build_swarm()?;

        for addr in &self.config.transport.listen_addresses {
            let multiaddr: Multiaddr = addr
                .parse()
                .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", addr, e)))?;
            swarm
                .listen_on(multiaddr.clone())
                .map_err(|e| NetworkError::Config(format!("listen on {}: {}", multiaddr, e)))?;

            if self.config.transport.enable_quic {
                if let Some(quic_addr) = quic_equivalent(&multiaddr) {
                    if let Err(e) = swarm.listen_on(quic_addr.clone()) {
                        warn!("Failed to listen on QUIC {}: {}", quic_addr, e);
                    }
                }
            }
        }

        let (command_tx, command_rx) = mpsc::channel(256);
        self.command_tx = Some(command_tx.clone());

        let event_loop = EventLoop {
            swarm,
            command_rx,
            event_tx: self.event_tx.clone(),
            stats: self.stats.clone(),
            subscriptions: HashSet::new(),
            pending_dials: HashMap::new(),
            pending_providers: HashMap::new(),
        };
        let is_running = self.is_running.clone();
        *self.is_running.write() = true;

        tokio::spawn(async move {
            event_loop.run().await;
            *is_running.write() = false;
        });

        info!("Swarm runtime started");
        Ok(SwarmHandle {
            command_tx,
            local_peer_id: to_core_peer_id(&self.local_peer_id),
        })
    }

    /// Build the libp2p swarm with all behaviours
    fn build_swarm(&self) -> crate::error::Result<Swarm<TallyBehaviour>> {
        let gossip = &self.config.gossipsub;
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(gossip.heartbeat_interval)
            .max_transmit_size(gossip.max_transmit_size)
            .mesh_n(gossip.mesh_n)
            .mesh_n_low(gossip.mesh_n_low)
            .mesh_n_high(gossip.mesh_n_high)
            .history_length(gossip.history_length)
            .history_gossip(gossip.history_gossip)
            .duplicate_cache_time(gossip.duplicate_cache_time)
            .validation_mode(ValidationMode::Strict)
            .build()
            .map_err(|e| NetworkError::Config(format!("GossipSub config error: {}", e)))?;

        let gossipsub = gossipsub::Behaviour::new(
            MessageAuthenticity::Signed(self.keypair.clone()),
            gossipsub_config,
        )
        .map_err(|e| NetworkError::Config(format!("GossipSub init error: {}", e)))?;

        let kad_cfg = &self.config.kademlia;
        let protocol = libp2p::StreamProtocol::try_from_owned(kad_cfg.protocol_name.clone())
            .map_err(|e| NetworkError::Config(format!("Kademlia protocol name: {}", e)))?;
        let mut kad_config = kad::Config::default();
        kad_config
            .set_protocol_names(vec![protocol])
            .set_replication_factor(
                NonZeroUsize::new(kad_cfg.replication_factor).unwrap_or(kad::K_VALUE),
            )
            .set_parallelism(NonZeroUsize::new(kad_cfg.parallelism).unwrap_or(kad::ALPHA_VALUE))
            .set_query_timeout(kad_cfg.query_timeout)
            .set_provider_record_ttl(Some(kad_cfg.provider_ttl));

        let store = MemoryStore::new(self.local_peer_id);
        let mut kademlia = kad::Behaviour::with_config(self.local_peer_id, store, kad_config);
        if kad_cfg.server_mode {
            kademlia.set_mode(Some(KadMode::Server));
        }

        let identify = identify::Behaviour::new(identify::Config::new(
            "/tally/1.0.0".to_string(),
            self.keypair.public(),
        ));

        let behaviour = TallyBehaviour {
            gossipsub,
            kademlia,
            identify,
        };

        let idle_timeout = self.config.transport.idle_timeout;
        let swarm = SwarmBuilder::with_existing_identity(self.keypair.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NetworkError::Config(format!("TCP transport error: {}", e)))?
            .with_quic()
            .with_behaviour(|_| behaviour)
            .map_err(|e| NetworkError::Config(format!("Behaviour error: {}", e)))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
            .build();

        Ok(swarm)
    }

    /// Stop the swarm
    pub async fn stop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(SwarmCommand::Shutdown).await;
        }
    }

    pub fn is_running(&self) -> bool {
        *self.is_running.read()
    }

    pub fn local_peer_id(&self) -> PeerId {
        to_core_peer_id(&self.local_peer_id)
    }

    /// Handle for a started runtime
    pub fn handle(&self) -> crate::error::Result<SwarmHandle> {
        let command_tx = self.command_tx.clone().ok_or(NetworkError::NotInitialized)?;
        Ok(SwarmHandle {
            command_tx,
            local_peer_id: self.local_peer_id(),
        })
    }

    /// Subscribe to network events
    pub fn event_receiver(&self) -> broadcast::Receiver<SwarmNetworkEvent> {
        self.event_tx.subscribe()
    }

    /// Last stats snapshot published by the event loop
    pub fn stats(&self) -> SwarmStats {
        self.stats.read().clone()
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

struct PendingProviders {
    found: HashSet<libp2p::PeerId>,
    reply: Reply<Vec<PeerAddrInfo>>,
}

struct EventLoop {
    swarm: Swarm<TallyBehaviour>,
    command_rx: mpsc::Receiver<SwarmCommand>,
    event_tx: broadcast::Sender<SwarmNetworkEvent>,
    stats: Arc<RwLock<SwarmStats>>,
    subscriptions: HashSet<String>,
    pending_dials: HashMap<libp2p::PeerId, Vec<Reply<()>>>,
    pending_providers: HashMap<QueryId, PendingProviders>,
}

impl EventLoop {
    async fn run(mut self) {
        let start_time = std::time::Instant::now();
        let mut stats_tick = tokio::time::interval(Duration::from_secs(10));

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(SwarmCommand::Shutdown) | None => {
                        info!("Swarm shutdown requested");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd, start_time),
                },

                _ = stats_tick.tick() => {
                    self.refresh_stats(start_time);
                }
            }
        }

        info!("Swarm event loop terminated");
    }

    fn refresh_stats(&mut self, start_time: std::time::Instant) {
        let connected = self.swarm.connected_peers().count();
        let table_size: usize = self
            .swarm
            .behaviour_mut()
            .kademlia
            .kbuckets()
            .map(|bucket| bucket.num_entries())
            .sum();
        let mut s = self.stats.write();
        s.connected_peers = connected;
        s.routing_table_size = table_size;
        s.uptime_secs = start_time.elapsed().as_secs();
    }

    fn emit(&self, event: SwarmNetworkEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    /// Routing table contents with known addresses
    fn routing_table(&mut self) -> Vec<PeerAddrInfo> {
        let mut peers = Vec::new();
        for bucket in self.swarm.behaviour_mut().kademlia.kbuckets() {
            for entry in bucket.iter() {
                let addresses = entry.node.value.iter().map(|a| a.to_string()).collect();
                peers.push(PeerAddrInfo::new(
                    to_core_peer_id(entry.node.key.preimage()),
                    addresses,
                ));
            }
        }
        peers
    }

    fn finish_providers(&mut self, id: QueryId, outcome: std::result::Result<(), String>) {
        let Some(pending) = self.pending_providers.remove(&id) else {
            return;
        };
        let result = match outcome {
            Err(e) if pending.found.is_empty() => Err(NetworkError::Dht(e)),
            _ => {
                let known: HashMap<PeerId, Vec<String>> = self
                    .routing_table()
                    .into_iter()
                    .map(|info| (info.peer_id, info.addresses))
                    .collect();
                Ok(pending
                    .found
                    .iter()
                    .map(|p| {
                        let id = to_core_peer_id(p);
                        let addrs = known.get(&id).cloned().unwrap_or_default();
                        PeerAddrInfo::new(id, addrs)
                    })
                    .collect())
            }
        };
        let _ = pending.reply.send(result);
    }

    /// Handle swarm events
    fn handle_swarm_event(&mut self, event: SwarmEvent<TallyBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(TallyBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let topic = message.topic.to_string();
                let source = message.source.unwrap_or(propagation_source);
                debug!("Received gossip message on '{}' from {}", topic, source);

                {
                    let mut s = self.stats.write();
                    s.messages_received += 1;
                    s.bytes_received += message.data.len() as u64;
                }

                self.emit(SwarmNetworkEvent::GossipMessage {
                    topic,
                    data: message.data,
                    source: to_core_peer_id(&source),
                });
            }

            SwarmEvent::Behaviour(TallyBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) => {
                debug!("Peer {} subscribed to {}", peer_id, topic);
            }

            SwarmEvent::Behaviour(TallyBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed {
                    id,
                    result: kad::QueryResult::GetProviders(result),
                    step,
                    ..
                },
            )) => match result {
                Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                    if let Some(pending) = self.pending_providers.get_mut(&id) {
                        pending.found.extend(providers);
                    }
                    if step.last {
                        self.finish_providers(id, Ok(()));
                    }
                }
                Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {
                    self.finish_providers(id, Ok(()));
                }
                Err(e) => {
                    debug!("Provider query failed: {}", e);
                    self.finish_providers(id, Err(e.to_string()));
                }
            },

            SwarmEvent::Behaviour(TallyBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed {
                    result: kad::QueryResult::Bootstrap(result),
                    ..
                },
            )) => match result {
                Ok(ok) => debug!("Bootstrap step, {} buckets remaining", ok.num_remaining),
                Err(e) => warn!("Bootstrap query failed: {}", e),
            },

            SwarmEvent::Behaviour(TallyBehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer,
                is_new_peer,
                ..
            })) => {
                if is_new_peer {
                    debug!("Routing table added {}", peer);
                }
            }

            SwarmEvent::Behaviour(TallyBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(
                    "Identified peer {}: {} {:?}",
                    peer_id, info.protocol_version, info.listen_addrs
                );
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                }
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                if let Some(replies) = self.pending_dials.remove(&peer_id) {
                    for reply in replies {
                        let _ = reply.send(Ok(()));
                    }
                }
                if num_established.get() == 1 {
                    info!("Connected to peer {} via {:?}", peer_id, endpoint.get_remote_address());
                    self.emit(SwarmNetworkEvent::PeerConnected {
                        peer_id: to_core_peer_id(&peer_id),
                    });
                }
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                debug!("Outgoing connection to {} failed: {}", peer_id, error);
                if let Some(replies) = self.pending_dials.remove(&peer_id) {
                    let reason = error.to_string();
                    for reply in replies {
                        let _ = reply.send(Err(NetworkError::DialFailed {
                            peer: to_core_peer_id(&peer_id),
                            reason: reason.clone(),
                        }));
                    }
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    info!("Disconnected from peer {}", peer_id);
                    self.emit(SwarmNetworkEvent::PeerDisconnected {
                        peer_id: to_core_peer_id(&peer_id),
                    });
                }
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }

            _ => {}
        }
    }

    /// Handle commands
    fn handle_command(&mut self, cmd: SwarmCommand, start_time: std::time::Instant) {
        match cmd {
            SwarmCommand::Subscribe { topic, reply } => {
                let ident_topic = IdentTopic::new(&topic);
                let result = match self.swarm.behaviour_mut().gossipsub.subscribe(&ident_topic) {
                    Ok(_) => {
                        self.subscriptions.insert(topic.clone());
                        self.stats.write().active_subscriptions =
                            self.subscriptions.iter().cloned().collect();
                        info!("Subscribed to topic: {}", topic);
                        Ok(())
                    }
                    Err(e) => Err(NetworkError::Subscribe(format!("{}: {:?}", topic, e))),
                };
                let _ = reply.send(result);
            }

            SwarmCommand::Publish { topic, data, reply } => {
                let len = data.len() as u64;
                let ident_topic = IdentTopic::new(&topic);
                let result = match self.swarm.behaviour_mut().gossipsub.publish(ident_topic, data) {
                    Ok(_) => {
                        let mut s = self.stats.write();
                        s.messages_published += 1;
                        s.bytes_sent += len;
                        debug!("Published {} bytes to {}", len, topic);
                        Ok(())
                    }
                    Err(e) => Err(NetworkError::Publish(format!("{}: {:?}", topic, e))),
                };
                let _ = reply.send(result);
            }

            SwarmCommand::Dial {
                peer_id,
                addrs,
                reply,
            } => {
                if self.swarm.is_connected(&peer_id) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let opts = if addrs.is_empty() {
                    DialOpts::peer_id(peer_id).build()
                } else {
                    DialOpts::peer_id(peer_id)
                        .addresses(addrs)
                        .extend_addresses_through_behaviour()
                        .build()
                };
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        debug!("Dialing {}", peer_id);
                        self.pending_dials.entry(peer_id).or_default().push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NetworkError::DialFailed {
                            peer: to_core_peer_id(&peer_id),
                            reason: e.to_string(),
                        }));
                    }
                }
            }

            SwarmCommand::Disconnect { peer_id, reply } => {
                let result = self
                    .swarm
                    .disconnect_peer_id(peer_id)
                    .map_err(|_| NetworkError::NotConnected(to_core_peer_id(&peer_id)));
                if result.is_ok() {
                    info!("Disconnecting from {}", peer_id);
                }
                let _ = reply.send(result);
            }

            SwarmCommand::Bootstrap { seeds, reply } => {
                let kademlia = &mut self.swarm.behaviour_mut().kademlia;
                for (peer_id, addrs) in seeds {
                    for addr in addrs {
                        kademlia.add_address(&peer_id, addr);
                    }
                }
                match kademlia.bootstrap() {
                    Ok(_) => {
                        self.stats.write().dht_queries += 1;
                        info!("DHT bootstrap started");
                    }
                    Err(e) => warn!("DHT bootstrap skipped: {}", e),
                }
                let _ = reply.send(Ok(()));
            }

            SwarmCommand::RoutingTablePeers { reply } => {
                let _ = reply.send(Ok(self.routing_table()));
            }

            SwarmCommand::StartProviding { key, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(kad::RecordKey::new(&key))
                    .map(|_| debug!("Providing {}", hex::encode(&key)))
                    .map_err(|e| NetworkError::Dht(e.to_string()));
                let _ = reply.send(result);
            }

            SwarmCommand::GetProviders { key, reply } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(kad::RecordKey::new(&key));
                self.stats.write().dht_queries += 1;
                self.pending_providers.insert(
                    id,
                    PendingProviders {
                        found: HashSet::new(),
                        reply,
                    },
                );
            }

            SwarmCommand::GetStats { reply } => {
                self.refresh_stats(start_time);
                let _ = reply.send(Ok(self.stats.read().clone()));
            }

            SwarmCommand::Shutdown => {
                // Handled in run
            }
        }
    }
}

// ============================================================================
// SWARM HANDLE
// ============================================================================

/// Cloneable handle to a running swarm
#[derive(Clone, Debug)]
pub struct SwarmHandle {
    command_tx: mpsc::Sender<SwarmCommand>,
    local_peer_id: PeerId,
}

impl SwarmHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SwarmCommand) -> crate::error::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|e| NetworkError::Channel(e.to_string()))?;
        rx.await
            .map_err(|_| NetworkError::Channel("swarm dropped the reply".to_string()))?
    }

    /// Subscribe to a gossip topic
    pub async fn subscribe(&self, topic: &str) -> crate::error::Result<()> {
        let topic = topic.to_string();
        self.request(|reply| SwarmCommand::Subscribe { topic, reply })
            .await
    }

    pub async fn stats(&self) -> crate::error::Result<SwarmStats> {
        self.request(|reply| SwarmCommand::GetStats { reply }).await
    }

    /// Ask the event loop to exit
    pub async fn shutdown(&self) -> crate::error::Result<()> {
        self.command_tx
            .send(SwarmCommand::Shutdown)
            .await
            .map_err(|e| NetworkError::Channel(e.to_string()))
    }
}

#[async_trait]
impl Dialer for SwarmHandle {
    async fn dial(&self, peer: &PeerAddrInfo) -> crate::error::Result<()> {
        let peer_id = to_libp2p_peer_id(&peer.peer_id)?;
        let addrs = to_multiaddrs(&peer.addresses);
        self.request(|reply| SwarmCommand::Dial {
            peer_id,
            addrs,
            reply,
        })
        .await
    }

    async fn close(&self, peer: &PeerId) -> crate::error::Result<()> {
        let peer_id = to_libp2p_peer_id(peer)?;
        self.request(|reply| SwarmCommand::Disconnect { peer_id, reply })
            .await
    }
}

#[async_trait]
impl PeerRouting for SwarmHandle {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id.clone()
    }

    async fn bootstrap(&self, seeds: &[PeerAddrInfo]) -> crate::error::Result<()> {
        let mut parsed = Vec::with_capacity(seeds.len());
        for seed in seeds {
            parsed.push((to_libp2p_peer_id(&seed.peer_id)?, to_multiaddrs(&seed.addresses)));
        }
        self.request(|reply| SwarmCommand::Bootstrap {
            seeds: parsed,
            reply,
        })
        .await
    }

    async fn routing_table_peers(&self) -> crate::error::Result<Vec<PeerAddrInfo>> {
        self.request(|reply| SwarmCommand::RoutingTablePeers { reply })
            .await
    }

    async fn provide(&self, key: &[u8]) -> crate::error::Result<()> {
        let key = key.to_vec();
        self.request(|reply| SwarmCommand::StartProviding { key, reply })
            .await
    }

    async fn find_providers(&self, key: &[u8]) -> crate::error::Result<Vec<PeerAddrInfo>> {
        let key = key.to_vec();
        self.request(|reply| SwarmCommand::GetProviders { key, reply })
            .await
    }
}

#[async_trait]
impl Publisher for SwarmHandle {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> crate::error::Result<()> {
        let topic = topic.to_string();
        self.request(|reply| SwarmCommand::Publish { topic, data, reply })
            .await
    }
}

// ============================================================================
// TESTS
// ============================================================================
