//! # Tally Network Layer
//!
//! Self-managing peer mesh for the validation network.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      TALLY NETWORK LAYER                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  Discovery   │  │  Connection  │  │   Message    │           │
//! │  │ Coordinator  │─►│   Manager    │  │   Envelope   │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────┘           │
//! │         │                 │                                     │
//! │         └──────┬──────────┘                                     │
//! │                ▼                                                │
//! │        ┌──────────────┐      ┌──────────────────────────┐       │
//! │        │ PeerTopology │      │  Transport ports         │       │
//! │        │ (one table)  │      │  Dialer / Routing / Pub  │       │
//! │        └──────────────┘      └────────────┬─────────────┘       │
//! │                                           │                     │
//! │                              ┌────────────┴─────────────┐       │
//! │                              │  SwarmRuntime (libp2p)   │       │
//! │                              │  Kademlia + GossipSub    │       │
//! │                              └──────────────────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Defaults
//!
//! | Setting | Value |
//! |---------|-------|
//! | max / min connections | 50 / 5 |
//! | connect timeout | 30s |
//! | prune interval / stale threshold | 5min / 1h |
//! | discovery interval | 1min |
//! | provider query timeout | 30s |
//! | namespace | `p2p-market-data` |

pub mod connection;
pub mod discovery;
pub mod error;
pub mod message;
pub mod swarm;
pub mod topology;
pub mod transport;

// Re-exports
pub use connection::{ConnectionConfig, ConnectionManager};
pub use discovery::{DiscoveryConfig, DiscoveryCoordinator, DiscoveryReport, DEFAULT_NAMESPACE};
pub use error::{NetworkError, Result};
pub use message::{MessageType, NetworkMessage};
pub use swarm::{
    parse_peer_multiaddr, SwarmCommand, SwarmConfig, SwarmHandle, SwarmNetworkEvent, SwarmRuntime,
    SwarmStats,
};
pub use topology::{ConnectionEvents, DiscoveryFeed, PeerTopology, TopologyStats};
pub use transport::{Dialer, PeerRouting, Publisher, TransportConfig};
