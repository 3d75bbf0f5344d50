//! # Tally Node
//!
//! Validation node: libp2p swarm, self-managing peer mesh, voting system,
//! Prometheus metrics and layered configuration.

pub mod config;
pub mod metrics;
pub mod node;

pub use config::NodeConfig;
pub use metrics::{MetricsServer, NodeMetrics};
pub use node::{IncomingVoteRequest, NodeParts, NodeState, TallyNode};
pub use tally_consensus::VALIDATION_TOPIC;
