//! Node configuration types
//!
//! Loaded from a TOML file, then overridden by `TALLY__SECTION__KEY`
//! environment variables (for example `TALLY__VOTING__MIN_VOTERS=5`).
//! Durations are whole seconds.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tally_consensus::VotingConfig;
use tally_network::{
    parse_peer_multiaddr, ConnectionConfig, DiscoveryConfig, SwarmConfig, TransportConfig,
    DEFAULT_NAMESPACE,
};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "TALLY";

/// Complete node configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity
    #[serde(default)]
    pub node: NodeSettings,

    /// Network settings
    #[serde(default)]
    pub network: NetworkSettings,

    /// Voting parameters
    #[serde(default)]
    pub voting: VotingSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Basic node settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node name
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Hex-encoded 32-byte identity seed; a fresh identity per run if unset
    #[serde(default)]
    pub identity_seed: Option<String>,
}

fn default_node_name() -> String {
    "tally-node".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            identity_seed: None,
        }
    }
}

/// Network settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Multiaddrs to listen on
    #[serde(default = "default_listen_addresses")]
    pub listen_addresses: Vec<String>,

    /// Also listen on QUIC
    #[serde(default = "default_true")]
    pub enable_quic: bool,

    /// Seed peers, as `/ip4/.../tcp/.../p2p/<peer id>` multiaddrs
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// DHT namespace nodes advertise under
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,

    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,

    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    #[serde(default = "default_provider_query_timeout")]
    pub provider_query_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_listen_addresses() -> Vec<String> {
    vec!["/ip4/0.0.0.0/tcp/4001".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_max_connections() -> usize {
    50
}

fn default_min_connections() -> usize {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_prune_interval() -> u64 {
    5 * 60
}

fn default_stale_threshold() -> u64 {
    60 * 60
}

fn default_discovery_interval() -> u64 {
    60
}

fn default_provider_query_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    300
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_addresses: default_listen_addresses(),
            enable_quic: true,
            bootstrap_peers: Vec::new(),
            namespace: default_namespace(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            prune_interval_secs: default_prune_interval(),
            stale_threshold_secs: default_stale_threshold(),
            discovery_interval_secs: default_discovery_interval(),
            provider_query_timeout_secs: default_provider_query_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Voting parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VotingSettings {
    #[serde(default = "default_voting_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_min_voters")]
    pub min_voters: usize,

    /// In (0, 1]
    #[serde(default = "default_quorum")]
    pub quorum: f64,
}

fn default_voting_timeout() -> u64 {
    30
}

fn default_min_voters() -> usize {
    3
}

fn default_quorum() -> f64 {
    0.66
}

impl Default for VotingSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_voting_timeout(),
            min_voters: default_min_voters(),
            quorum: default_quorum(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Metrics configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics address
    #[serde(default = "default_metrics_address")]
    pub address: String,

    /// How often gauges are refreshed from the voting system and topology
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9615".to_string()
}

fn default_refresh_interval() -> u64 {
    15
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

impl NodeConfig {
    /// Load from `path` (if given) with environment overrides, then validate
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, as written by `tally init`
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> anyhow::Result<()> {
        let net = &self.network;
        if net.max_connections == 0 {
            anyhow::bail!("network.max_connections must be positive");
        }
        if net.min_connections > net.max_connections {
            anyhow::bail!(
                "network.min_connections ({}) exceeds max_connections ({})",
                net.min_connections,
                net.max_connections
            );
        }
        if net.namespace.is_empty() {
            anyhow::bail!("network.namespace must not be empty");
        }
        if net.listen_addresses.is_empty() {
            anyhow::bail!("network.listen_addresses must not be empty");
        }
        for (name, secs) in [
            ("connect_timeout_secs", net.connect_timeout_secs),
            ("prune_interval_secs", net.prune_interval_secs),
            ("stale_threshold_secs", net.stale_threshold_secs),
            ("discovery_interval_secs", net.discovery_interval_secs),
            ("provider_query_timeout_secs", net.provider_query_timeout_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("network.{} must be positive", name);
            }
        }
        for peer in &net.bootstrap_peers {
            parse_peer_multiaddr(peer).with_context(|| format!("bootstrap peer {}", peer))?;
        }

        self.voting_config()
            .validate()
            .context("invalid [voting] section")?;
        self.identity_seed()?;

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("logging.format must be text or json, got {}", other),
        }
        if self.metrics.enabled {
            self.metrics
                .address
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("metrics.address {}", self.metrics.address))?;
            if self.metrics.refresh_interval_secs == 0 {
                anyhow::bail!("metrics.refresh_interval_secs must be positive");
            }
        }
        Ok(())
    }

    /// Decoded identity seed
    pub fn identity_seed(&self) -> anyhow::Result<Option<[u8; 32]>> {
        let Some(seed) = &self.node.identity_seed else {
            return Ok(None);
        };
        let bytes = hex::decode(seed.trim()).context("node.identity_seed is not hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("node.identity_seed must be 32 bytes, got {}", b.len()))?;
        Ok(Some(seed))
    }

    pub fn voting_config(&self) -> VotingConfig {
        VotingConfig {
            voting_timeout: Duration::from_secs(self.voting.timeout_secs),
            min_voters: self.voting.min_voters,
            quorum: self.voting.quorum,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let net = &self.network;
        ConnectionConfig {
            max_connections: net.max_connections,
            min_connections: net.min_connections,
            connect_timeout: Duration::from_secs(net.connect_timeout_secs),
            prune_interval: Duration::from_secs(net.prune_interval_secs),
            stale_threshold: Duration::from_secs(net.stale_threshold_secs),
        }
    }

    pub fn discovery_config(&self) -> anyhow::Result<DiscoveryConfig> {
        let net = &self.network;
        let bootstrap_peers = net
            .bootstrap_peers
            .iter()
            .map(|p| parse_peer_multiaddr(p).with_context(|| format!("bootstrap peer {}", p)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(DiscoveryConfig {
            namespace: net.namespace.clone(),
            discovery_interval: Duration::from_secs(net.discovery_interval_secs),
            provider_query_timeout: Duration::from_secs(net.provider_query_timeout_secs),
            bootstrap_peers,
        })
    }

    pub fn swarm_config(&self) -> anyhow::Result<SwarmConfig> {
        Ok(SwarmConfig {
            transport: TransportConfig {
                listen_addresses: self.network.listen_addresses.clone(),
                enable_quic: self.network.enable_quic,
                idle_timeout: Duration::from_secs(self.network.idle_timeout_secs),
            },
            identity_seed: self.identity_seed()?,
            ..Default::default()
        })
    }
}
