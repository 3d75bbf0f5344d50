//! Prometheus metrics and the HTTP endpoint serving them

use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tally_consensus::VotingStats;
use tally_network::TopologyStats;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Node metrics registry
pub struct NodeMetrics {
    registry: Registry,

    sessions_active: IntGauge,
    sessions_started: IntGauge,
    sessions_complete: IntGauge,
    sessions_failed: IntGauge,
    average_latency: Gauge,

    peers_known: IntGauge,
    peers_connected: IntGauge,
    peers_trusted: IntGauge,

    votes_received: IntCounter,
    vote_requests_received: IntCounter,
    validations: IntCounterVec,
}

impl NodeMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let sessions_active = IntGauge::new(
            "tally_voting_sessions_active",
            "Voting sessions currently indexed",
        )?;
        let sessions_started =
            IntGauge::new("tally_voting_sessions_started", "Voting sessions started")?;
        let sessions_complete =
            IntGauge::new("tally_voting_sessions_complete", "Voting sessions that reached quorum")?;
        let sessions_failed =
            IntGauge::new("tally_voting_sessions_failed", "Voting sessions that failed")?;
        let average_latency = Gauge::new(
            "tally_voting_average_latency_seconds",
            "Smoothed time from session start to conclusion",
        )?;
        let peers_known = IntGauge::new("tally_peers_known", "Peers in the topology table")?;
        let peers_connected = IntGauge::new("tally_peers_connected", "Connected peers")?;
        let peers_trusted = IntGauge::new("tally_peers_trusted", "Peers at or above trusted reputation")?;
        let votes_received =
            IntCounter::new("tally_votes_received_total", "Vote responses received from the network")?;
        let vote_requests_received = IntCounter::new(
            "tally_vote_requests_received_total",
            "Vote requests received from the network",
        )?;
        let validations = IntCounterVec::new(
            Opts::new("tally_validations_total", "Local validation rounds by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(sessions_started.clone()))?;
        registry.register(Box::new(sessions_complete.clone()))?;
        registry.register(Box::new(sessions_failed.clone()))?;
        registry.register(Box::new(average_latency.clone()))?;
        registry.register(Box::new(peers_known.clone()))?;
        registry.register(Box::new(peers_connected.clone()))?;
        registry.register(Box::new(peers_trusted.clone()))?;
        registry.register(Box::new(votes_received.clone()))?;
        registry.register(Box::new(vote_requests_received.clone()))?;
        registry.register(Box::new(validations.clone()))?;

        Ok(Self {
            registry,
            sessions_active,
            sessions_started,
            sessions_complete,
            sessions_failed,
            average_latency,
            peers_known,
            peers_connected,
            peers_trusted,
            votes_received,
            vote_requests_received,
            validations,
        })
    }

    /// Copy the latest snapshots into the gauges
    pub fn refresh(&self, voting: &VotingStats, topology: &TopologyStats) {
        self.sessions_active.set(voting.active_sessions as i64);
        self.sessions_started.set(voting.sessions_started as i64);
        self.sessions_complete.set(voting.sessions_complete as i64);
        self.sessions_failed.set(voting.sessions_failed as i64);
        self.average_latency.set(voting.average_latency.as_secs_f64());

        self.peers_known.set(topology.total_peers as i64);
        self.peers_connected.set(topology.connected_peers as i64);
        self.peers_trusted.set(topology.trusted_peers as i64);
    }

    pub fn vote_received(&self) {
        self.votes_received.inc();
    }

    pub fn vote_request_received(&self) {
        self.vote_requests_received.inc();
    }

    /// Count a finished local validation: `accepted`, `rejected` or `failed`
    pub fn validation_finished(&self, outcome: &str) {
        self.validations.with_label_values(&[outcome]).inc();
    }

    /// Text exposition format
    pub fn gather(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Serves `/metrics` and `/health`
pub struct MetricsServer {
    listener: TcpListener,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, metrics: std::sync::Arc<NodeMetrics>, cancel: CancellationToken) {
        tracing::info!("Metrics server listening on {:?}", self.listener.local_addr().ok());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream, &metrics).await {
                                tracing::debug!("Metrics request failed: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }
    }
}

async fn serve(mut stream: TcpStream, metrics: &NodeMetrics) -> anyhow::Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let response = if request.starts_with("GET /metrics") {
        let body = metrics.gather()?;
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") {
        let body = "{\"status\":\"healthy\"}";
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn voting_stats() -> VotingStats {
        VotingStats {
            active_sessions: 2,
            sessions_started: 5,
            sessions_complete: 2,
            sessions_failed: 1,
            average_latency: Duration::from_millis(1500),
            last_update: None,
        }
    }

    fn topology_stats() -> TopologyStats {
        TopologyStats {
            total_peers: 9,
            connected_peers: 4,
            trusted_peers: 3,
            avg_reputation: 0.5,
        }
    }

    #[test]
    fn test_refresh_and_gather() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.refresh(&voting_stats(), &topology_stats());
        metrics.vote_received();
        metrics.validation_finished("accepted");

        let text = metrics.gather().unwrap();
        assert!(text.contains("tally_voting_sessions_started 5"));
        assert!(text.contains("tally_peers_connected 4"));
        assert!(text.contains("tally_voting_average_latency_seconds 1.5"));
        assert!(text.contains("tally_votes_received_total 1"));
        assert!(text.contains("tally_validations_total{outcome=\"accepted\"} 1"));
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_server_endpoints() {
        let metrics = Arc::new(NodeMetrics::new().unwrap());
        metrics.refresh(&voting_stats(), &topology_stats());

        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(metrics, cancel.clone()));

        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("tally_peers_known 9"));

        let response = get(addr, "/health").await;
        assert!(response.contains("healthy"));

        let response = get(addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        cancel.cancel();
        task.await.unwrap();
    }
}
