//! Voting counters and latency tracking

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smoothing factor of the latency moving average
const LATENCY_ALPHA: f64 = 0.1;

/// Snapshot of voting activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VotingStats {
    /// Sessions currently indexed, grace window included
    pub active_sessions: usize,
    pub sessions_started: u64,
    pub sessions_complete: u64,
    pub sessions_failed: u64,
    /// Exponentially smoothed time-to-conclusion
    pub average_latency: Duration,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    sessions_started: u64,
    sessions_complete: u64,
    sessions_failed: u64,
    average_latency: Duration,
    last_update: Option<DateTime<Utc>>,
}

/// Voting metrics, shared with whoever reports them
#[derive(Default)]
pub struct VotingMetrics {
    inner: RwLock<Counters>,
}

impl VotingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_sessions_started(&self) {
        let mut c = self.inner.write();
        c.sessions_started += 1;
        c.last_update = Some(Utc::now());
    }

    pub fn increment_sessions_complete(&self) {
        let mut c = self.inner.write();
        c.sessions_complete += 1;
        c.last_update = Some(Utc::now());
    }

    pub fn increment_sessions_failed(&self) {
        let mut c = self.inner.write();
        c.sessions_failed += 1;
        c.last_update = Some(Utc::now());
    }

    /// Fold one observed latency into the moving average
    pub fn update_average_latency(&self, latency: Duration) {
        let mut c = self.inner.write();
        let smoothed = c.average_latency.as_secs_f64() * (1.0 - LATENCY_ALPHA)
            + latency.as_secs_f64() * LATENCY_ALPHA;
        c.average_latency = Duration::from_secs_f64(smoothed);
        c.last_update = Some(Utc::now());
    }

    pub fn stats(&self, active_sessions: usize) -> VotingStats {
        let c = self.inner.read();
        VotingStats {
            active_sessions,
            sessions_started: c.sessions_started,
            sessions_complete: c.sessions_complete,
            sessions_failed: c.sessions_failed,
            average_latency: c.average_latency,
            last_update: c.last_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = VotingMetrics::new();
        assert!(metrics.stats(0).last_update.is_none());

        metrics.increment_sessions_started();
        metrics.increment_sessions_started();
        metrics.increment_sessions_complete();
        metrics.increment_sessions_failed();

        let stats = metrics.stats(2);
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.sessions_started, 2);
        assert_eq!(stats.sessions_complete, 1);
        assert_eq!(stats.sessions_failed, 1);
        assert!(stats.last_update.is_some());
    }

    #[test]
    fn test_latency_moving_average() {
        let metrics = VotingMetrics::new();
        metrics.update_average_latency(Duration::from_secs(10));
        assert_eq!(metrics.stats(0).average_latency, Duration::from_secs(1));

        metrics.update_average_latency(Duration::from_secs(10));
        let avg = metrics.stats(0).average_latency.as_secs_f64();
        assert!((avg - 1.9).abs() < 1e-6);
    }
}
