//! # Voting System
//!
//! Runs voting rounds and routes incoming votes to them.
//!
//! ```text
//!  start_voting(item)
//!     │ index session (Conflict if one is active for item.id)
//!     │ publish VoteRequest on "validation"
//!     ▼
//!  select! ──► promise resolved ────► Ok(result)
//!     ├─────► timeout elapsed ──────► fail "voting timeout"   ► Err(Timeout)
//!     └─────► cancel token fired ───► fail "context cancelled" ► Err(Cancelled)
//!
//!  dropping the start_voting future also fails the round as "context cancelled"
//!
//!  submit_vote(vote) ──► session.add_vote ──► conclude if quorum reached
//! ```
//!
//! Concluded and failed sessions stay indexed for one voting timeout, then a
//! cleanup task removes them, provided the index still maps the id to the
//! same session.

use crate::error::{Result, VotingError};
use crate::messages::{VoteRequest, VALIDATION_TOPIC};
use crate::metrics::{VotingMetrics, VotingStats};
use crate::session::{
    SessionParams, VotingSession, VotingSessionDetails, VotingSessionInfo,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{MarketData, PeerId, Vote, VoteResult};
use tally_network::{MessageType, NetworkMessage, Publisher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REASON_TIMEOUT: &str = "voting timeout";
const REASON_CANCELLED: &str = "context cancelled";

/// Voting parameters. Changes apply to sessions opened afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VotingConfig {
    /// How long a round waits for quorum
    pub voting_timeout: Duration,

    /// Distinct validators required before a round can conclude
    pub min_voters: usize,

    /// Combined confidence needed to conclude, and the score needed to accept
    pub quorum: f64,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            voting_timeout: Duration::from_secs(30),
            min_voters: 3,
            quorum: 0.66,
        }
    }
}

impl VotingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.voting_timeout.is_zero() {
            return Err(VotingError::Validation("voting timeout must be positive".into()));
        }
        if self.min_voters == 0 {
            return Err(VotingError::Validation("minimum voters must be positive".into()));
        }
        if !(self.quorum > 0.0 && self.quorum <= 1.0) {
            return Err(VotingError::Validation(format!(
                "quorum must be in (0, 1], got {}",
                self.quorum
            )));
        }
        Ok(())
    }

    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            timeout: self.voting_timeout,
            min_voters: self.min_voters,
            quorum: self.quorum,
        }
    }
}

/// What ended a wait before the session concluded
#[derive(Clone, Copy, Debug)]
enum Interrupt {
    Timeout,
    Cancelled,
}

impl Interrupt {
    fn reason(self) -> &'static str {
        match self {
            Self::Timeout => REASON_TIMEOUT,
            Self::Cancelled => REASON_CANCELLED,
        }
    }

    fn into_error(self, result: VoteResult) -> VotingError {
        match self {
            Self::Timeout => VotingError::Timeout { result },
            Self::Cancelled => VotingError::Cancelled { result },
        }
    }
}

type SessionIndex = Arc<RwLock<HashMap<String, Arc<VotingSession>>>>;

/// Validation voting coordinator
pub struct VotingSystem {
    local_id: PeerId,
    publisher: Arc<dyn Publisher>,
    metrics: Arc<VotingMetrics>,
    config: RwLock<VotingConfig>,
    sessions: SessionIndex,
}

impl VotingSystem {
    /// Create a voting system that broadcasts through `publisher` and
    /// records into `metrics`
    pub fn new(
        local_id: PeerId,
        config: VotingConfig,
        publisher: Arc<dyn Publisher>,
        metrics: Arc<VotingMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            local_id,
            publisher,
            metrics,
            config: RwLock::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Run one voting round for `item` and wait for its result.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start_voting(
        &self,
        cancel: &CancellationToken,
        item: MarketData,
    ) -> Result<VoteResult> {
        item.validate()?;

        let params = self.config.read().session_params();
        let (session, mut outcome) = VotingSession::new(item.id.clone(), params);
        let session = Arc::new(session);

        {
            let mut sessions = self.sessions.write();
            if sessions.get(&item.id).is_some_and(|s| s.is_active()) {
                return Err(VotingError::Conflict(item.id));
            }
            // A concluded session still in its grace window is replaced.
            sessions.insert(item.id.clone(), Arc::clone(&session));
        }
        let _guard = SessionGuard {
            system: self,
            session: Arc::clone(&session),
        };
        self.metrics.increment_sessions_started();

        info!(
            market_data_id = %item.id,
            symbol = %item.symbol,
            min_voters = params.min_voters,
            quorum = params.quorum,
            "Voting session started"
        );

        if let Err(e) = self.broadcast_vote_request(&session).await {
            let reason = format!("broadcasting vote request: {e}");
            let result = self
                .fail_session(&session, &reason)
                .or_else(|| session.result())
                .unwrap_or_else(|| VoteResult::failed(session.id(), session.vote_count(), &reason));
            return Err(VotingError::Broadcast {
                reason: e.to_string(),
                result,
            });
        }

        let interrupt = tokio::select! {
            delivered = &mut outcome => {
                let result = Self::recorded_result(&session, delivered, REASON_TIMEOUT);
                return if result.is_failure() {
                    Err(VotingError::Timeout { result })
                } else {
                    Ok(result)
                };
            }
            _ = tokio::time::sleep(params.timeout) => Interrupt::Timeout,
            _ = cancel.cancelled() => Interrupt::Cancelled,
        };

        self.fail_session(&session, interrupt.reason());

        // The session may have concluded just before the failure attempt.
        let result = Self::recorded_result(&session, outcome.await, interrupt.reason());
        if result.is_failure() {
            Err(interrupt.into_error(result))
        } else {
            Ok(result)
        }
    }

    /// Run one round per item concurrently.
    ///
    /// Waits for every round. If any failed, the first failure in input
    /// order is returned and all results are discarded.
    pub async fn batch_voting(
        &self,
        cancel: &CancellationToken,
        items: Vec<MarketData>,
    ) -> Result<Vec<VoteResult>> {
        let attempts = items.into_iter().map(|item| self.start_voting(cancel, item));
        let outcomes = join_all(attempts).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    return Err(VotingError::Batch {
                        index,
                        source: Box::new(e),
                    })
                }
            }
        }
        Ok(results)
    }

    /// Route a vote to its session and conclude the session if quorum is
    /// reached.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit_vote(&self, vote: Vote) -> Result<()> {
        vote.validate()?;

        let session = self
            .sessions
            .read()
            .get(&vote.market_data_id)
            .cloned()
            .ok_or_else(|| VotingError::SessionNotFound(vote.market_data_id.clone()))?;

        debug!(
            market_data_id = %vote.market_data_id,
            validator = %vote.validator_id,
            is_valid = vote.is_valid,
            confidence = vote.confidence,
            "Vote received"
        );
        session.add_vote(vote)?;

        if session.should_conclude() {
            self.conclude_session(&session);
        }
        Ok(())
    }

    /// Replace the voting parameters for future sessions
    pub fn update_config(&self, config: VotingConfig) -> Result<()> {
        config.validate()?;
        info!(
            timeout = ?config.voting_timeout,
            min_voters = config.min_voters,
            quorum = config.quorum,
            "Voting system configuration updated"
        );
        *self.config.write() = config;
        Ok(())
    }

    pub fn config(&self) -> VotingConfig {
        self.config.read().clone()
    }

    pub fn metrics(&self) -> Arc<VotingMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn stats(&self) -> VotingStats {
        let indexed = self.sessions.read().len();
        self.metrics.stats(indexed)
    }

    /// Summaries of every indexed session, sorted by id
    pub fn active_sessions(&self) -> Vec<VotingSessionInfo> {
        let mut infos: Vec<_> = self.sessions.read().values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn session_details(&self, id: &str) -> Result<VotingSessionDetails> {
        self.session(id).map(|s| s.details())
    }

    /// Result of a completed session that is still indexed
    pub fn vote_result(&self, id: &str) -> Result<VoteResult> {
        let session = self.session(id)?;
        match session.result() {
            Some(result) if !result.is_failure() => Ok(result),
            _ => Err(VotingError::NotComplete(id.to_string())),
        }
    }

    fn session(&self, id: &str) -> Result<Arc<VotingSession>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| VotingError::SessionNotFound(id.to_string()))
    }

    async fn broadcast_vote_request(&self, session: &VotingSession) -> tally_network::Result<()> {
        let params = session.params();
        let request = VoteRequest {
            market_data_id: session.id().to_string(),
            deadline: deadline_after(params.timeout),
            min_votes: params.min_voters,
        };

        let msg = NetworkMessage::with_body(self.local_id.clone(), MessageType::VoteRequest, &request)?;
        self.publisher.publish(VALIDATION_TOPIC, msg.encode()?).await?;

        debug!(market_data_id = %session.id(), msg_id = %msg.short_id(), "Vote request broadcast");
        Ok(())
    }

    fn conclude_session(&self, session: &Arc<VotingSession>) {
        let Some(result) = session.conclude() else {
            return;
        };

        self.metrics.increment_sessions_complete();
        self.metrics.update_average_latency(session.elapsed());

        info!(
            market_data_id = %result.market_data_id,
            accepted = result.accepted,
            score = result.score,
            votes = result.vote_count,
            "Voting session complete"
        );
        self.schedule_cleanup(session);
    }

    fn fail_session(&self, session: &Arc<VotingSession>, reason: &str) -> Option<VoteResult> {
        let result = session.fail(reason)?;

        self.metrics.increment_sessions_failed();
        warn!(
            market_data_id = %session.id(),
            reason,
            votes = result.vote_count,
            "Voting session failed"
        );
        self.schedule_cleanup(session);
        Some(result)
    }

    /// Drop the session from the index after its grace window
    fn schedule_cleanup(&self, session: &Arc<VotingSession>) {
        let sessions = Arc::clone(&self.sessions);
        let session = Arc::clone(session);
        let grace = session.params().timeout;

        // Guards can fire from a drop outside any runtime.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            remove_if_current(&sessions, &session);
            return;
        };
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            remove_if_current(&sessions, &session);
        });
    }

    fn recorded_result(
        session: &VotingSession,
        delivered: Option<VoteResult>,
        reason: &str,
    ) -> VoteResult {
        delivered
            .or_else(|| session.result())
            .unwrap_or_else(|| VoteResult::failed(session.id(), session.vote_count(), reason))
    }
}

/// Fails the session when the waiting `start_voting` call is dropped
/// before it resolved
struct SessionGuard<'a> {
    system: &'a VotingSystem,
    session: Arc<VotingSession>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.session.is_active() {
            self.system.fail_session(&self.session, REASON_CANCELLED);
        }
    }
}

fn remove_if_current(sessions: &SessionIndex, session: &Arc<VotingSession>) {
    let mut index = sessions.write();
    if index.get(session.id()).is_some_and(|s| Arc::ptr_eq(s, session)) {
        index.remove(session.id());
        debug!(market_data_id = %session.id(), "Voting session removed");
    }
}

fn deadline_after(timeout: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tally_core::DataType;
    use tally_network::NetworkError;

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, data: Vec<u8>) -> tally_network::Result<()> {
            self.sent.lock().push((topic.to_string(), data));
            Ok(())
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(&self, _topic: &str, _data: Vec<u8>) -> tally_network::Result<()> {
            Err(NetworkError::Publish("no peers subscribed".into()))
        }
    }

    fn item() -> MarketData {
        MarketData::new("AAPL", 189.5, 1_000.0, "nasdaq", DataType::Eod)
    }

    fn system(publisher: Arc<dyn Publisher>, min_voters: usize, quorum: f64) -> VotingSystem {
        let config = VotingConfig {
            voting_timeout: Duration::from_secs(30),
            min_voters,
            quorum,
        };
        VotingSystem::new(PeerId::new("local"), config, publisher, Arc::new(VotingMetrics::new()))
            .unwrap()
    }

    fn signed(id: &str, validator: &str, is_valid: bool, confidence: f64) -> Vote {
        Vote::new(id, PeerId::new(validator), is_valid, confidence).with_signature(vec![1; 64])
    }

    #[test]
    fn test_config_validation() {
        assert!(VotingConfig::default().validate().is_ok());

        let bad = [
            VotingConfig { voting_timeout: Duration::ZERO, ..Default::default() },
            VotingConfig { min_voters: 0, ..Default::default() },
            VotingConfig { quorum: 0.0, ..Default::default() },
            VotingConfig { quorum: 1.5, ..Default::default() },
            VotingConfig { quorum: f64::NAN, ..Default::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(VotingError::Validation(_))));
        }
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let vs = system(Arc::new(RecordingPublisher::default()), 3, 0.66);
        let before = vs.config();
        let err = vs
            .update_config(VotingConfig { min_voters: 0, ..Default::default() })
            .unwrap_err();
        assert_eq!(err.kind(), tally_core::ErrorKind::Validation);
        assert_eq!(vs.config(), before);

        let next = VotingConfig { min_voters: 5, ..Default::default() };
        vs.update_config(next.clone()).unwrap();
        assert_eq!(vs.config(), next);
    }

    #[test]
    fn test_submit_vote_validation_before_lookup() {
        let vs = system(Arc::new(RecordingPublisher::default()), 1, 0.5);

        let unsigned = Vote::new("unknown", PeerId::new("v"), true, 0.5);
        assert!(matches!(vs.submit_vote(unsigned), Err(VotingError::Validation(_))));

        let err = vs.submit_vote(signed("unknown", "v", true, 0.5)).unwrap_err();
        assert_eq!(err, VotingError::SessionNotFound("unknown".into()));
    }

    #[tokio::test]
    async fn test_invalid_item_rejected_before_state_change() {
        let publisher = Arc::new(RecordingPublisher::default());
        let vs = system(publisher.clone(), 1, 0.5);

        let mut bad = item();
        bad.symbol.clear();
        let err = vs.start_voting(&CancellationToken::new(), bad).await.unwrap_err();
        assert!(matches!(err, VotingError::Validation(_)));
        assert_eq!(vs.stats().sessions_started, 0);
        assert!(publisher.sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_failure_fails_session() {
        let vs = system(Arc::new(FailingPublisher), 1, 0.5);
        let data = item();
        let id = data.id.clone();

        let err = vs.start_voting(&CancellationToken::new(), data).await.unwrap_err();
        assert_eq!(err.kind(), tally_core::ErrorKind::Transport);

        let result = err.result().unwrap();
        assert!(!result.accepted);
        assert!(result
            .error_msg
            .as_deref()
            .unwrap()
            .starts_with("broadcasting vote request"));

        assert!(matches!(vs.vote_result(&id), Err(VotingError::NotComplete(_))));
        assert_eq!(vs.stats().sessions_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vote_request_envelope() {
        let publisher = Arc::new(RecordingPublisher::default());
        let vs = Arc::new(system(publisher.clone(), 1, 0.5));
        let data = item();
        let id = data.id.clone();

        let runner = Arc::clone(&vs);
        let handle = tokio::spawn(async move {
            runner.start_voting(&CancellationToken::new(), data).await
        });
        while publisher.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        {
            let sent = publisher.sent.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, VALIDATION_TOPIC);
            let msg = NetworkMessage::decode(&sent[0].1).unwrap();
            assert_eq!(msg.message_type, MessageType::VoteRequest);
            assert_eq!(msg.sender, PeerId::new("local"));
            let request: VoteRequest = msg.body().unwrap();
            assert_eq!(request.market_data_id, id);
            assert_eq!(request.min_votes, 1);
        }

        vs.submit_vote(signed(&id, "v1", true, 1.0)).unwrap();
        let result = handle.await.unwrap().unwrap();
        assert!(result.accepted);
        assert_eq!(vs.vote_result(&id).unwrap(), result);
    }

    #[test]
    fn test_deadline_saturates() {
        assert_eq!(deadline_after(Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(deadline_after(Duration::from_secs(30)) > Utc::now());
    }
}
