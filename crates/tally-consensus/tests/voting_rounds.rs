//! End-to-end voting rounds against an in-memory publisher with paused time.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tally_consensus::{
    SessionStatus, VoteRequest, VotingConfig, VotingError, VotingMetrics, VotingSystem,
};
use tally_core::{DataType, ErrorKind, MarketData, PeerId, Vote, VoteResult};
use tally_network::{NetworkMessage, Publisher};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MemoryPublisher {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryPublisher {
    fn count(&self) -> usize {
        self.sent.lock().len()
    }

    fn requests(&self) -> Vec<VoteRequest> {
        self.sent
            .lock()
            .iter()
            .map(|bytes| NetworkMessage::decode(bytes).unwrap().body().unwrap())
            .collect()
    }

    async fn wait_for(&self, n: usize) {
        while self.count() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, _topic: &str, data: Vec<u8>) -> tally_network::Result<()> {
        self.sent.lock().push(data);
        Ok(())
    }
}

const TIMEOUT: Duration = Duration::from_secs(30);

fn setup(min_voters: usize, quorum: f64) -> (Arc<VotingSystem>, Arc<MemoryPublisher>) {
    let publisher = Arc::new(MemoryPublisher::default());
    let config = VotingConfig {
        voting_timeout: TIMEOUT,
        min_voters,
        quorum,
    };
    let system = VotingSystem::new(
        PeerId::new("coordinator"),
        config,
        publisher.clone(),
        Arc::new(VotingMetrics::new()),
    )
    .unwrap();
    (Arc::new(system), publisher)
}

fn item(symbol: &str) -> MarketData {
    MarketData::new(symbol, 42.0, 500.0, "exchange", DataType::Eod)
}

fn vote(id: &str, validator: &str, is_valid: bool, confidence: f64) -> Vote {
    Vote::new(id, PeerId::new(validator), is_valid, confidence).with_signature(vec![0xab; 64])
}

fn spawn_round(
    system: &Arc<VotingSystem>,
    cancel: &CancellationToken,
    data: MarketData,
) -> JoinHandle<Result<VoteResult, VotingError>> {
    let system = Arc::clone(system);
    let cancel = cancel.clone();
    tokio::spawn(async move { system.start_voting(&cancel, data).await })
}

#[tokio::test(start_paused = true)]
async fn test_single_voter_accepts() {
    let (system, publisher) = setup(1, 0.5);
    let data = item("AAPL");
    let id = data.id.clone();

    let round = spawn_round(&system, &CancellationToken::new(), data);
    publisher.wait_for(1).await;
    system.submit_vote(vote(&id, "v1", true, 1.0)).unwrap();

    let result = round.await.unwrap().unwrap();
    assert!(result.accepted);
    assert_eq!(result.vote_count, 1);
    assert_eq!(result.score, 1.0);
    assert!(result.error_msg.is_none());

    let stats = system.stats();
    assert_eq!(stats.sessions_started, 1);
    assert_eq!(stats.sessions_complete, 1);
    assert_eq!(stats.sessions_failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_weighted_majority() {
    let (system, publisher) = setup(2, 0.6);
    let data = item("MSFT");
    let id = data.id.clone();

    let round = spawn_round(&system, &CancellationToken::new(), data);
    publisher.wait_for(1).await;
    system.submit_vote(vote(&id, "v1", true, 0.6)).unwrap();
    system.submit_vote(vote(&id, "v2", false, 0.4)).unwrap();

    let result = round.await.unwrap().unwrap();
    assert!(result.accepted);
    assert_eq!(result.vote_count, 2);
    assert!((result.score - 0.6).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_quorum_reached_but_rejected() {
    let (system, publisher) = setup(2, 0.6);
    let data = item("TSLA");
    let id = data.id.clone();

    let round = spawn_round(&system, &CancellationToken::new(), data);
    publisher.wait_for(1).await;
    system.submit_vote(vote(&id, "v1", true, 0.3)).unwrap();
    system.submit_vote(vote(&id, "v2", false, 0.7)).unwrap();

    let result = round.await.unwrap().unwrap();
    assert!(!result.accepted);
    assert!(result.error_msg.is_none());
    assert!((result.score - 0.3).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_votes() {
    let (system, publisher) = setup(3, 0.66);
    let data = item("IBM");
    let id = data.id.clone();

    let err = system
        .start_voting(&CancellationToken::new(), data)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    let result = err.result().unwrap();
    assert!(!result.accepted);
    assert_eq!(result.vote_count, 0);
    assert_eq!(result.error_msg.as_deref(), Some("voting timeout"));
    assert_eq!(publisher.count(), 1);

    // Still indexed during the grace window; late votes are refused.
    let sessions = system.active_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    let late = system.submit_vote(vote(&id, "v1", true, 1.0)).unwrap_err();
    assert_eq!(late, VotingError::SessionNotActive(id.clone()));
    assert_eq!(system.session_details(&id).unwrap().vote_count, 0);

    tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
    assert!(system.active_sessions().is_empty());
    let gone = system.submit_vote(vote(&id, "v1", true, 1.0)).unwrap_err();
    assert_eq!(gone.kind(), ErrorKind::NotFound);

    let stats = system.stats();
    assert_eq!(stats.sessions_failed, 1);
    assert_eq!(stats.active_sessions, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation() {
    let (system, publisher) = setup(3, 0.66);
    let data = item("NVDA");
    let id = data.id.clone();
    let cancel = CancellationToken::new();

    let round = spawn_round(&system, &cancel, data);
    publisher.wait_for(1).await;
    system.submit_vote(vote(&id, "v1", true, 0.5)).unwrap();
    cancel.cancel();

    let err = round.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    let result = err.result().unwrap();
    assert_eq!(result.vote_count, 1);
    assert_eq!(result.error_msg.as_deref(), Some("context cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_round_fails_and_frees_item() {
    let (system, publisher) = setup(3, 0.66);
    let data = item("TSLA");
    let id = data.id.clone();

    let waited = tokio::time::timeout(
        Duration::from_secs(1),
        system.start_voting(&CancellationToken::new(), data.clone()),
    )
    .await;
    assert!(waited.is_err());
    assert_eq!(publisher.count(), 1);

    assert_eq!(system.session_details(&id).unwrap().status, SessionStatus::Failed);
    assert_eq!(
        system.vote_result(&id).unwrap_err(),
        VotingError::NotComplete(id.clone())
    );
    let late = system.submit_vote(vote(&id, "v1", true, 1.0)).unwrap_err();
    assert_eq!(late, VotingError::SessionNotActive(id.clone()));
    assert_eq!(system.stats().sessions_failed, 1);

    tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
    assert!(system.active_sessions().is_empty());

    let round = spawn_round(&system, &CancellationToken::new(), data);
    publisher.wait_for(2).await;
    for validator in ["v1", "v2", "v3"] {
        system.submit_vote(vote(&id, validator, true, 0.9)).unwrap();
    }
    assert!(round.await.unwrap().unwrap().accepted);
    assert_eq!(system.stats().sessions_started, 2);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_round_fails() {
    let (system, publisher) = setup(3, 0.66);
    let data = item("NFLX");
    let id = data.id.clone();

    let round = spawn_round(&system, &CancellationToken::new(), data);
    publisher.wait_for(1).await;
    system.submit_vote(vote(&id, "v1", true, 0.5)).unwrap();

    round.abort();
    assert!(round.await.unwrap_err().is_cancelled());

    let details = system.session_details(&id).unwrap();
    assert_eq!(details.status, SessionStatus::Failed);
    assert_eq!(details.vote_count, 1);
    assert_eq!(system.stats().sessions_failed, 1);

    tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
    assert!(system.active_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_start_conflicts() {
    let (system, publisher) = setup(1, 0.5);
    let data = item("AMD");
    let id = data.id.clone();

    let round = spawn_round(&system, &CancellationToken::new(), data.clone());
    publisher.wait_for(1).await;

    let err = system
        .start_voting(&CancellationToken::new(), data)
        .await
        .unwrap_err();
    assert_eq!(err, VotingError::Conflict(id.clone()));
    assert_eq!(publisher.count(), 1);
    assert_eq!(system.active_sessions().len(), 1);
    assert_eq!(system.stats().sessions_started, 1);

    system.submit_vote(vote(&id, "v1", true, 1.0)).unwrap();
    assert!(round.await.unwrap().unwrap().accepted);
}

#[tokio::test(start_paused = true)]
async fn test_concluded_session_replaced_in_grace_window() {
    let (system, publisher) = setup(1, 0.5);
    let data = item("ORCL");
    let id = data.id.clone();

    let first = spawn_round(&system, &CancellationToken::new(), data.clone());
    publisher.wait_for(1).await;
    system.submit_vote(vote(&id, "v1", false, 1.0)).unwrap();
    assert!(!first.await.unwrap().unwrap().accepted);
    assert!(system.vote_result(&id).is_ok());

    tokio::time::sleep(Duration::from_secs(10)).await;
    let second = spawn_round(&system, &CancellationToken::new(), data);
    publisher.wait_for(2).await;
    assert_eq!(system.session_details(&id).unwrap().status, SessionStatus::Active);

    // Past the first session's grace window; its cleanup must not evict the
    // replacement.
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(system.active_sessions().len(), 1);
    system.submit_vote(vote(&id, "v1", true, 1.0)).unwrap();
    assert!(second.await.unwrap().unwrap().accepted);
    assert_eq!(system.stats().sessions_started, 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_submitters_conclude_once() {
    let (system, publisher) = setup(3, 0.5);
    let data = item("INTC");
    let id = data.id.clone();

    let round = spawn_round(&system, &CancellationToken::new(), data);
    publisher.wait_for(1).await;

    let submitters: Vec<_> = (0..10)
        .map(|i| {
            let system = Arc::clone(&system);
            let v = vote(&id, &format!("v{}", i), true, 0.9);
            tokio::spawn(async move { system.submit_vote(v) })
        })
        .collect();
    for s in submitters {
        // Submitters arriving after conclusion are refused, not counted.
        let _ = s.await.unwrap();
    }

    let result = round.await.unwrap().unwrap();
    assert!(result.accepted);
    assert_eq!(result.vote_count, 3);
    assert_eq!(system.stats().sessions_complete, 1);
}

#[tokio::test(start_paused = true)]
async fn test_config_applies_to_new_sessions_only() {
    let (system, publisher) = setup(2, 0.5);
    let first = item("A");
    let first_id = first.id.clone();

    let round = spawn_round(&system, &CancellationToken::new(), first);
    publisher.wait_for(1).await;

    system
        .update_config(VotingConfig {
            voting_timeout: TIMEOUT,
            min_voters: 1,
            quorum: 0.5,
        })
        .unwrap();

    // Still needs two voters.
    system.submit_vote(vote(&first_id, "v1", true, 1.0)).unwrap();
    assert_eq!(system.session_details(&first_id).unwrap().status, SessionStatus::Active);
    system.submit_vote(vote(&first_id, "v2", true, 1.0)).unwrap();
    assert_eq!(round.await.unwrap().unwrap().vote_count, 2);

    let second = item("B");
    let second_id = second.id.clone();
    let round = spawn_round(&system, &CancellationToken::new(), second);
    publisher.wait_for(2).await;
    assert_eq!(publisher.requests()[1].min_votes, 1);
    system.submit_vote(vote(&second_id, "v1", true, 1.0)).unwrap();
    assert_eq!(round.await.unwrap().unwrap().vote_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_batch_results_in_input_order() {
    let (system, publisher) = setup(1, 0.5);
    let items = vec![item("X"), item("Y"), item("Z")];
    let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();

    let batch = {
        let system = Arc::clone(&system);
        tokio::spawn(async move { system.batch_voting(&CancellationToken::new(), items).await })
    };
    publisher.wait_for(3).await;

    for id in ids.iter().rev() {
        system.submit_vote(vote(id, "v1", true, 1.0)).unwrap();
    }

    let results = batch.await.unwrap().unwrap();
    let result_ids: Vec<&str> = results.iter().map(|r| r.market_data_id.as_str()).collect();
    assert_eq!(result_ids, ids.iter().map(String::as_str).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_batch_reports_first_failure() {
    let (system, publisher) = setup(1, 0.5);
    let items = vec![item("X"), item("Y"), item("Z")];
    let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();

    let batch = {
        let system = Arc::clone(&system);
        tokio::spawn(async move { system.batch_voting(&CancellationToken::new(), items).await })
    };
    publisher.wait_for(3).await;

    system.submit_vote(vote(&ids[0], "v1", true, 1.0)).unwrap();
    system.submit_vote(vote(&ids[2], "v1", true, 1.0)).unwrap();

    let err = batch.await.unwrap().unwrap_err();
    match &err {
        VotingError::Batch { index, .. } => assert_eq!(*index, 1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.result().unwrap().market_data_id, ids[1]);
}
