//! # Voting Session
//!
//! One voting round for one market data item.
//!
//! A session holds at most one vote per validator (a later vote from the
//! same validator replaces the earlier one) and is evaluated with the
//! parameters that were in force when it was opened.
//!
//! ```text
//!            add_vote
//!              │
//!   ┌──────────▼──────────┐  count ≥ min_voters
//!   │       Active        │  and Σconf ≥ quorum   ┌──────────┐
//!   │ validator ─► Vote   ├──────────────────────►│ Complete │
//!   └──────────┬──────────┘                       └──────────┘
//!              │ timeout / cancel / broadcast error
//!              ▼
//!         ┌────────┐
//!         │ Failed │
//!         └────────┘
//! ```

use crate::error::{Result, VotingError};
use crate::promise::{promise, ResultOutcome, ResultPromise};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tally_core::{PeerId, Vote, VoteResult};
use tokio::time::Instant;

/// Parameters a session is evaluated with
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    pub timeout: Duration,
    pub min_voters: usize,
    pub quorum: f64,
}

/// Session status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Complete,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Weighted tally over a vote set
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tally {
    pub vote_count: usize,
    /// Σ confidence of all votes
    pub total_weight: f64,
    /// Σ confidence of votes judging the item valid
    pub valid_weight: f64,
    pub score: f64,
    pub accepted: bool,
}

/// Whether a vote set is enough to conclude a round.
///
/// `votes` must hold one vote per validator.
pub fn should_conclude<'a, I>(votes: I, params: &SessionParams) -> bool
where
    I: IntoIterator<Item = &'a Vote>,
{
    let mut count = 0usize;
    let mut weight = 0.0f64;
    for vote in votes {
        count += 1;
        weight += vote.confidence;
    }
    count >= params.min_voters && weight >= params.quorum
}

/// Confidence-weighted score of a vote set.
///
/// The score is 0 when the total weight is 0.
pub fn tally<'a, I>(votes: I, quorum: f64) -> Tally
where
    I: IntoIterator<Item = &'a Vote>,
{
    let mut vote_count = 0usize;
    let mut total_weight = 0.0f64;
    let mut valid_weight = 0.0f64;

    for vote in votes {
        vote_count += 1;
        total_weight += vote.confidence;
        if vote.is_valid {
            valid_weight += vote.confidence;
        }
    }

    let score = if total_weight > 0.0 {
        valid_weight / total_weight
    } else {
        0.0
    };

    Tally {
        vote_count,
        total_weight,
        valid_weight,
        score,
        accepted: score >= quorum,
    }
}

/// Summary of a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VotingSessionInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub vote_count: usize,
}

/// One vote as listed in session details
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteDetails {
    pub validator_id: PeerId,
    pub is_valid: bool,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Full view of a session, votes included
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VotingSessionDetails {
    pub id: String,
    pub market_data_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub vote_count: usize,
    /// Sorted by validator id
    pub votes: Vec<VoteDetails>,
}

struct SessionState {
    votes: HashMap<PeerId, Vote>,
    status: SessionStatus,
    ended_at: Option<DateTime<Utc>>,
    result: Option<VoteResult>,
    promise: ResultPromise,
}

/// A voting round for one item
pub struct VotingSession {
    id: String,
    params: SessionParams,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<SessionState>,
}

impl VotingSession {
    /// Open a session. The returned outcome resolves once the session
    /// reaches a terminal state.
    pub fn new(id: impl Into<String>, params: SessionParams) -> (Self, ResultOutcome) {
        let (promise, outcome) = promise();
        let session = Self {
            id: id.into(),
            params,
            started_at: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(SessionState {
                votes: HashMap::new(),
                status: SessionStatus::Active,
                ended_at: None,
                result: None,
                promise,
            }),
        };
        (session, outcome)
    }

    /// Session id; the id of the item being validated
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since the session was opened
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    pub fn vote_count(&self) -> usize {
        self.state.lock().votes.len()
    }

    /// Terminal result, once there is one
    pub fn result(&self) -> Option<VoteResult> {
        self.state.lock().result.clone()
    }

    /// Record a vote, replacing any earlier vote by the same validator
    pub fn add_vote(&self, vote: Vote) -> Result<()> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return Err(VotingError::SessionNotActive(self.id.clone()));
        }
        state.votes.insert(vote.validator_id.clone(), vote);
        Ok(())
    }

    /// Whether the current vote set is enough to conclude
    pub fn should_conclude(&self) -> bool {
        let state = self.state.lock();
        should_conclude(state.votes.values(), &self.params)
    }

    /// Weighted result over the current vote set
    pub fn calculate_result(&self) -> VoteResult {
        let state = self.state.lock();
        self.build_result(&state)
    }

    fn build_result(&self, state: &SessionState) -> VoteResult {
        let t = tally(state.votes.values(), self.params.quorum);
        VoteResult {
            market_data_id: self.id.clone(),
            accepted: t.accepted,
            vote_count: t.vote_count,
            score: t.score,
            completed_at: Utc::now(),
            error_msg: None,
        }
    }

    /// Move to Complete if still Active and the conclusion condition holds.
    /// Returns the result only for the call that made the transition.
    pub(crate) fn conclude(&self) -> Option<VoteResult> {
        let mut state = self.state.lock();
        if state.status.is_terminal() || !should_conclude(state.votes.values(), &self.params) {
            return None;
        }

        let result = self.build_result(&state);
        state.status = SessionStatus::Complete;
        state.ended_at = Some(result.completed_at);
        state.result = Some(result.clone());
        state.promise.fulfill(result.clone());
        Some(result)
    }

    /// Move to Failed if still Active.
    /// Returns the failed result only for the call that made the transition.
    pub(crate) fn fail(&self, reason: &str) -> Option<VoteResult> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return None;
        }

        let result = VoteResult::failed(self.id.clone(), state.votes.len(), reason);
        state.status = SessionStatus::Failed;
        state.ended_at = Some(result.completed_at);
        state.result = Some(result.clone());
        state.promise.fulfill(result.clone());
        Some(result)
    }

    pub fn info(&self) -> VotingSessionInfo {
        let state = self.state.lock();
        VotingSessionInfo {
            id: self.id.clone(),
            started_at: self.started_at,
            status: state.status,
            vote_count: state.votes.len(),
        }
    }

    pub fn details(&self) -> VotingSessionDetails {
        let state = self.state.lock();
        let mut votes: Vec<VoteDetails> = state
            .votes
            .values()
            .map(|v| VoteDetails {
                validator_id: v.validator_id.clone(),
                is_valid: v.is_valid,
                confidence: v.confidence,
                timestamp: v.timestamp,
            })
            .collect();
        votes.sort_by(|a, b| a.validator_id.as_str().cmp(b.validator_id.as_str()));

        VotingSessionDetails {
            id: self.id.clone(),
            market_data_id: self.id.clone(),
            started_at: self.started_at,
            ended_at: state.ended_at,
            status: state.status,
            vote_count: state.votes.len(),
            votes,
        }
    }
}

impl fmt::Debug for VotingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VotingSession")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("votes", &state.votes.len())
            .finish()
    }
}
