//! Votes and voting round outcomes

use crate::error::{Result, TallyError};
use crate::types::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A validator's judgment on one market data item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Item the vote is about
    pub market_data_id: String,
    /// Peer that cast the vote
    pub validator_id: PeerId,
    /// Validity judgment
    pub is_valid: bool,
    /// Weight of the vote, in [0, 1]
    pub confidence: f64,
    /// Opaque signature bytes
    #[serde(default)]
    pub signature: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Vote {
    /// Create an unsigned vote stamped with the current time
    pub fn new(
        market_data_id: impl Into<String>,
        validator_id: PeerId,
        is_valid: bool,
        confidence: f64,
    ) -> Self {
        Self {
            market_data_id: market_data_id.into(),
            validator_id,
            is_valid,
            confidence,
            signature: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a signature
    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    /// Check the vote is well formed
    pub fn validate(&self) -> Result<()> {
        if self.market_data_id.is_empty() {
            return Err(TallyError::Validation("vote has empty market data id".into()));
        }
        if self.validator_id.is_empty() {
            return Err(TallyError::Validation("vote has empty validator id".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(TallyError::Validation(format!(
                "confidence must be in [0, 1], got {}",
                self.confidence
            )));
        }
        if self.signature.is_empty() {
            return Err(TallyError::Validation("vote is missing a signature".into()));
        }
        Ok(())
    }
}

/// Outcome of a voting round
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResult {
    pub market_data_id: String,
    /// Whether the weighted score reached quorum
    pub accepted: bool,
    /// Number of distinct validators counted
    pub vote_count: usize,
    /// Σ(valid confidence) / Σ(confidence)
    pub score: f64,
    pub completed_at: DateTime<Utc>,
    /// Failure reason for rounds that did not conclude
    #[serde(default)]
    pub error_msg: Option<String>,
}

impl VoteResult {
    /// Result of a round that never reached quorum
    pub fn failed(market_data_id: impl Into<String>, vote_count: usize, reason: impl Into<String>) -> Self {
        Self {
            market_data_id: market_data_id.into(),
            accepted: false,
            vote_count,
            score: 0.0,
            completed_at: Utc::now(),
            error_msg: Some(reason.into()),
        }
    }

    /// Whether the round failed rather than concluded
    pub fn is_failure(&self) -> bool {
        self.error_msg.is_some()
    }
}
