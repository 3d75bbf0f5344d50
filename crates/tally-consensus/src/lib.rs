//! # Validation Voting
//!
//! Reputation-weighted voting on market data items.
//!
//! ## Round Lifecycle
//!
//! 1. `start_voting` opens a session for the item and broadcasts a vote
//!    request on the `validation` topic
//! 2. Validators answer with signed votes, fed in through `submit_vote`
//! 3. The session concludes once enough distinct validators have voted and
//!    their combined confidence reaches quorum
//! 4. The caller receives the weighted result, or a failed result on
//!    timeout, cancellation or broadcast failure
//!
//! ## Session States
//!
//! ```text
//! Active ──► Complete   (quorum reached)
//!    │
//!    └─────► Failed     (timeout / cancelled / broadcast error)
//! ```
//!
//! Terminal sessions stay indexed for one voting timeout so that late
//! votes are rejected rather than reported as unknown.

pub mod error;
pub mod messages;
pub mod metrics;
pub mod promise;
pub mod session;
pub mod voting;

pub use error::{Result, VotingError};
pub use messages::{VoteRequest, VALIDATION_TOPIC};
pub use metrics::{VotingMetrics, VotingStats};
pub use promise::{promise, ResultOutcome, ResultPromise};
pub use session::{
    should_conclude, tally, SessionParams, SessionStatus, Tally, VoteDetails, VotingSession,
    VotingSessionDetails, VotingSessionInfo,
};
pub use voting::{VotingConfig, VotingSystem};
