//! # Tally Core
//!
//! Shared data model for the Tally validation network.
//!
//! This crate provides the building blocks every other crate speaks in:
//! - `MarketData` - the item a voting round validates
//! - `Vote` / `VoteResult` - a validator's judgment and the round outcome
//! - `Peer` / `PeerAddrInfo` - what the network knows about a remote node
//! - `Repository` - the persistence capability finalized records go through
//!
//! ## Flow
//!
//! ```text
//!   MarketData ──► voting round ──► Vote × n ──► VoteResult
//!                      │                             │
//!                      ▼                             ▼
//!                 Peer topology                 Repository
//! ```

pub mod error;
pub mod market_data;
pub mod peer;
pub mod repository;
pub mod types;
pub mod vote;

pub use error::*;
pub use market_data::*;
pub use peer::*;
pub use repository::*;
pub use types::*;
pub use vote::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{ErrorKind, Result, TallyError};
    pub use crate::market_data::{DataType, MarketData};
    pub use crate::peer::{Peer, PeerAddrInfo, PeerRole};
    pub use crate::repository::{MemoryRepository, Repository};
    pub use crate::types::PeerId;
    pub use crate::vote::{Vote, VoteResult};
}
